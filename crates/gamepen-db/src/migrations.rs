use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);"
    )?;

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("DB: running migration v1 (users, chat and direct messages)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                username    TEXT NOT NULL UNIQUE,
                email       TEXT NOT NULL UNIQUE COLLATE NOCASE,
                password    TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE chat_messages (
                id          TEXT PRIMARY KEY,
                user_id     TEXT NOT NULL,
                username    TEXT NOT NULL,
                message     TEXT NOT NULL,
                genre       TEXT NOT NULL,
                timestamp   TEXT NOT NULL,
                created_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX idx_chat_messages_genre
                ON chat_messages(genre, timestamp);
            CREATE INDEX idx_chat_messages_timestamp
                ON chat_messages(timestamp);

            CREATE TABLE direct_messages (
                id              TEXT PRIMARY KEY,
                from_user_id    TEXT NOT NULL,
                from_username   TEXT NOT NULL,
                to_user_id      TEXT NOT NULL,
                message         TEXT NOT NULL,
                timestamp       TEXT NOT NULL,
                created_at      TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX idx_direct_messages_pair
                ON direct_messages(from_user_id, to_user_id, timestamp);
            CREATE INDEX idx_direct_messages_timestamp
                ON direct_messages(timestamp);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
