use crate::models::{ChatMessageRow, DirectMessageRow, UserRow};
use crate::{Database, TIMESTAMP_FORMAT};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

use gamepen_types::models::{ChatMessage, DirectMessage};

/// Rows removed by one retention sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub chat_messages: usize,
    pub direct_messages: usize,
}

impl SweepStats {
    pub fn total(&self) -> usize {
        self.chat_messages + self.direct_messages
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

impl Database {
    // -- Users --

    /// Insert a user and return its row id, or `None` when the username or
    /// email is already taken.
    pub fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<Option<i64>> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (username, email, password) VALUES (?1, ?2, ?3)",
                (username, email, password_hash),
            );
            match inserted {
                Ok(_) => Ok(Some(conn.last_insert_rowid())),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// True when either the username or the email is already registered.
    pub fn user_exists(&self, username: &str, email: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE username = ?1 OR email = ?2",
                (username, email),
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    // -- Chat messages --

    pub fn insert_chat_message(&self, msg: &ChatMessage) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO chat_messages (id, user_id, username, message, genre, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    msg.id,
                    msg.user_id,
                    msg.username,
                    msg.message,
                    msg.genre,
                    format_timestamp(&msg.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    /// Full history of a genre channel, oldest first.
    pub fn get_chat_messages(&self, genre: &str) -> Result<Vec<ChatMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, username, message, genre, timestamp
                 FROM chat_messages
                 WHERE genre = ?1
                 ORDER BY timestamp ASC, rowid ASC",
            )?;

            let rows = stmt
                .query_map([genre], |row| {
                    Ok(ChatMessageRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        username: row.get(2)?,
                        message: row.get(3)?,
                        genre: row.get(4)?,
                        timestamp: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Direct messages --

    pub fn insert_direct_message(&self, msg: &DirectMessage) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO direct_messages (id, from_user_id, from_username, to_user_id, message, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    msg.id,
                    msg.from_user_id,
                    msg.from_username,
                    msg.to_user_id,
                    msg.message,
                    format_timestamp(&msg.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    /// Conversation between two users in both directions, oldest first.
    pub fn get_direct_messages(&self, user_a: &str, user_b: &str) -> Result<Vec<DirectMessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_user_id, from_username, to_user_id, message, timestamp
                 FROM direct_messages
                 WHERE (from_user_id = ?1 AND to_user_id = ?2)
                    OR (from_user_id = ?2 AND to_user_id = ?1)
                 ORDER BY timestamp ASC, rowid ASC",
            )?;

            let rows = stmt
                .query_map([user_a, user_b], |row| {
                    Ok(DirectMessageRow {
                        id: row.get(0)?,
                        from_user_id: row.get(1)?,
                        from_username: row.get(2)?,
                        to_user_id: row.get(3)?,
                        message: row.get(4)?,
                        timestamp: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Retention --

    /// Delete every chat and direct message stamped before `cutoff`.
    pub fn delete_messages_before(&self, cutoff: DateTime<Utc>) -> Result<SweepStats> {
        let cutoff = format_timestamp(&cutoff);
        self.with_conn_mut(|conn| {
            let chat_messages =
                conn.execute("DELETE FROM chat_messages WHERE timestamp < ?1", [&cutoff])?;
            let direct_messages =
                conn.execute("DELETE FROM direct_messages WHERE timestamp < ?1", [&cutoff])?;
            Ok(SweepStats {
                chat_messages,
                direct_messages,
            })
        })
    }
}

fn query_user<P: rusqlite::ToSql>(conn: &Connection, column: &str, value: P) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, email, password, created_at FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                email: row.get(2)?,
                password: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
