//! Database row types, mapped directly from SQLite rows.
//! Conversions into the gamepen-types wire models live here so handlers
//! never parse stored text themselves.

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::warn;

use gamepen_types::api::UserProfile;
use gamepen_types::models::{ChatMessage, DirectMessage};

pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password: String,
    pub created_at: String,
}

pub struct ChatMessageRow {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub genre: String,
    pub timestamp: String,
}

pub struct DirectMessageRow {
    pub id: String,
    pub from_user_id: String,
    pub from_username: String,
    pub to_user_id: String,
    pub message: String,
    pub timestamp: String,
}

/// Parse a stored timestamp. Message rows use RFC 3339; SQLite's
/// `datetime('now')` defaults are "YYYY-MM-DD HH:MM:SS" in UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc()))
        .ok()
}

fn timestamp_or_default(raw: &str, row_id: &str) -> DateTime<Utc> {
    parse_timestamp(raw).unwrap_or_else(|| {
        warn!("Corrupt timestamp '{}' on row '{}'", raw, row_id);
        DateTime::default()
    })
}

impl From<UserRow> for UserProfile {
    fn from(row: UserRow) -> Self {
        let created_at = timestamp_or_default(&row.created_at, &row.id.to_string());
        UserProfile {
            id: row.id,
            username: row.username,
            email: row.email,
            created_at,
        }
    }
}

impl From<ChatMessageRow> for ChatMessage {
    fn from(row: ChatMessageRow) -> Self {
        let timestamp = timestamp_or_default(&row.timestamp, &row.id);
        ChatMessage {
            id: row.id,
            user_id: row.user_id,
            username: row.username,
            message: row.message,
            genre: row.genre,
            timestamp,
        }
    }
}

impl From<DirectMessageRow> for DirectMessage {
    fn from(row: DirectMessageRow) -> Self {
        let timestamp = timestamp_or_default(&row.timestamp, &row.id);
        DirectMessage {
            id: row.id,
            from_user_id: row.from_user_id,
            from_username: row.from_username,
            to_user_id: row.to_user_id,
            message: row.message,
            timestamp,
        }
    }
}
