use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message posted to a genre channel, as seen on the wire.
/// The same `id` is used for the live broadcast and the persisted row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub username: String,
    pub message: String,
    pub genre: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub id: String,
    pub from_user_id: String,
    pub from_username: String,
    pub to_user_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One entry of a channel's member list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUser {
    pub user_id: String,
    pub username: String,
}
