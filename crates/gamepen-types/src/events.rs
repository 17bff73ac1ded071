use serde::{Deserialize, Deserializer, Serialize};

use crate::models::{ChannelUser, ChatMessage, DirectMessage};

/// Events sent FROM client TO server over the websocket.
/// Each frame is `{"event": "<kebab-case name>", "data": <payload>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Attach a display name and external user id to the connection
    SetUserInfo(UserInfo),

    JoinGenreChannel(String),

    LeaveGenreChannel(String),

    SendGenreMessage(GenreMessageSend),

    SendDirectMessage(DirectMessageSend),

    LoadDirectMessages(DirectHistoryRequest),

    TypingStart(TypingStart),

    TypingStop(TypingStop),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: String,
    #[serde(deserialize_with = "external_id")]
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenreMessageSend {
    pub genre: String,
    pub message: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessageSend {
    #[serde(deserialize_with = "external_id")]
    pub to_user_id: String,
    pub message: String,
    pub from_username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectHistoryRequest {
    #[serde(deserialize_with = "external_id")]
    pub from_user_id: String,
    #[serde(deserialize_with = "external_id")]
    pub to_user_id: String,
}

/// Typing targets either a genre channel or a single user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStart {
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default, deserialize_with = "optional_external_id")]
    pub to_user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStop {
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default, deserialize_with = "optional_external_id")]
    pub to_user_id: Option<String>,
}

/// Events sent FROM server TO client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// First frame on every connection
    Connected(ConnectionInfo),

    UserJoined(PresenceNotice),

    UserLeft(PresenceNotice),

    ChannelUsers(ChannelUsers),

    GenreMessagesLoaded(GenreHistory),

    GenreMessagesError(GenreError),

    GenreMessage(ChatMessage),

    DirectMessage(DirectMessage),

    /// Echo to the sender of a direct message
    DirectMessageSent(DirectMessage),

    DirectMessagesLoaded(Vec<DirectMessage>),

    DirectMessagesError(ErrorNotice),

    UserTyping(TypingNotice),

    UserStoppedTyping(TypingNotice),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: String,
    pub username: String,
    pub genre: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUsers {
    pub genre: String,
    pub users: Vec<ChannelUser>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenreHistory {
    pub genre: String,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenreError {
    pub genre: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
}

/// Clients send user ids either as JSON strings or as numbers.
#[derive(Deserialize)]
#[serde(untagged)]
enum ExternalIdRepr {
    Text(String),
    Number(i64),
}

impl From<ExternalIdRepr> for String {
    fn from(repr: ExternalIdRepr) -> Self {
        match repr {
            ExternalIdRepr::Text(s) => s,
            ExternalIdRepr::Number(n) => n.to_string(),
        }
    }
}

fn external_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    ExternalIdRepr::deserialize(deserializer).map(String::from)
}

fn optional_external_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Ok(Option::<ExternalIdRepr>::deserialize(deserializer)?.map(String::from))
}
