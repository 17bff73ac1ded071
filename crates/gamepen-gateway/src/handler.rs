use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gamepen_db::Database;
use gamepen_types::events::{
    ChannelUsers, ClientEvent, ConnectionInfo, DirectHistoryRequest, DirectMessageSend,
    ErrorNotice, GenreError, GenreHistory, GenreMessageSend, PresenceNotice, ServerEvent,
    TypingNotice, TypingStart, TypingStop, UserInfo,
};
use gamepen_types::models::{ChatMessage, DirectMessage};

use crate::dispatcher::Dispatcher;
use crate::presence::ConnectionIdentity;

/// Realtime gateway: presence, fan-out and best-effort persistence.
///
/// Posts are broadcast first and persisted afterwards on a detached blocking
/// task. A failed insert is logged and never reported to the sender.
#[derive(Clone)]
pub struct Gateway {
    dispatcher: Dispatcher,
    db: Arc<Database>,
}

impl Gateway {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            db,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Register a connection and queue its `connected` event. A known
    /// identity (from a verified token) is attached straight away.
    pub async fn connect(
        &self,
        identity: Option<UserInfo>,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let (conn_id, rx) = self.dispatcher.register_connection().await;

        if let Some(info) = identity {
            self.dispatcher.identify(conn_id, info.username, info.user_id).await;
        }

        self.dispatcher
            .send_to_connection(
                conn_id,
                ServerEvent::Connected(ConnectionInfo {
                    connection_id: conn_id.to_string(),
                }),
            )
            .await;

        (conn_id, rx)
    }

    pub async fn handle_event(&self, conn_id: Uuid, event: ClientEvent) {
        match event {
            ClientEvent::SetUserInfo(info) => self.identify(conn_id, info).await,
            ClientEvent::JoinGenreChannel(genre) => self.join_channel(conn_id, genre).await,
            ClientEvent::LeaveGenreChannel(genre) => self.leave_channel(conn_id, &genre).await,
            ClientEvent::SendGenreMessage(send) => self.post_channel_message(conn_id, send).await,
            ClientEvent::SendDirectMessage(send) => self.post_direct_message(conn_id, send).await,
            ClientEvent::LoadDirectMessages(req) => self.load_direct_history(conn_id, req).await,
            ClientEvent::TypingStart(typing) => self.typing_start(conn_id, typing).await,
            ClientEvent::TypingStop(typing) => self.typing_stop(conn_id, typing).await,
        }
    }

    /// Remove the connection from every channel it joined, telling the
    /// remaining members, and forget its identity.
    pub async fn disconnect(&self, conn_id: Uuid) {
        let Some(identity) = self.dispatcher.unregister_connection(conn_id).await else {
            return;
        };

        for genre in &identity.channels {
            self.dispatcher
                .send_to_channel(genre, ServerEvent::UserLeft(presence_notice(&identity, genre)), None)
                .await;
        }

        info!(
            "{} ({}) disconnected, left {} channels ({} active channels remain)",
            identity.display_name,
            identity.external_id,
            identity.channels.len(),
            self.dispatcher.channel_count().await
        );
    }

    async fn identify(&self, conn_id: Uuid, info: UserInfo) {
        let identity = self
            .dispatcher
            .identify(conn_id, info.username, info.user_id)
            .await;
        info!(
            "Connection {} identified as {} ({})",
            conn_id, identity.display_name, identity.external_id
        );
    }

    async fn join_channel(&self, conn_id: Uuid, genre: String) {
        if genre.is_empty() {
            warn!("Connection {} tried to join an empty channel name", conn_id);
            return;
        }

        let outcome = self.dispatcher.join_channel(conn_id, &genre).await;

        if outcome.newly_joined {
            info!(
                "{} ({}) joined '{}'",
                outcome.identity.display_name, outcome.identity.external_id, genre
            );
            self.dispatcher
                .send_to_channel(
                    &genre,
                    ServerEvent::UserJoined(presence_notice(&outcome.identity, &genre)),
                    Some(conn_id),
                )
                .await;
        }

        self.dispatcher
            .send_to_connection(
                conn_id,
                ServerEvent::ChannelUsers(ChannelUsers {
                    genre: genre.clone(),
                    users: outcome.members,
                }),
            )
            .await;

        // History load failure never undoes the join
        let db = self.db.clone();
        let query_genre = genre.clone();
        let loaded = tokio::task::spawn_blocking(move || db.get_chat_messages(&query_genre))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|rows| rows);

        let event = match loaded {
            Ok(rows) => ServerEvent::GenreMessagesLoaded(GenreHistory {
                genre,
                messages: rows.into_iter().map(ChatMessage::from).collect(),
            }),
            Err(e) => {
                error!("Failed to load history for '{}': {}", genre, e);
                ServerEvent::GenreMessagesError(GenreError {
                    genre,
                    message: "Failed to load messages".to_string(),
                })
            }
        };
        self.dispatcher.send_to_connection(conn_id, event).await;
    }

    async fn leave_channel(&self, conn_id: Uuid, genre: &str) {
        let Some(identity) = self.dispatcher.leave_channel(conn_id, genre).await else {
            return;
        };

        info!("{} ({}) left '{}'", identity.display_name, identity.external_id, genre);
        self.dispatcher
            .send_to_channel(genre, ServerEvent::UserLeft(presence_notice(&identity, genre)), None)
            .await;
    }

    async fn post_channel_message(&self, conn_id: Uuid, send: GenreMessageSend) {
        if send.genre.is_empty() || send.message.trim().is_empty() {
            warn!("Connection {} sent an empty channel message, dropping", conn_id);
            return;
        }

        let identity = self.identity_of(conn_id).await;
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            user_id: identity.external_id,
            username: send.username,
            message: send.message,
            genre: send.genre,
            timestamp: Utc::now(),
        };

        let delivered = self
            .dispatcher
            .send_to_channel(&message.genre, ServerEvent::GenreMessage(message.clone()), None)
            .await;
        debug!("Message {} to '{}' delivered to {} connections", message.id, message.genre, delivered);

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = db.insert_chat_message(&message) {
                error!("Failed to persist message {} in '{}': {}", message.id, message.genre, e);
            }
        });
    }

    async fn post_direct_message(&self, conn_id: Uuid, send: DirectMessageSend) {
        if send.to_user_id.is_empty() || send.message.trim().is_empty() {
            warn!("Connection {} sent an empty direct message, dropping", conn_id);
            return;
        }

        let identity = self.identity_of(conn_id).await;
        let message = DirectMessage {
            id: Uuid::new_v4().to_string(),
            from_user_id: identity.external_id,
            from_username: send.from_username,
            to_user_id: send.to_user_id,
            message: send.message,
            timestamp: Utc::now(),
        };

        let delivered = self
            .dispatcher
            .send_to_user(&message.to_user_id, ServerEvent::DirectMessage(message.clone()))
            .await;
        if delivered == 0 {
            debug!("Direct message {} recipient {} is offline", message.id, message.to_user_id);
        }

        self.dispatcher
            .send_to_connection(conn_id, ServerEvent::DirectMessageSent(message.clone()))
            .await;

        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = db.insert_direct_message(&message) {
                error!("Failed to persist direct message {}: {}", message.id, e);
            }
        });
    }

    async fn load_direct_history(&self, conn_id: Uuid, req: DirectHistoryRequest) {
        let db = self.db.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            db.get_direct_messages(&req.from_user_id, &req.to_user_id)
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|rows| rows);

        let event = match loaded {
            Ok(rows) => ServerEvent::DirectMessagesLoaded(
                rows.into_iter().map(DirectMessage::from).collect(),
            ),
            Err(e) => {
                error!("Failed to load direct messages for {}: {}", conn_id, e);
                ServerEvent::DirectMessagesError(ErrorNotice {
                    message: "Failed to load direct messages".to_string(),
                })
            }
        };
        self.dispatcher.send_to_connection(conn_id, event).await;
    }

    async fn typing_start(&self, conn_id: Uuid, typing: TypingStart) {
        let identity = self.identity_of(conn_id).await;
        let username = typing.username.unwrap_or_else(|| identity.display_name.clone());
        self.relay_typing(conn_id, &identity, username, typing.genre, typing.to_user_id, true)
            .await;
    }

    async fn typing_stop(&self, conn_id: Uuid, typing: TypingStop) {
        let identity = self.identity_of(conn_id).await;
        let username = identity.display_name.clone();
        self.relay_typing(conn_id, &identity, username, typing.genre, typing.to_user_id, false)
            .await;
    }

    async fn relay_typing(
        &self,
        conn_id: Uuid,
        identity: &ConnectionIdentity,
        username: String,
        genre: Option<String>,
        to_user_id: Option<String>,
        started: bool,
    ) {
        let notice = TypingNotice {
            user_id: identity.external_id.clone(),
            username,
            genre: genre.clone(),
        };
        let event = if started {
            ServerEvent::UserTyping(notice)
        } else {
            ServerEvent::UserStoppedTyping(notice)
        };

        match (genre, to_user_id) {
            (Some(genre), _) => {
                self.dispatcher.send_to_channel(&genre, event, Some(conn_id)).await;
            }
            (None, Some(to_user_id)) => {
                self.dispatcher.send_to_user(&to_user_id, event).await;
            }
            (None, None) => warn!("Connection {} sent a typing event without a target", conn_id),
        }
    }

    async fn identity_of(&self, conn_id: Uuid) -> ConnectionIdentity {
        self.dispatcher
            .identity(conn_id)
            .await
            .unwrap_or_else(|| ConnectionIdentity::anonymous(conn_id))
    }
}

fn presence_notice(identity: &ConnectionIdentity, genre: &str) -> PresenceNotice {
    PresenceNotice {
        user_id: identity.external_id.clone(),
        username: identity.display_name.clone(),
        genre: genre.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gateway() -> Gateway {
        Gateway::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn identified(gw: &Gateway, username: &str, user_id: &str) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let (conn_id, mut rx) = gw.connect(None).await;
        gw.handle_event(
            conn_id,
            ClientEvent::SetUserInfo(UserInfo {
                username: username.to_string(),
                user_id: user_id.to_string(),
            }),
        )
        .await;
        drain(&mut rx);
        (conn_id, rx)
    }

    async fn wait_for_chat_rows(gw: &Gateway, genre: &str, count: usize) {
        for _ in 0..100 {
            if gw.db.get_chat_messages(genre).unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("messages for '{}' were never persisted", genre);
    }

    async fn wait_for_direct_rows(gw: &Gateway, a: &str, b: &str, count: usize) {
        for _ in 0..100 {
            if gw.db.get_direct_messages(a, b).unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("direct messages were never persisted");
    }

    #[tokio::test]
    async fn connect_announces_connection_id() {
        let gw = gateway();
        let (conn_id, mut rx) = gw.connect(None).await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::Connected(ConnectionInfo { connection_id: conn_id.to_string() })]
        );
    }

    #[tokio::test]
    async fn alice_and_bob_chat_in_action() {
        let gw = gateway();
        let (alice, mut rx_alice) = identified(&gw, "alice", "1").await;
        let (bob, mut rx_bob) = identified(&gw, "bob", "2").await;

        gw.handle_event(alice, ClientEvent::JoinGenreChannel("Action".into())).await;
        let events = drain(&mut rx_alice);
        assert_eq!(
            events,
            vec![
                ServerEvent::ChannelUsers(ChannelUsers {
                    genre: "Action".into(),
                    users: vec![gamepen_types::models::ChannelUser {
                        user_id: "1".into(),
                        username: "alice".into(),
                    }],
                }),
                ServerEvent::GenreMessagesLoaded(GenreHistory {
                    genre: "Action".into(),
                    messages: vec![],
                }),
            ]
        );

        gw.handle_event(bob, ClientEvent::JoinGenreChannel("Action".into())).await;
        assert_eq!(
            drain(&mut rx_alice),
            vec![ServerEvent::UserJoined(PresenceNotice {
                user_id: "2".into(),
                username: "bob".into(),
                genre: "Action".into(),
            })]
        );
        match &drain(&mut rx_bob)[0] {
            ServerEvent::ChannelUsers(list) => assert_eq!(list.users.len(), 2),
            other => panic!("expected channel-users, got {:?}", other),
        }

        gw.handle_event(
            alice,
            ClientEvent::SendGenreMessage(GenreMessageSend {
                genre: "Action".into(),
                message: "hello".into(),
                username: "alice".into(),
            }),
        )
        .await;

        let bob_events = drain(&mut rx_bob);
        assert_eq!(bob_events.len(), 1);
        let ServerEvent::GenreMessage(msg) = &bob_events[0] else {
            panic!("expected genre-message, got {:?}", bob_events[0]);
        };
        assert_eq!(msg.username, "alice");
        assert_eq!(msg.user_id, "1");
        assert_eq!(msg.message, "hello");
        assert_eq!(msg.genre, "Action");

        // Sender is a member too and gets its own copy
        assert_eq!(drain(&mut rx_alice).len(), 1);

        wait_for_chat_rows(&gw, "Action", 1).await;
        let history = gw.db.get_chat_messages("Action").unwrap();
        assert_eq!(history[0].id, msg.id);
        assert_eq!(history[0].message, "hello");
    }

    #[tokio::test]
    async fn late_joiner_gets_history_not_broadcast() {
        let gw = gateway();
        let (alice, mut rx_alice) = identified(&gw, "alice", "1").await;
        gw.handle_event(alice, ClientEvent::JoinGenreChannel("RPG".into())).await;

        for body in ["one", "two"] {
            gw.handle_event(
                alice,
                ClientEvent::SendGenreMessage(GenreMessageSend {
                    genre: "RPG".into(),
                    message: body.into(),
                    username: "alice".into(),
                }),
            )
            .await;
        }
        drain(&mut rx_alice);
        wait_for_chat_rows(&gw, "RPG", 2).await;

        let (carol, mut rx_carol) = identified(&gw, "carol", "3").await;
        gw.handle_event(carol, ClientEvent::JoinGenreChannel("RPG".into())).await;

        let events = drain(&mut rx_carol);
        assert_eq!(events.len(), 2);
        let ServerEvent::GenreMessagesLoaded(history) = &events[1] else {
            panic!("expected history, got {:?}", events[1]);
        };
        let bodies: Vec<&str> = history.messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two"]);
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::GenreMessage(_))));
    }

    #[tokio::test]
    async fn non_members_do_not_receive_channel_messages() {
        let gw = gateway();
        let (alice, mut rx_alice) = identified(&gw, "alice", "1").await;
        let (_bob, mut rx_bob) = identified(&gw, "bob", "2").await;
        gw.handle_event(alice, ClientEvent::JoinGenreChannel("Action".into())).await;
        drain(&mut rx_alice);

        gw.handle_event(
            alice,
            ClientEvent::SendGenreMessage(GenreMessageSend {
                genre: "Action".into(),
                message: "anyone?".into(),
                username: "alice".into(),
            }),
        )
        .await;

        assert!(drain(&mut rx_bob).is_empty());
        assert_eq!(drain(&mut rx_alice).len(), 1);
    }

    #[tokio::test]
    async fn leave_and_disconnect_notify_remaining_members() {
        let gw = gateway();
        let (alice, mut rx_alice) = identified(&gw, "alice", "1").await;
        let (bob, mut rx_bob) = identified(&gw, "bob", "2").await;
        for conn in [alice, bob] {
            gw.handle_event(conn, ClientEvent::JoinGenreChannel("Action".into())).await;
            gw.handle_event(conn, ClientEvent::JoinGenreChannel("Puzzle".into())).await;
        }
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        gw.handle_event(bob, ClientEvent::LeaveGenreChannel("Puzzle".into())).await;
        assert_eq!(
            drain(&mut rx_alice),
            vec![ServerEvent::UserLeft(PresenceNotice {
                user_id: "2".into(),
                username: "bob".into(),
                genre: "Puzzle".into(),
            })]
        );

        // Second leave is a no-op
        gw.handle_event(bob, ClientEvent::LeaveGenreChannel("Puzzle".into())).await;
        assert!(drain(&mut rx_alice).is_empty());

        gw.disconnect(bob).await;
        assert_eq!(
            drain(&mut rx_alice),
            vec![ServerEvent::UserLeft(PresenceNotice {
                user_id: "2".into(),
                username: "bob".into(),
                genre: "Action".into(),
            })]
        );

        gw.disconnect(alice).await;
        assert_eq!(gw.dispatcher().channel_count().await, 0);
        assert_eq!(gw.dispatcher().connection_count().await, 0);
    }

    #[tokio::test]
    async fn direct_message_reaches_all_recipient_connections_and_echoes() {
        let gw = gateway();
        let (alice, mut rx_alice) = identified(&gw, "alice", "1").await;
        let (_bob_phone, mut rx_phone) = identified(&gw, "bob", "2").await;
        let (_bob_laptop, mut rx_laptop) = identified(&gw, "bob", "2").await;

        gw.handle_event(
            alice,
            ClientEvent::SendDirectMessage(DirectMessageSend {
                to_user_id: "2".into(),
                message: "psst".into(),
                from_username: "alice".into(),
            }),
        )
        .await;

        for rx in [&mut rx_phone, &mut rx_laptop] {
            let events = drain(rx);
            assert_eq!(events.len(), 1);
            let ServerEvent::DirectMessage(dm) = &events[0] else {
                panic!("expected direct-message, got {:?}", events[0]);
            };
            assert_eq!(dm.from_user_id, "1");
            assert_eq!(dm.to_user_id, "2");
        }

        let echo = drain(&mut rx_alice);
        assert!(matches!(&echo[..], [ServerEvent::DirectMessageSent(dm)] if dm.message == "psst"));
    }

    #[tokio::test]
    async fn direct_message_to_offline_user_is_still_persisted() {
        let gw = gateway();
        let (alice, mut rx_alice) = identified(&gw, "alice", "1").await;

        gw.handle_event(
            alice,
            ClientEvent::SendDirectMessage(DirectMessageSend {
                to_user_id: "9".into(),
                message: "see you later".into(),
                from_username: "alice".into(),
            }),
        )
        .await;
        assert_eq!(drain(&mut rx_alice).len(), 1);

        wait_for_direct_rows(&gw, "1", "9", 1).await;

        gw.handle_event(
            alice,
            ClientEvent::LoadDirectMessages(DirectHistoryRequest {
                from_user_id: "9".into(),
                to_user_id: "1".into(),
            }),
        )
        .await;
        let events = drain(&mut rx_alice);
        let [ServerEvent::DirectMessagesLoaded(history)] = &events[..] else {
            panic!("expected direct-messages-loaded, got {:?}", events);
        };
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "see you later");
    }

    #[tokio::test]
    async fn typing_goes_to_other_members_or_target_user() {
        let gw = gateway();
        let (alice, mut rx_alice) = identified(&gw, "alice", "1").await;
        let (bob, mut rx_bob) = identified(&gw, "bob", "2").await;
        for conn in [alice, bob] {
            gw.handle_event(conn, ClientEvent::JoinGenreChannel("Action".into())).await;
        }
        drain(&mut rx_alice);
        drain(&mut rx_bob);

        gw.handle_event(
            alice,
            ClientEvent::TypingStart(TypingStart {
                genre: Some("Action".into()),
                to_user_id: None,
                username: Some("alice".into()),
            }),
        )
        .await;
        assert!(drain(&mut rx_alice).is_empty());
        assert_eq!(
            drain(&mut rx_bob),
            vec![ServerEvent::UserTyping(TypingNotice {
                user_id: "1".into(),
                username: "alice".into(),
                genre: Some("Action".into()),
            })]
        );

        gw.handle_event(
            bob,
            ClientEvent::TypingStop(TypingStop {
                genre: None,
                to_user_id: Some("1".into()),
            }),
        )
        .await;
        assert_eq!(
            drain(&mut rx_alice),
            vec![ServerEvent::UserStoppedTyping(TypingNotice {
                user_id: "2".into(),
                username: "bob".into(),
                genre: None,
            })]
        );
    }

    #[tokio::test]
    async fn empty_channel_names_and_bodies_are_ignored() {
        let gw = gateway();
        let (alice, mut rx_alice) = identified(&gw, "alice", "1").await;

        gw.handle_event(alice, ClientEvent::JoinGenreChannel(String::new())).await;
        gw.handle_event(alice, ClientEvent::JoinGenreChannel("Action".into())).await;
        drain(&mut rx_alice);
        gw.handle_event(
            alice,
            ClientEvent::SendGenreMessage(GenreMessageSend {
                genre: "Action".into(),
                message: "   ".into(),
                username: "alice".into(),
            }),
        )
        .await;

        assert!(drain(&mut rx_alice).is_empty());
        assert_eq!(gw.dispatcher().channel_count().await, 1);
    }

    #[tokio::test]
    async fn anonymous_connection_posts_under_its_connection_id() {
        let gw = gateway();
        let (anon, mut rx) = gw.connect(None).await;
        drain(&mut rx);
        gw.handle_event(anon, ClientEvent::JoinGenreChannel("Indie".into())).await;
        drain(&mut rx);

        gw.handle_event(
            anon,
            ClientEvent::SendGenreMessage(GenreMessageSend {
                genre: "Indie".into(),
                message: "hi".into(),
                username: "guest".into(),
            }),
        )
        .await;
        let events = drain(&mut rx);
        let [ServerEvent::GenreMessage(msg)] = &events[..] else {
            panic!("expected genre-message, got {:?}", events);
        };
        assert_eq!(msg.user_id, anon.to_string());
    }
}
