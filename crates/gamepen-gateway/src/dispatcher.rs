use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use gamepen_types::events::ServerEvent;
use gamepen_types::models::ChannelUser;

use crate::presence::{ConnectionIdentity, Presence};

/// Result of a join: who joined, whether it was new, and the member list
/// including the joiner.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub newly_joined: bool,
    pub identity: ConnectionIdentity,
    pub members: Vec<ChannelUser>,
}

/// Owns presence and the per-connection outbound queues, and fans events out.
///
/// Lock order is always presence, then connections.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    presence: RwLock<Presence>,

    /// Outbound queue per live connection: conn_id -> sender
    connections: RwLock<HashMap<Uuid, mpsc::UnboundedSender<ServerEvent>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                presence: RwLock::new(Presence::new()),
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a new anonymous connection. Returns (conn_id, receiver).
    pub async fn register_connection(&self) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.presence.write().await.connect(conn_id);
        self.inner.connections.write().await.insert(conn_id, tx);
        (conn_id, rx)
    }

    /// Drop a connection's queue and presence. Returns its identity (with the
    /// channels it was removed from) if it was still registered.
    pub async fn unregister_connection(&self, conn_id: Uuid) -> Option<ConnectionIdentity> {
        let identity = self.inner.presence.write().await.disconnect(conn_id);
        self.inner.connections.write().await.remove(&conn_id);
        identity
    }

    pub async fn identify(&self, conn_id: Uuid, display_name: String, external_id: String) -> ConnectionIdentity {
        self.inner
            .presence
            .write()
            .await
            .identify(conn_id, display_name, external_id)
            .clone()
    }

    pub async fn identity(&self, conn_id: Uuid) -> Option<ConnectionIdentity> {
        self.inner.presence.read().await.identity(conn_id).cloned()
    }

    pub async fn join_channel(&self, conn_id: Uuid, channel: &str) -> JoinOutcome {
        let mut presence = self.inner.presence.write().await;
        let newly_joined = presence.join(conn_id, channel);
        let identity = presence
            .identity(conn_id)
            .cloned()
            .unwrap_or_else(|| ConnectionIdentity::anonymous(conn_id));
        JoinOutcome {
            newly_joined,
            identity,
            members: presence.members(channel),
        }
    }

    /// Leave a channel. Returns the leaver's identity only if it was a member.
    pub async fn leave_channel(&self, conn_id: Uuid, channel: &str) -> Option<ConnectionIdentity> {
        let mut presence = self.inner.presence.write().await;
        if !presence.leave(conn_id, channel) {
            return None;
        }
        presence.identity(conn_id).cloned()
    }

    pub async fn channel_count(&self) -> usize {
        self.inner.presence.read().await.channel_count()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Send a targeted event to one connection.
    pub async fn send_to_connection(&self, conn_id: Uuid, event: ServerEvent) -> bool {
        let connections = self.inner.connections.read().await;
        match connections.get(&conn_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Send an event to every member of a channel, optionally skipping one
    /// connection. Returns how many queues accepted it.
    pub async fn send_to_channel(&self, channel: &str, event: ServerEvent, except: Option<Uuid>) -> usize {
        let presence = self.inner.presence.read().await;
        let connections = self.inner.connections.read().await;

        let mut delivered = 0;
        for conn_id in presence.member_connections(channel) {
            if Some(conn_id) == except {
                continue;
            }
            if let Some(tx) = connections.get(&conn_id) {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!("Fan-out to channel '{}': {} connections", channel, delivered);
        delivered
    }

    /// Send an event to every connection identified as `external_id`.
    pub async fn send_to_user(&self, external_id: &str, event: ServerEvent) -> usize {
        let presence = self.inner.presence.read().await;
        let connections = self.inner.connections.read().await;

        let mut delivered = 0;
        for conn_id in presence.connections_for_user(external_id) {
            if let Some(tx) = connections.get(&conn_id) {
                if tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}
