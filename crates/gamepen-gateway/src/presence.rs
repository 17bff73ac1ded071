use std::collections::{BTreeSet, HashMap, HashSet};

use uuid::Uuid;

use gamepen_types::models::ChannelUser;

/// Identity shown for connections that never announced one.
pub const ANONYMOUS: &str = "Anonymous";

/// Who a connection claims to be, and which channels it has joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub display_name: String,
    /// Until identified, this is the connection id itself.
    pub external_id: String,
    pub channels: BTreeSet<String>,
}

impl ConnectionIdentity {
    pub fn anonymous(conn_id: Uuid) -> Self {
        Self {
            display_name: ANONYMOUS.to_string(),
            external_id: conn_id.to_string(),
            channels: BTreeSet::new(),
        }
    }

    pub fn as_channel_user(&self) -> ChannelUser {
        ChannelUser {
            user_id: self.external_id.clone(),
            username: self.display_name.clone(),
        }
    }
}

/// In-memory presence: channel -> member connections, connection -> identity.
///
/// Both maps are owned here and only change through the methods below.
/// A channel entry exists only while at least one connection is a member.
#[derive(Debug, Default)]
pub struct Presence {
    channel_users: HashMap<String, HashSet<Uuid>>,
    socket_users: HashMap<Uuid, ConnectionIdentity>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh anonymous connection. Re-connecting an existing id is a no-op.
    pub fn connect(&mut self, conn_id: Uuid) {
        self.socket_users
            .entry(conn_id)
            .or_insert_with(|| ConnectionIdentity::anonymous(conn_id));
    }

    /// Attach a display name and external user id. Joined channels are kept.
    pub fn identify(&mut self, conn_id: Uuid, display_name: String, external_id: String) -> &ConnectionIdentity {
        let identity = self
            .socket_users
            .entry(conn_id)
            .or_insert_with(|| ConnectionIdentity::anonymous(conn_id));
        identity.display_name = display_name;
        identity.external_id = external_id;
        identity
    }

    /// Add the connection to a channel. Returns true when it was not already a member.
    pub fn join(&mut self, conn_id: Uuid, channel: &str) -> bool {
        let identity = self
            .socket_users
            .entry(conn_id)
            .or_insert_with(|| ConnectionIdentity::anonymous(conn_id));
        identity.channels.insert(channel.to_string());

        self.channel_users
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id)
    }

    /// Remove the connection from a channel. Returns false when it was not a member.
    pub fn leave(&mut self, conn_id: Uuid, channel: &str) -> bool {
        if let Some(identity) = self.socket_users.get_mut(&conn_id) {
            identity.channels.remove(channel);
        }

        let Some(members) = self.channel_users.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(&conn_id);
        if members.is_empty() {
            self.channel_users.remove(channel);
        }
        removed
    }

    /// Drop the connection entirely. Returns its last identity and the
    /// channels it was removed from, or `None` if it was unknown.
    pub fn disconnect(&mut self, conn_id: Uuid) -> Option<ConnectionIdentity> {
        let identity = self.socket_users.remove(&conn_id)?;

        for channel in &identity.channels {
            if let Some(members) = self.channel_users.get_mut(channel) {
                members.remove(&conn_id);
                if members.is_empty() {
                    self.channel_users.remove(channel);
                }
            }
        }

        Some(identity)
    }

    pub fn identity(&self, conn_id: Uuid) -> Option<&ConnectionIdentity> {
        self.socket_users.get(&conn_id)
    }

    /// Connections currently in a channel.
    pub fn member_connections(&self, channel: &str) -> Vec<Uuid> {
        self.channel_users
            .get(channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Member list of a channel, sorted by display name then user id.
    pub fn members(&self, channel: &str) -> Vec<ChannelUser> {
        let mut users: Vec<ChannelUser> = self
            .channel_users
            .get(channel)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|conn_id| self.socket_users.get(conn_id))
                    .map(ConnectionIdentity::as_channel_user)
                    .collect()
            })
            .unwrap_or_default();
        users.sort_by(|a, b| (&a.username, &a.user_id).cmp(&(&b.username, &b.user_id)));
        users
    }

    /// All connections that identify as `external_id`. Anonymous connections
    /// are addressable by their own connection id.
    pub fn connections_for_user(&self, external_id: &str) -> Vec<Uuid> {
        self.socket_users
            .iter()
            .filter(|(_, identity)| identity.external_id == external_id)
            .map(|(conn_id, _)| *conn_id)
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channel_users.len()
    }

    pub fn connection_count(&self) -> usize {
        self.socket_users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_entry_is_removed_when_last_member_leaves() {
        let mut presence = Presence::new();
        let conns: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

        for &c in &conns {
            presence.connect(c);
            assert!(presence.join(c, "Action"));
        }
        assert_eq!(presence.member_connections("Action").len(), 3);
        assert_eq!(presence.channel_count(), 1);

        assert!(presence.leave(conns[0], "Action"));
        assert!(presence.leave(conns[1], "Action"));
        // Last one goes away via disconnect
        let identity = presence.disconnect(conns[2]).unwrap();
        assert!(identity.channels.contains("Action"));

        assert_eq!(presence.channel_count(), 0);
        assert!(presence.member_connections("Action").is_empty());
    }

    #[test]
    fn leaving_an_unjoined_channel_is_a_noop() {
        let mut presence = Presence::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        presence.connect(a);
        presence.connect(b);
        presence.join(b, "Puzzle");

        assert!(!presence.leave(a, "Action"));
        assert!(!presence.leave(a, "Puzzle"));
        assert_eq!(presence.member_connections("Puzzle"), vec![b]);
        assert_eq!(presence.channel_count(), 1);
    }

    #[test]
    fn joining_twice_keeps_a_single_membership() {
        let mut presence = Presence::new();
        let a = Uuid::new_v4();
        presence.connect(a);

        assert!(presence.join(a, "Action"));
        assert!(!presence.join(a, "Action"));
        assert_eq!(presence.member_connections("Action").len(), 1);

        assert!(presence.leave(a, "Action"));
        assert_eq!(presence.channel_count(), 0);
    }

    #[test]
    fn disconnect_clears_every_channel_and_identity() {
        let mut presence = Presence::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        presence.connect(a);
        presence.connect(b);
        presence.join(a, "Action");
        presence.join(a, "RPG");
        presence.join(b, "RPG");

        let identity = presence.disconnect(a).unwrap();
        let channels: Vec<&str> = identity.channels.iter().map(String::as_str).collect();
        assert_eq!(channels, vec!["Action", "RPG"]);

        assert_eq!(presence.member_connections("RPG"), vec![b]);
        assert_eq!(presence.channel_count(), 1);
        assert!(presence.identity(a).is_none());
        assert!(presence.disconnect(a).is_none());
    }

    #[test]
    fn anonymous_connections_are_addressed_by_connection_id() {
        let mut presence = Presence::new();
        let a = Uuid::new_v4();
        presence.connect(a);

        let identity = presence.identity(a).unwrap();
        assert_eq!(identity.display_name, ANONYMOUS);
        assert_eq!(presence.connections_for_user(&a.to_string()), vec![a]);
        assert!(presence.connections_for_user("1").is_empty());
    }

    #[test]
    fn identify_routes_by_external_id_across_connections() {
        let mut presence = Presence::new();
        let phone = Uuid::new_v4();
        let laptop = Uuid::new_v4();
        let other = Uuid::new_v4();
        for c in [phone, laptop, other] {
            presence.connect(c);
        }
        presence.join(phone, "Action");

        presence.identify(phone, "alice".into(), "1".into());
        presence.identify(laptop, "alice".into(), "1".into());
        presence.identify(other, "bob".into(), "2".into());

        let mut conns = presence.connections_for_user("1");
        conns.sort();
        let mut expected = vec![phone, laptop];
        expected.sort();
        assert_eq!(conns, expected);

        // Identity change shows up in the channel member list
        assert_eq!(
            presence.members("Action"),
            vec![ChannelUser { user_id: "1".into(), username: "alice".into() }]
        );
        assert_eq!(presence.connection_count(), 3);
    }
}
