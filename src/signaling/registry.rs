//! Connection registry
//!
//! Every open connection is stored exactly once, keyed by its
//! [`ConnectionId`], with its [`Role`] as an explicit field. Per-role
//! indexes map user ids to connections; an index entry is only ever removed
//! by the connection it points at, so a late disconnect from a replaced
//! connection cannot evict its successor.
//!
//! The registry is plain data. Synchronization is provided by the owner
//! (`SignalingHub`), which holds it behind a single lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::notifier::Outbox;

/// Stable identity of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Declared role of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Broadcaster,
    Viewer,
    /// Only interested in broadcast list changes
    #[serde(rename = "viewer_list", alias = "list_subscriber")]
    ListSubscriber,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Broadcaster => "broadcaster",
            Role::Viewer => "viewer",
            Role::ListSubscriber => "viewer_list",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "broadcaster" => Ok(Role::Broadcaster),
            "viewer" => Ok(Role::Viewer),
            "viewer_list" | "list_subscriber" => Ok(Role::ListSubscriber),
            other => Err(format!("invalid role: {}", other)),
        }
    }
}

/// One open connection
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub role: Role,
    pub user_id: String,
    pub user_name: String,
    pub connected_at: DateTime<Utc>,
    pub outbox: Outbox,
}

/// Session state of one viewer
#[derive(Debug, Clone)]
pub struct ViewerRecord {
    pub connection: ConnectionId,
    /// Broadcast the viewer is attached to (counted in its viewer count)
    pub broadcaster_id: Option<String>,
    /// Broadcast picked at connect time; a routing fallback only
    pub preferred: Option<String>,
    pub joined_at: DateTime<Utc>,
}

impl ViewerRecord {
    /// Broadcast a message without an explicit id is aimed at
    pub fn target(&self) -> Option<&str> {
        self.broadcaster_id.as_deref().or(self.preferred.as_deref())
    }
}

#[derive(Debug, Clone)]
struct PendingOffer {
    broadcaster_id: String,
    seq: u64,
}

/// A connection removed from the registry, with the role state it held
#[derive(Debug)]
pub struct Unregistered {
    pub connection: Connection,
    /// Set for viewers that still had a session record
    pub viewer: Option<ViewerRecord>,
    /// Whether the connection was the registered holder of its role index
    pub was_indexed: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    broadcasters: HashMap<String, ConnectionId>,
    viewers: HashMap<String, ViewerRecord>,
    subscribers: HashMap<ConnectionId, String>,
    /// viewer id -> broadcaster it awaits an offer from
    pending_offers: HashMap<String, PendingOffer>,
    next_offer_seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection under its role
    ///
    /// Returns `false` without registering when the user id is empty, or
    /// when a broadcaster or viewer user id is already held in the same
    /// role; callers must evict the previous holder first. List subscribers
    /// are keyed by connection, so one user may hold several.
    pub fn register(&mut self, connection: Connection, preferred: Option<String>) -> bool {
        if connection.user_id.is_empty() {
            return false;
        }
        if connection.role != Role::ListSubscriber
            && self.holder(connection.role, &connection.user_id).is_some()
        {
            return false;
        }

        let id = connection.id;
        match connection.role {
            Role::Broadcaster => {
                self.broadcasters.insert(connection.user_id.clone(), id);
            }
            Role::Viewer => {
                self.viewers.insert(
                    connection.user_id.clone(),
                    ViewerRecord {
                        connection: id,
                        broadcaster_id: None,
                        preferred,
                        joined_at: Utc::now(),
                    },
                );
            }
            Role::ListSubscriber => {
                self.subscribers.insert(id, connection.user_id.clone());
            }
        }
        self.connections.insert(id, connection);
        true
    }

    /// Remove a connection regardless of role
    ///
    /// A viewer's pending offer is purged with it.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Unregistered> {
        let connection = self.connections.remove(&id)?;
        let mut viewer = None;
        let was_indexed = match connection.role {
            Role::Broadcaster => {
                if self.broadcasters.get(&connection.user_id) == Some(&id) {
                    self.broadcasters.remove(&connection.user_id);
                    true
                } else {
                    false
                }
            }
            Role::Viewer => {
                if self.viewers.get(&connection.user_id).map(|v| v.connection) == Some(id) {
                    viewer = self.viewers.remove(&connection.user_id);
                    self.pending_offers.remove(&connection.user_id);
                    true
                } else {
                    false
                }
            }
            Role::ListSubscriber => self.subscribers.remove(&id).is_some(),
        };

        Some(Unregistered {
            connection,
            viewer,
            was_indexed,
        })
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Connection currently holding `user_id` in `role`
    pub fn holder(&self, role: Role, user_id: &str) -> Option<ConnectionId> {
        match role {
            Role::Broadcaster => self.broadcasters.get(user_id).copied(),
            Role::Viewer => self.viewers.get(user_id).map(|v| v.connection),
            Role::ListSubscriber => self
                .subscribers
                .iter()
                .find(|(_, uid)| uid.as_str() == user_id)
                .map(|(id, _)| *id),
        }
    }

    /// Look up a connection by role and user id
    pub fn lookup(&self, role: Role, user_id: &str) -> Option<&Connection> {
        self.holder(role, user_id)
            .and_then(|id| self.connections.get(&id))
    }

    pub fn broadcaster(&self, user_id: &str) -> Option<&Connection> {
        self.lookup(Role::Broadcaster, user_id)
    }

    pub fn viewer(&self, user_id: &str) -> Option<&ViewerRecord> {
        self.viewers.get(user_id)
    }

    pub fn viewer_mut(&mut self, user_id: &str) -> Option<&mut ViewerRecord> {
        self.viewers.get_mut(user_id)
    }

    /// Drop a viewer's session record while its connection stays open
    pub fn remove_viewer(&mut self, user_id: &str) -> Option<ViewerRecord> {
        self.pending_offers.remove(user_id);
        self.viewers.remove(user_id)
    }

    /// Viewers attached to a broadcast
    pub fn viewers_of<'a>(
        &'a self,
        broadcaster_id: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a ViewerRecord)> + 'a {
        self.viewers
            .iter()
            .filter(move |(_, v)| v.broadcaster_id.as_deref() == Some(broadcaster_id))
    }

    /// Outboxes of the viewers attached to a broadcast
    pub fn viewer_outboxes<'a>(&'a self, broadcaster_id: &'a str) -> impl Iterator<Item = &'a Outbox> + 'a {
        self.viewers_of(broadcaster_id)
            .filter_map(move |(_, v)| self.connections.get(&v.connection))
            .map(|c| &c.outbox)
    }

    /// Outboxes of viewers that picked a broadcast at connect time but are
    /// not attached to any
    pub fn preselected_outboxes<'a>(
        &'a self,
        broadcaster_id: &'a str,
    ) -> impl Iterator<Item = &'a Outbox> + 'a {
        self.viewers
            .values()
            .filter(move |v| {
                v.broadcaster_id.is_none() && v.preferred.as_deref() == Some(broadcaster_id)
            })
            .filter_map(move |v| self.connections.get(&v.connection))
            .map(|c| &c.outbox)
    }

    pub fn subscriber_outboxes(&self) -> impl Iterator<Item = &Outbox> + '_ {
        self.subscribers
            .keys()
            .filter_map(move |id| self.connections.get(id))
            .map(|c| &c.outbox)
    }

    /// Record that a viewer waits for an offer from a broadcaster
    pub fn enqueue_offer(&mut self, viewer_id: &str, broadcaster_id: &str) {
        self.next_offer_seq += 1;
        self.pending_offers.insert(
            viewer_id.to_string(),
            PendingOffer {
                broadcaster_id: broadcaster_id.to_string(),
                seq: self.next_offer_seq,
            },
        );
    }

    /// Remove and return the longest-waiting viewer for a broadcaster
    pub fn take_offer_for(&mut self, broadcaster_id: &str) -> Option<String> {
        let viewer_id = self
            .pending_offers
            .iter()
            .filter(|(_, p)| p.broadcaster_id == broadcaster_id)
            .min_by_key(|(_, p)| p.seq)
            .map(|(viewer_id, _)| viewer_id.clone())?;
        self.pending_offers.remove(&viewer_id);
        Some(viewer_id)
    }

    /// Consume a viewer's pending offer if it is awaited from `broadcaster_id`
    pub fn consume_offer(&mut self, viewer_id: &str, broadcaster_id: &str) -> bool {
        if self.pending_offer(viewer_id) == Some(broadcaster_id) {
            self.pending_offers.remove(viewer_id);
            true
        } else {
            false
        }
    }

    pub fn pending_offer(&self, viewer_id: &str) -> Option<&str> {
        self.pending_offers
            .get(viewer_id)
            .map(|p| p.broadcaster_id.as_str())
    }

    /// Drop every pending offer awaited from a broadcaster
    pub fn purge_offers_for(&mut self, broadcaster_id: &str) {
        self.pending_offers
            .retain(|_, p| p.broadcaster_id != broadcaster_id);
    }

    pub fn broadcaster_count(&self) -> usize {
        self.broadcasters.len()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn pending_offer_count(&self) -> usize {
        self.pending_offers.len()
    }

    /// Display name of the connection behind a viewer record
    pub fn viewer_name(&self, viewer_id: &str) -> String {
        self.viewers
            .get(viewer_id)
            .and_then(|v| self.connections.get(&v.connection))
            .map(|c| c.user_name.clone())
            .unwrap_or_default()
    }

    /// Number of role sets a connection id appears in
    #[cfg(test)]
    pub(crate) fn memberships(&self, id: ConnectionId) -> usize {
        usize::from(self.broadcasters.values().any(|c| *c == id))
            + usize::from(self.viewers.values().any(|v| v.connection == id))
            + usize::from(self.subscribers.contains_key(&id))
    }
}
