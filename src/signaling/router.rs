//! Message router
//!
//! Interprets each decoded frame by `(sender role, message type)` and
//! applies its effect to the registry and directory, queueing whatever
//! notifications the change implies. All functions here run while the
//! caller holds the relay lock, so each operation observes and mutates
//! state in one step.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::directory::{Directory, StartOutcome};
use super::message::{ClientMessage, Inbound, ServerMessage};
use super::notifier::Notifier;
use super::registry::{Connection, ConnectionId, Registry, Role};

/// Everything guarded by the relay lock
#[derive(Debug, Default)]
pub struct RelayState {
    pub registry: Registry,
    pub directory: Directory,
}

/// Effect of attaching a viewer to a broadcast
struct Attach {
    count: u32,
    /// `false` when the viewer was already attached to that broadcast
    changed: bool,
}

/// Answer a message that never mutates state; only needs shared access
pub(crate) fn respond(state: &RelayState, notifier: &Notifier, conn_id: ConnectionId, inbound: &Inbound) {
    let Some(conn) = state.registry.connection(conn_id) else {
        debug!(conn_id = %conn_id, "Message from unregistered connection ignored");
        return;
    };

    match (conn.role, &inbound.message) {
        (Role::ListSubscriber, ClientMessage::GetBroadcastList) => {
            let broadcasts = state.directory.list_active();
            debug!(user_id = %conn.user_id, "Sending broadcast list ({} live)", broadcasts.len());
            notifier.notify_one(&conn.outbox, &ServerMessage::BroadcastList { broadcasts });
        }
        (_, ClientMessage::Ping) => {
            notifier.notify_one(&conn.outbox, &ServerMessage::pong());
        }
        (Role::Broadcaster, ClientMessage::OfferRequest) => {
            debug!(broadcaster_id = %conn.user_id, "Ignoring offer_request from broadcaster");
        }
        (role, ClientMessage::Unknown) => {
            warn!(
                user_id = %conn.user_id,
                role = %role,
                "Unknown message type ignored: {:?}",
                inbound.raw_type()
            );
        }
        (role, message) => {
            warn!(user_id = %conn.user_id, "{} is not accepted from {} connections", message.kind(), role);
        }
    }
}

pub(crate) struct Router<'a> {
    state: &'a mut RelayState,
    notifier: &'a Notifier,
}

impl<'a> Router<'a> {
    pub(crate) fn new(state: &'a mut RelayState, notifier: &'a Notifier) -> Self {
        Self { state, notifier }
    }

    /// Route one inbound frame from `conn_id`
    pub(crate) fn route(&mut self, conn_id: ConnectionId, inbound: Inbound) {
        if inbound.message.is_read_only() {
            respond(self.state, self.notifier, conn_id, &inbound);
            return;
        }

        let Some((role, user_id)) = self
            .state
            .registry
            .connection(conn_id)
            .map(|c| (c.role, c.user_id.clone()))
        else {
            debug!(conn_id = %conn_id, "Message from unregistered connection ignored");
            return;
        };
        debug!(conn_id = %conn_id, user_id = %user_id, role = %role, "Routing {}", inbound.message.kind());

        match (role, inbound.message.clone()) {
            (Role::Broadcaster, ClientMessage::StartBroadcast) => self.start_broadcast(&user_id),
            (Role::Broadcaster, ClientMessage::StopBroadcast) => {
                self.stop_broadcast(&user_id);
            }
            (Role::Broadcaster, ClientMessage::Offer { viewer_id }) => {
                self.forward_offer(&user_id, viewer_id, inbound)
            }
            (Role::Broadcaster, ClientMessage::Candidate { viewer_id, .. }) => match viewer_id {
                Some(viewer_id) => self.deliver_to_viewer(&user_id, &viewer_id, inbound),
                None => warn!(broadcaster_id = %user_id, "Candidate without viewer_id dropped"),
            },
            (Role::Viewer, ClientMessage::RequestStream { broadcaster_id }) => {
                self.request_stream(&user_id, broadcaster_id)
            }
            (Role::Viewer, ClientMessage::Answer { broadcaster_id })
            | (Role::Viewer, ClientMessage::Candidate { broadcaster_id, .. }) => {
                self.forward_to_broadcaster(&user_id, broadcaster_id, inbound)
            }
            (Role::Viewer, ClientMessage::ViewerJoin { broadcaster_id }) => {
                self.viewer_join(&user_id, broadcaster_id)
            }
            (Role::Viewer, ClientMessage::ViewerLeave { broadcaster_id }) => {
                self.viewer_leave(&user_id, broadcaster_id)
            }
            (role, message) => {
                warn!(user_id = %user_id, "{} is not accepted from {} connections", message.kind(), role);
            }
        }
    }

    fn start_broadcast(&mut self, broadcaster_id: &str) {
        let Some(name) = self
            .state
            .registry
            .broadcaster(broadcaster_id)
            .map(|c| c.user_name.clone())
        else {
            warn!(broadcaster_id, "start_broadcast from unregistered broadcaster");
            return;
        };

        match self.state.directory.start(broadcaster_id, &name) {
            StartOutcome::Started(broadcast) => {
                info!(broadcaster_id, "Broadcast started: {}", name);
                self.notifier.notify_all(
                    self.state.registry.subscriber_outboxes(),
                    &ServerMessage::BroadcastStarted { broadcast },
                );
            }
            StartOutcome::AlreadyLive(_) => {
                debug!(broadcaster_id, "Broadcast already live, keeping existing record");
            }
        }
    }

    /// End a broadcast and disconnect its viewers
    ///
    /// Each attached viewer is sent `broadcast_ended` and then unregistered;
    /// dropping its outbox closes the connection once the notification has
    /// been flushed. Viewers that only pre-selected the broadcast are told
    /// too but stay connected. Returns the ids of the viewers that were
    /// attached.
    pub(crate) fn stop_broadcast(&mut self, broadcaster_id: &str) -> Vec<String> {
        let Some(record) = self.state.directory.stop(broadcaster_id) else {
            debug!(broadcaster_id, "No live broadcast to stop");
            return Vec::new();
        };

        let registry = &mut self.state.registry;
        let viewer_ids: Vec<String> = registry
            .viewers_of(broadcaster_id)
            .map(|(id, _)| id.clone())
            .collect();

        let ended = ServerMessage::BroadcastEnded {
            broadcaster_id: broadcaster_id.to_string(),
            broadcast: Some(record.summary()),
        };
        self.notifier
            .notify_all(registry.viewer_outboxes(broadcaster_id), &ended);
        self.notifier
            .notify_all(registry.preselected_outboxes(broadcaster_id), &ended);

        for viewer_id in &viewer_ids {
            if let Some(conn_id) = registry.holder(Role::Viewer, viewer_id) {
                registry.unregister(conn_id);
                self.notifier.forget(conn_id);
            }
        }
        registry.purge_offers_for(broadcaster_id);

        info!(
            broadcaster_id,
            "Broadcast stopped: {} ({} viewers disconnected)",
            record.broadcaster_name,
            viewer_ids.len()
        );

        self.notifier.notify_all(
            registry.subscriber_outboxes(),
            &ServerMessage::BroadcastEnded {
                broadcaster_id: broadcaster_id.to_string(),
                broadcast: None,
            },
        );

        viewer_ids
    }

    fn forward_offer(&mut self, broadcaster_id: &str, viewer_id: Option<String>, inbound: Inbound) {
        let registry = &mut self.state.registry;
        let viewer_id = match viewer_id {
            Some(viewer_id) => {
                registry.consume_offer(&viewer_id, broadcaster_id);
                Some(viewer_id)
            }
            None => registry.take_offer_for(broadcaster_id),
        };

        match viewer_id {
            Some(viewer_id) => self.deliver_to_viewer(broadcaster_id, &viewer_id, inbound),
            None => warn!(broadcaster_id, "Offer dropped: no viewer is waiting for one"),
        }
    }

    /// Relay a broadcaster's frame to a viewer, tagged with the broadcaster id
    fn deliver_to_viewer(&self, broadcaster_id: &str, viewer_id: &str, inbound: Inbound) {
        let registry = &self.state.registry;
        let Some(conn) = registry
            .viewer(viewer_id)
            .and_then(|record| registry.connection(record.connection))
        else {
            warn!(broadcaster_id, viewer_id, "{} dropped: viewer not connected", inbound.message.kind());
            return;
        };

        let kind = inbound.message.kind();
        let frame: Arc<str> = Arc::from(inbound.relay_with("broadcaster_id", broadcaster_id));
        self.notifier.send_raw(&conn.outbox, frame);
        debug!(broadcaster_id, viewer_id, "Relayed {} to viewer", kind);
    }

    /// Relay a viewer's frame to a broadcaster, tagged with the viewer id
    fn forward_to_broadcaster(&self, viewer_id: &str, explicit: Option<String>, inbound: Inbound) {
        let registry = &self.state.registry;
        let target = explicit.or_else(|| {
            registry
                .viewer(viewer_id)
                .and_then(|r| r.target())
                .map(str::to_string)
        });

        let kind = inbound.message.kind();
        let Some(broadcaster_id) = target else {
            warn!(viewer_id, "{} dropped: no target broadcaster", kind);
            return;
        };
        let Some(conn) = registry.broadcaster(&broadcaster_id) else {
            warn!(viewer_id, broadcaster_id = %broadcaster_id, "{} dropped: broadcaster not connected", kind);
            return;
        };

        let frame: Arc<str> = Arc::from(inbound.relay_with("viewer_id", viewer_id));
        self.notifier.send_raw(&conn.outbox, frame);
        debug!(viewer_id, broadcaster_id = %broadcaster_id, "Relayed {} to broadcaster", kind);
    }

    fn request_stream(&mut self, viewer_id: &str, explicit: Option<String>) {
        let Some(record) = self.state.registry.viewer(viewer_id) else {
            warn!(viewer_id, "request_stream from viewer without a session");
            return;
        };
        let viewer_conn = record.connection;
        let target = explicit.or_else(|| record.target().map(str::to_string));

        let Some(broadcaster_id) = target.filter(|b| {
            self.state.registry.broadcaster(b).is_some() && self.state.directory.is_live(b)
        }) else {
            warn!(viewer_id, "Requested broadcast not found");
            self.reply(viewer_conn, &ServerMessage::error("broadcast not found"));
            return;
        };

        let Some(attach) = self.attach(viewer_id, &broadcaster_id) else {
            return;
        };
        self.state.registry.enqueue_offer(viewer_id, &broadcaster_id);

        let viewer_name = self.state.registry.viewer_name(viewer_id);
        if let Some(conn) = self.state.registry.broadcaster(&broadcaster_id) {
            self.notifier.notify_one(
                &conn.outbox,
                &ServerMessage::OfferRequest {
                    viewer_id: viewer_id.to_string(),
                    viewer_name,
                },
            );
        }
        if attach.changed {
            self.publish_count(&broadcaster_id, attach.count);
        }

        info!(
            viewer_id,
            broadcaster_id = %broadcaster_id,
            "Stream requested ({} viewers)",
            attach.count
        );
    }

    fn viewer_join(&mut self, viewer_id: &str, explicit: Option<String>) {
        let Some(record) = self.state.registry.viewer(viewer_id) else {
            warn!(viewer_id, "viewer_join from viewer without a session");
            return;
        };
        let viewer_conn = record.connection;
        let target = explicit.or_else(|| record.target().map(str::to_string));

        let Some(broadcaster_id) = target.filter(|b| self.state.directory.is_live(b)) else {
            warn!(viewer_id, "Joined broadcast not found");
            self.reply(viewer_conn, &ServerMessage::error("broadcast not found"));
            return;
        };

        let Some(attach) = self.attach(viewer_id, &broadcaster_id) else {
            return;
        };

        if attach.changed {
            let viewer_name = self.state.registry.viewer_name(viewer_id);
            info!(
                viewer_id,
                broadcaster_id = %broadcaster_id,
                "Viewer joined: {} ({} viewers)",
                viewer_name,
                attach.count
            );
            if let Some(conn) = self.state.registry.broadcaster(&broadcaster_id) {
                self.notifier.notify_one(
                    &conn.outbox,
                    &ServerMessage::ViewerJoined {
                        viewer_id: viewer_id.to_string(),
                        viewer_name,
                        count: attach.count,
                    },
                );
            }
            self.publish_count(&broadcaster_id, attach.count);
        }

        if let Some(record) = self.state.directory.get(&broadcaster_id) {
            let confirm = ServerMessage::JoinConfirmed {
                broadcaster_id: broadcaster_id.clone(),
                broadcast: record.summary(),
            };
            self.reply(viewer_conn, &confirm);
        }
    }

    fn viewer_leave(&mut self, viewer_id: &str, explicit: Option<String>) {
        let Some(viewer_conn) = self.state.registry.viewer(viewer_id).map(|r| r.connection) else {
            warn!(viewer_id, "viewer_leave from viewer without a session");
            return;
        };

        let left = self.detach(viewer_id).or(explicit);
        self.reply(
            viewer_conn,
            &ServerMessage::LeaveConfirmed {
                broadcaster_id: left.clone(),
            },
        );
        self.state.registry.remove_viewer(viewer_id);

        info!(viewer_id, broadcaster_id = ?left, "Viewer left");
    }

    /// Attach a viewer to a live broadcast, detaching it from any other one
    fn attach(&mut self, viewer_id: &str, broadcaster_id: &str) -> Option<Attach> {
        let current = self.state.registry.viewer(viewer_id)?.broadcaster_id.clone();
        if current.as_deref() == Some(broadcaster_id) {
            let count = self.state.directory.get(broadcaster_id)?.viewer_count;
            return Some(Attach { count, changed: false });
        }
        if current.is_some() {
            self.detach(viewer_id);
        }

        let count = self.state.directory.increment(broadcaster_id)?;
        let record = self.state.registry.viewer_mut(viewer_id)?;
        record.broadcaster_id = Some(broadcaster_id.to_string());
        record.joined_at = Utc::now();
        Some(Attach { count, changed: true })
    }

    /// Detach a viewer from its broadcast; returns the broadcast it left
    fn detach(&mut self, viewer_id: &str) -> Option<String> {
        let broadcaster_id = self
            .state
            .registry
            .viewer_mut(viewer_id)?
            .broadcaster_id
            .take()?;
        self.state.registry.consume_offer(viewer_id, &broadcaster_id);

        let viewer_name = self.state.registry.viewer_name(viewer_id);
        self.release(viewer_id, &viewer_name, &broadcaster_id);
        Some(broadcaster_id)
    }

    /// Account for a viewer no longer counted in a broadcast
    fn release(&mut self, viewer_id: &str, viewer_name: &str, broadcaster_id: &str) {
        let Some(count) = self.state.directory.decrement(broadcaster_id) else {
            return;
        };

        if let Some(conn) = self.state.registry.broadcaster(broadcaster_id) {
            self.notifier.notify_one(
                &conn.outbox,
                &ServerMessage::ViewerLeft {
                    viewer_id: viewer_id.to_string(),
                    viewer_name: viewer_name.to_string(),
                    count,
                },
            );
        }
        self.publish_count(broadcaster_id, count);
    }

    /// Tell the broadcaster, its viewers and every list subscriber about a
    /// new viewer count
    fn publish_count(&self, broadcaster_id: &str, count: u32) {
        let registry = &self.state.registry;
        debug!(broadcaster_id, count, "Viewer count changed");

        if let Some(conn) = registry.broadcaster(broadcaster_id) {
            self.notifier.notify_one(
                &conn.outbox,
                &ServerMessage::ViewerCountUpdate {
                    broadcaster_id: None,
                    count,
                },
            );
        }

        let update = ServerMessage::ViewerCountUpdate {
            broadcaster_id: Some(broadcaster_id.to_string()),
            count,
        };
        self.notifier
            .notify_all(registry.viewer_outboxes(broadcaster_id), &update);
        self.notifier
            .notify_all(registry.subscriber_outboxes(), &update);
    }

    /// Unregister a connection and run the cleanup its role owns
    pub(crate) fn drop_connection(&mut self, conn_id: ConnectionId) -> Option<Connection> {
        let removed = self.state.registry.unregister(conn_id)?;
        self.notifier.forget(conn_id);

        let conn = &removed.connection;
        match conn.role {
            Role::Broadcaster if removed.was_indexed => {
                self.stop_broadcast(&conn.user_id);
            }
            Role::Viewer => {
                if let Some(broadcaster_id) =
                    removed.viewer.as_ref().and_then(|v| v.broadcaster_id.as_deref())
                {
                    self.release(&conn.user_id, &conn.user_name, broadcaster_id);
                }
            }
            _ => {}
        }

        info!(conn_id = %conn_id, user_id = %conn.user_id, role = %conn.role, "Connection unregistered");
        Some(removed.connection)
    }

    fn reply(&self, conn_id: ConnectionId, message: &ServerMessage) {
        if let Some(conn) = self.state.registry.connection(conn_id) {
            self.notifier.notify_one(&conn.outbox, message);
        }
    }
}
