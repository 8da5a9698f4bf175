//! Signaling hub
//!
//! [`SignalingHub`] is the single coordinator for the relay. It owns the
//! connection registry and the broadcast directory behind one
//! readers-writer lock and only exposes operations that leave both in a
//! consistent state:
//!
//! - [`connect`](SignalingHub::connect) validates and registers a new
//!   connection, returning the receiving side of its outbox
//! - [`handle_text`](SignalingHub::handle_text) decodes and routes one frame
//! - [`disconnect`](SignalingHub::disconnect) unregisters a connection and
//!   runs the cleanup its role owns
//!
//! Pure reads (broadcast list, `ping`, query surface) take the shared lock.
//! Every mutation takes the exclusive lock for the whole
//! lookup-decide-mutate sequence, and outbound messages are queued without
//! blocking while it is held.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{BroadcastSummary, Inbound, ServerMessage};
use super::notifier::{Inbox, Notifier, Outbox};
use super::registry::{Connection, ConnectionId, Role};
use super::router::{self, RelayState, Router};
use super::session::ConnectParams;
use crate::config::SignalingConfig;
use crate::error::{AppError, Result};

/// A registered connection, handed to the lifecycle manager
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub role: Role,
    pub user_id: String,
    /// Frames queued for this connection. Ends once the relay drops the
    /// connection.
    pub inbox: Inbox,
}

/// One viewer attached to a broadcast
#[derive(Debug, Clone, Serialize)]
pub struct ViewerInfo {
    pub viewer_id: String,
    pub viewer_name: String,
    pub join_time: DateTime<Utc>,
}

/// Per-broadcast statistics
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastStats {
    pub broadcast_info: BroadcastSummary,
    pub viewers: Vec<ViewerInfo>,
    pub viewer_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionCounts {
    pub broadcasters: usize,
    pub viewers: usize,
    pub list_subscribers: usize,
    pub pending_offers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastTotals {
    pub active_count: usize,
    pub total_viewers: u64,
    pub average_viewers: f64,
    /// broadcaster id -> viewer count
    pub broadcaster_viewers: HashMap<String, u32>,
}

/// Aggregate relay status
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub server_info: ServerInfo,
    pub connections: ConnectionCounts,
    pub broadcasts: BroadcastTotals,
    pub active_broadcasts: Vec<BroadcastSummary>,
}

pub struct SignalingHub {
    state: RwLock<RelayState>,
    notifier: Notifier,
    config: SignalingConfig,
    next_id: AtomicU64,
    started_at: DateTime<Utc>,
}

impl SignalingHub {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            state: RwLock::new(RelayState::default()),
            notifier: Notifier::new(),
            config,
            next_id: AtomicU64::new(1),
            started_at: Utc::now(),
        }
    }

    /// Validate connect parameters and register the connection
    ///
    /// Fails with [`AppError::ConnectionRejected`] when the user id is
    /// missing or the role is not recognised; nothing is registered in that
    /// case. A broadcaster or viewer connection already holding the same user
    /// id in the same role is dropped first, with its full disconnect
    /// cascade. List subscribers may connect several times under one id.
    pub fn connect(&self, params: &ConnectParams) -> Result<ConnectionHandle> {
        let role = params.role.as_deref().unwrap_or_default().parse::<Role>();
        let mut warning = None;

        let user_id = match (non_empty(params.user_id.as_deref()), &role) {
            (Some(user_id), _) => user_id,
            (None, Ok(Role::ListSubscriber)) if self.config.allow_anonymous_subscribers => {
                let user_id = format!("anonymous_{}", Uuid::new_v4());
                warning = Some(format!(
                    "no user_id supplied, connected anonymously as {}",
                    user_id
                ));
                user_id
            }
            (None, _) => {
                warn!(role = ?params.role, "Connection rejected: missing user_id");
                return Err(AppError::ConnectionRejected("user_id is required".to_string()));
            }
        };

        let role = role.map_err(|e| {
            warn!(user_id = %user_id, "Connection rejected: {}", e);
            AppError::ConnectionRejected("invalid role".to_string())
        })?;

        let user_name = non_empty(params.user_name.as_deref()).unwrap_or_else(|| user_id.clone());
        let preferred = match role {
            Role::Viewer => non_empty(params.broadcaster_id.as_deref()),
            _ => None,
        };

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (outbox, inbox) = Outbox::channel(id, self.config.outbox_capacity);
        if let Some(warning) = warning {
            self.notifier.notify_one(&outbox, &ServerMessage::warning(warning));
        }

        let mut guard = self.state.write();
        let state = &mut *guard;

        let previous = match role {
            Role::ListSubscriber => None,
            _ => state.registry.holder(role, &user_id),
        };
        if let Some(previous) = previous {
            info!(
                conn_id = %previous,
                user_id = %user_id,
                role = %role,
                "Replacing existing connection for the same user"
            );
            Router::new(state, &self.notifier).drop_connection(previous);
        }

        let connection = Connection {
            id,
            role,
            user_id: user_id.clone(),
            user_name: user_name.clone(),
            connected_at: Utc::now(),
            outbox,
        };
        if !state.registry.register(connection, preferred) {
            return Err(AppError::Internal(format!(
                "failed to register {} {}",
                role, user_id
            )));
        }

        if role == Role::ListSubscriber {
            if let Some(conn) = state.registry.connection(id) {
                let broadcasts = state.directory.list_active();
                self.notifier
                    .notify_one(&conn.outbox, &ServerMessage::BroadcastList { broadcasts });
            }
        }
        drop(guard);

        info!(conn_id = %id, user_id = %user_id, role = %role, "Connection registered: {}", user_name);
        Ok(ConnectionHandle {
            id,
            role,
            user_id,
            inbox,
        })
    }

    /// Decode and route one text frame from a connection
    ///
    /// Malformed frames are logged and dropped; the connection stays open.
    pub fn handle_text(&self, conn_id: ConnectionId, text: &str) {
        let inbound = match Inbound::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(conn_id = %conn_id, "Malformed message dropped: {}", e);
                return;
            }
        };

        if inbound.message.is_read_only() {
            let state = self.state.read();
            router::respond(&state, &self.notifier, conn_id, &inbound);
        } else {
            let mut state = self.state.write();
            Router::new(&mut state, &self.notifier).route(conn_id, inbound);
        }
    }

    /// Unregister a connection and cascade its role's cleanup
    ///
    /// Returns `false` if the connection was already gone (for example when
    /// it was replaced or its broadcast ended).
    pub fn disconnect(&self, conn_id: ConnectionId) -> bool {
        let mut state = self.state.write();
        let dropped = Router::new(&mut state, &self.notifier).drop_connection(conn_id);
        if dropped.is_none() {
            debug!(conn_id = %conn_id, "Connection already unregistered");
        }
        dropped.is_some()
    }

    /// Snapshot of every live broadcast
    pub fn list_active(&self) -> Vec<BroadcastSummary> {
        self.state.read().directory.list_active()
    }

    pub fn broadcast_stats(&self, broadcaster_id: &str) -> Result<BroadcastStats> {
        let state = self.state.read();
        let record = state
            .directory
            .get(broadcaster_id)
            .ok_or_else(|| AppError::NotFound(format!("broadcast {} not found", broadcaster_id)))?;

        let viewers = state
            .registry
            .viewers_of(broadcaster_id)
            .map(|(viewer_id, viewer)| ViewerInfo {
                viewer_id: viewer_id.clone(),
                viewer_name: state.registry.viewer_name(viewer_id),
                join_time: viewer.joined_at,
            })
            .collect();

        Ok(BroadcastStats {
            broadcast_info: record.summary(),
            viewers,
            viewer_count: record.viewer_count,
        })
    }

    pub fn status(&self) -> ServerStatus {
        let state = self.state.read();
        let active_broadcasts = state.directory.list_active();

        let broadcaster_viewers: HashMap<String, u32> = active_broadcasts
            .iter()
            .map(|b| (b.broadcaster_id.clone(), b.viewer_count))
            .collect();
        let total_viewers: u64 = broadcaster_viewers.values().map(|c| u64::from(*c)).sum();
        let average_viewers = if active_broadcasts.is_empty() {
            0.0
        } else {
            total_viewers as f64 / active_broadcasts.len() as f64
        };

        let now = Utc::now();
        ServerStatus {
            server_info: ServerInfo {
                version: env!("CARGO_PKG_VERSION"),
                started_at: self.started_at,
                uptime_secs: (now - self.started_at).num_seconds(),
            },
            connections: ConnectionCounts {
                broadcasters: state.registry.broadcaster_count(),
                viewers: state.registry.viewer_count(),
                list_subscribers: state.registry.subscriber_count(),
                pending_offers: state.registry.pending_offer_count(),
            },
            broadcasts: BroadcastTotals {
                active_count: active_broadcasts.len(),
                total_viewers,
                average_viewers,
                broadcaster_viewers,
            },
            active_broadcasts,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::error::TryRecvError;

    fn hub() -> SignalingHub {
        SignalingHub::new(SignalingConfig::default())
    }

    fn params(role: &str, user_id: &str) -> ConnectParams {
        ConnectParams {
            role: Some(role.to_string()),
            user_id: Some(user_id.to_string()),
            user_name: Some(format!("{} name", user_id)),
            broadcaster_id: None,
        }
    }

    fn connect(hub: &SignalingHub, role: &str, user_id: &str) -> ConnectionHandle {
        hub.connect(&params(role, user_id)).unwrap()
    }

    fn drain(handle: &mut ConnectionHandle) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = handle.inbox.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn types(frames: &[Value]) -> Vec<&str> {
        frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
    }

    fn send(hub: &SignalingHub, handle: &ConnectionHandle, message: Value) {
        hub.handle_text(handle.id, &message.to_string());
    }

    fn is_closed(handle: &mut ConnectionHandle) -> bool {
        matches!(handle.inbox.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn live(hub: &SignalingHub, user_id: &str) -> ConnectionHandle {
        let mut b = connect(hub, "broadcaster", user_id);
        send(hub, &b, json!({"type": "start_broadcast"}));
        drain(&mut b);
        b
    }

    fn viewer_count(hub: &SignalingHub, broadcaster_id: &str) -> Option<u32> {
        hub.state
            .read()
            .directory
            .get(broadcaster_id)
            .map(|r| r.viewer_count)
    }

    #[test]
    fn test_missing_user_id_rejected() {
        let hub = hub();
        let mut p = params("viewer", "");
        p.user_id = None;

        let err = hub.connect(&p).unwrap_err();
        assert!(matches!(err, AppError::ConnectionRejected(ref m) if m == "user_id is required"));
        assert_eq!(hub.status().connections.viewers, 0);
    }

    #[test]
    fn test_invalid_role_rejected() {
        let hub = hub();
        let err = hub.connect(&params("admin", "u1")).unwrap_err();
        assert!(matches!(err, AppError::ConnectionRejected(ref m) if m == "invalid role"));

        let mut p = params("viewer", "u1");
        p.role = None;
        assert!(hub.connect(&p).is_err());
    }

    #[test]
    fn test_anonymous_subscriber_opt_in() {
        let mut p = params("viewer_list", "");
        p.user_id = None;
        assert!(hub().connect(&p).is_err());

        let hub = SignalingHub::new(SignalingConfig {
            allow_anonymous_subscribers: true,
            ..Default::default()
        });
        let mut handle = hub.connect(&p).unwrap();
        assert!(handle.user_id.starts_with("anonymous_"));
        assert_eq!(types(&drain(&mut handle)), vec!["warning", "broadcast_list"]);
    }

    #[test]
    fn test_subscriber_receives_list_on_connect() {
        let hub = hub();
        let _b = live(&hub, "B1");

        let mut sub = connect(&hub, "list_subscriber", "S1");
        assert_eq!(sub.role, Role::ListSubscriber);
        let frames = drain(&mut sub);
        assert_eq!(types(&frames), vec!["broadcast_list"]);
        assert_eq!(frames[0]["broadcasts"][0]["broadcaster_id"], "B1");
    }

    #[test]
    fn test_start_broadcast_announced_once() {
        let hub = hub();
        let mut sub = connect(&hub, "viewer_list", "S1");
        drain(&mut sub);

        let b = connect(&hub, "broadcaster", "B1");
        send(&hub, &b, json!({"type": "start_broadcast"}));
        send(&hub, &b, json!({"type": "start_broadcast"}));

        let frames = drain(&mut sub);
        assert_eq!(types(&frames), vec!["broadcast_started"]);
        assert_eq!(frames[0]["broadcast"]["broadcaster_name"], "B1 name");
        assert_eq!(frames[0]["broadcast"]["viewer_count"], 0);
        assert_eq!(hub.list_active().len(), 1);
    }

    #[test]
    fn test_request_stream_attaches_viewer() {
        let hub = hub();
        let mut b = live(&hub, "B1");
        let mut v = connect(&hub, "viewer", "V1");

        send(&hub, &v, json!({"type": "request_stream", "broadcaster_id": "B1"}));

        assert_eq!(viewer_count(&hub, "B1"), Some(1));
        {
            let state = hub.state.read();
            assert_eq!(state.registry.pending_offer("V1"), Some("B1"));
            assert_eq!(
                state.registry.viewer("V1").unwrap().broadcaster_id.as_deref(),
                Some("B1")
            );
        }

        let frames = drain(&mut b);
        assert_eq!(types(&frames), vec!["offer_request", "viewer_count_update"]);
        assert_eq!(frames[0]["viewer_id"], "V1");
        assert_eq!(frames[0]["viewer_name"], "V1 name");
        assert_eq!(frames[1]["count"], 1);

        let frames = drain(&mut v);
        assert_eq!(types(&frames), vec!["viewer_count_update"]);
        assert_eq!(frames[0]["broadcaster_id"], "B1");
    }

    #[test]
    fn test_request_stream_repeated_keeps_count() {
        let hub = hub();
        let _b = live(&hub, "B1");
        let v = connect(&hub, "viewer", "V1");

        send(&hub, &v, json!({"type": "request_stream", "broadcaster_id": "B1"}));
        send(&hub, &v, json!({"type": "request_stream"}));

        assert_eq!(viewer_count(&hub, "B1"), Some(1));
        assert_eq!(hub.state.read().registry.pending_offer("V1"), Some("B1"));
    }

    #[test]
    fn test_request_stream_unknown_broadcast() {
        let hub = hub();
        let mut v = connect(&hub, "viewer", "V1");
        let mut sub = connect(&hub, "viewer_list", "S1");
        drain(&mut sub);

        send(&hub, &v, json!({"type": "request_stream", "broadcaster_id": "nobody"}));

        let frames = drain(&mut v);
        assert_eq!(types(&frames), vec!["error"]);
        assert_eq!(frames[0]["data"], "broadcast not found");
        assert!(drain(&mut sub).is_empty());
        assert_eq!(hub.status().connections.pending_offers, 0);
    }

    #[test]
    fn test_preferred_broadcast_is_fallback_target() {
        let hub = hub();
        let mut b = live(&hub, "B1");
        let mut p = params("viewer", "V1");
        p.broadcaster_id = Some("B1".to_string());
        let v = hub.connect(&p).unwrap();

        assert_eq!(viewer_count(&hub, "B1"), Some(0));
        send(&hub, &v, json!({"type": "request_stream"}));
        assert_eq!(viewer_count(&hub, "B1"), Some(1));
        assert_eq!(types(&drain(&mut b))[0], "offer_request");
    }

    #[test]
    fn test_offer_consumes_oldest_pending() {
        let hub = hub();
        let b = live(&hub, "B1");
        let mut v1 = connect(&hub, "viewer", "V1");
        let mut v2 = connect(&hub, "viewer", "V2");
        send(&hub, &v1, json!({"type": "request_stream", "broadcaster_id": "B1"}));
        send(&hub, &v2, json!({"type": "request_stream", "broadcaster_id": 42}));
        send(&hub, &v2, json!({"type": "request_stream", "broadcaster_id": "B1"}));
        drain(&mut v1);
        drain(&mut v2);

        send(&hub, &b, json!({"type": "offer", "data": {"sdp": "v=0"}}));

        let frames = drain(&mut v1);
        assert_eq!(types(&frames), vec!["offer"]);
        assert_eq!(frames[0]["broadcaster_id"], "B1");
        assert_eq!(frames[0]["data"]["sdp"], "v=0");
        assert!(drain(&mut v2).is_empty());

        let state = hub.state.read();
        assert_eq!(state.registry.pending_offer("V1"), None);
        assert_eq!(state.registry.pending_offer("V2"), Some("B1"));
    }

    #[test]
    fn test_offer_with_explicit_viewer() {
        let hub = hub();
        let b = live(&hub, "B1");
        let mut v1 = connect(&hub, "viewer", "V1");
        let mut v2 = connect(&hub, "viewer", "V2");
        send(&hub, &v1, json!({"type": "request_stream", "broadcaster_id": "B1"}));
        send(&hub, &v2, json!({"type": "request_stream", "broadcaster_id": "B1"}));
        drain(&mut v1);
        drain(&mut v2);

        send(&hub, &b, json!({"type": "offer", "viewer_id": "V2", "data": "sdp"}));

        assert!(drain(&mut v1).is_empty());
        assert_eq!(types(&drain(&mut v2)), vec!["offer"]);
        assert_eq!(hub.state.read().registry.pending_offer("V1"), Some("B1"));
        assert_eq!(hub.state.read().registry.pending_offer("V2"), None);
    }

    #[test]
    fn test_answer_and_candidates_relayed() {
        let hub = hub();
        let mut b = live(&hub, "B1");
        let mut v = connect(&hub, "viewer", "V1");
        send(&hub, &v, json!({"type": "request_stream", "broadcaster_id": "B1"}));
        drain(&mut b);
        drain(&mut v);

        send(&hub, &v, json!({"type": "answer", "data": "answer-sdp"}));
        send(&hub, &v, json!({"type": "candidate", "broadcaster_id": "B1", "data": "c1"}));
        let frames = drain(&mut b);
        assert_eq!(types(&frames), vec!["answer", "candidate"]);
        assert_eq!(frames[0]["viewer_id"], "V1");
        assert_eq!(frames[0]["data"], "answer-sdp");
        assert_eq!(frames[1]["viewer_id"], "V1");

        send(&hub, &b, json!({"type": "candidate", "viewer_id": "V1", "data": "c2"}));
        send(&hub, &b, json!({"type": "candidate", "data": "lost"}));
        let frames = drain(&mut v);
        assert_eq!(types(&frames), vec!["candidate"]);
        assert_eq!(frames[0]["broadcaster_id"], "B1");
        assert_eq!(frames[0]["data"], "c2");
    }

    #[test]
    fn test_join_and_leave() {
        let hub = hub();
        let mut b = live(&hub, "B1");
        let mut v = connect(&hub, "viewer", "V1");

        send(&hub, &v, json!({"type": "viewer_join", "broadcaster_id": "B1"}));
        assert_eq!(viewer_count(&hub, "B1"), Some(1));
        let frames = drain(&mut b);
        assert_eq!(types(&frames), vec!["viewer_joined", "viewer_count_update"]);
        assert_eq!(frames[0]["count"], 1);
        let frames = drain(&mut v);
        assert_eq!(types(&frames), vec!["viewer_count_update", "join_confirmed"]);
        assert_eq!(frames[1]["broadcast"]["viewer_count"], 1);

        send(&hub, &v, json!({"type": "viewer_leave"}));
        assert_eq!(viewer_count(&hub, "B1"), Some(0));
        let frames = drain(&mut b);
        assert_eq!(types(&frames), vec!["viewer_left", "viewer_count_update"]);
        assert_eq!(frames[0]["viewer_id"], "V1");
        assert_eq!(frames[0]["count"], 0);
        let frames = drain(&mut v);
        assert_eq!(types(&frames), vec!["leave_confirmed"]);
        assert_eq!(frames[0]["broadcaster_id"], "B1");

        assert!(hub.state.read().registry.viewer("V1").is_none());
        send(&hub, &v, json!({"type": "viewer_leave"}));
        assert_eq!(viewer_count(&hub, "B1"), Some(0));
    }

    #[test]
    fn test_switching_broadcasts_moves_count() {
        let hub = hub();
        let _b1 = live(&hub, "B1");
        let _b2 = live(&hub, "B2");
        let v = connect(&hub, "viewer", "V1");

        send(&hub, &v, json!({"type": "viewer_join", "broadcaster_id": "B1"}));
        send(&hub, &v, json!({"type": "viewer_join", "broadcaster_id": "B1"}));
        assert_eq!(viewer_count(&hub, "B1"), Some(1));

        send(&hub, &v, json!({"type": "request_stream", "broadcaster_id": "B2"}));
        assert_eq!(viewer_count(&hub, "B1"), Some(0));
        assert_eq!(viewer_count(&hub, "B2"), Some(1));
    }

    #[test]
    fn test_viewer_disconnect_releases_count() {
        let hub = hub();
        let mut b = live(&hub, "B1");
        let v = connect(&hub, "viewer", "V1");
        send(&hub, &v, json!({"type": "request_stream", "broadcaster_id": "B1"}));
        drain(&mut b);

        assert!(hub.disconnect(v.id));
        assert!(!hub.disconnect(v.id));

        assert_eq!(viewer_count(&hub, "B1"), Some(0));
        let frames = drain(&mut b);
        assert_eq!(types(&frames), vec!["viewer_left", "viewer_count_update"]);
        assert_eq!(hub.status().connections.pending_offers, 0);
    }

    #[test]
    fn test_broadcaster_disconnect_ends_broadcast() {
        let hub = hub();
        let b = live(&hub, "B1");
        let mut v1 = connect(&hub, "viewer", "V1");
        let mut v2 = connect(&hub, "viewer", "V2");
        let mut idle = connect(&hub, "viewer", "V3");
        send(&hub, &v1, json!({"type": "request_stream", "broadcaster_id": "B1"}));
        send(&hub, &v2, json!({"type": "viewer_join", "broadcaster_id": "B1"}));
        drain(&mut v1);
        drain(&mut v2);
        let mut sub = connect(&hub, "viewer_list", "S1");
        drain(&mut sub);

        assert!(hub.disconnect(b.id));

        for v in [&mut v1, &mut v2] {
            let frames = drain(v);
            assert_eq!(types(&frames), vec!["broadcast_ended"]);
            assert_eq!(frames[0]["broadcaster_id"], "B1");
            assert_eq!(frames[0]["broadcast"]["viewer_count"], 2);
            assert_eq!(frames[0]["broadcast"]["is_live"], false);
            assert!(is_closed(v));
        }
        assert!(drain(&mut idle).is_empty());
        assert!(!is_closed(&mut idle));

        let frames = drain(&mut sub);
        assert_eq!(types(&frames), vec!["broadcast_ended"]);
        assert!(frames[0].get("broadcast").is_none());

        let status = hub.status();
        assert_eq!(status.broadcasts.active_count, 0);
        assert_eq!(status.connections.viewers, 1);
        assert_eq!(status.connections.pending_offers, 0);
        assert!(!hub.disconnect(v1.id));
    }

    #[test]
    fn test_stop_unknown_broadcast_is_noop() {
        let hub = hub();
        let mut b = connect(&hub, "broadcaster", "B1");
        send(&hub, &b, json!({"type": "stop_broadcast"}));
        assert!(drain(&mut b).is_empty());
        assert!(hub.list_active().is_empty());

        send(&hub, &b, json!({"type": "start_broadcast"}));
        send(&hub, &b, json!({"type": "stop_broadcast"}));
        send(&hub, &b, json!({"type": "stop_broadcast"}));
        assert!(hub.list_active().is_empty());
        assert!(!is_closed(&mut b));
    }

    #[test]
    fn test_duplicate_identity_replaces_connection() {
        let hub = hub();
        let mut old = live(&hub, "B1");
        let v = connect(&hub, "viewer", "V1");
        send(&hub, &v, json!({"type": "request_stream", "broadcaster_id": "B1"}));

        let new = connect(&hub, "broadcaster", "B1");
        drain(&mut old);
        assert!(is_closed(&mut old));
        assert!(hub.list_active().is_empty());

        assert!(!hub.disconnect(old.id));
        let state = hub.state.read();
        assert_eq!(state.registry.holder(Role::Broadcaster, "B1"), Some(new.id));
    }

    #[test]
    fn test_same_user_multiple_list_connections() {
        let hub = hub();
        let mut first_tab = connect(&hub, "viewer_list", "U1");
        let mut second_tab = connect(&hub, "viewer_list", "U1");
        drain(&mut first_tab);
        drain(&mut second_tab);
        assert_eq!(hub.status().connections.list_subscribers, 2);

        let b = connect(&hub, "broadcaster", "B1");
        send(&hub, &b, json!({"type": "start_broadcast"}));

        for tab in [&mut first_tab, &mut second_tab] {
            assert_eq!(types(&drain(tab)), vec!["broadcast_started"]);
            assert!(!is_closed(tab));
        }

        assert!(hub.disconnect(first_tab.id));
        assert_eq!(hub.status().connections.list_subscribers, 1);
    }

    #[test]
    fn test_preselected_viewer_told_broadcast_ended() {
        let hub = hub();
        let b = live(&hub, "B1");
        let mut p = params("viewer", "V1");
        p.broadcaster_id = Some("B1".to_string());
        let mut waiting = hub.connect(&p).unwrap();
        let mut elsewhere = connect(&hub, "viewer", "V2");

        assert!(hub.disconnect(b.id));

        let frames = drain(&mut waiting);
        assert_eq!(types(&frames), vec!["broadcast_ended"]);
        assert_eq!(frames[0]["broadcaster_id"], "B1");
        assert!(!is_closed(&mut waiting));
        assert!(drain(&mut elsewhere).is_empty());
        assert_eq!(hub.status().connections.viewers, 2);
    }

    #[test]
    fn test_concurrent_churn_keeps_counts_consistent() {
        let hub = hub();
        let _b1 = live(&hub, "B1");
        let _b2 = live(&hub, "B2");

        std::thread::scope(|s| {
            for t in 0..8usize {
                let hub = &hub;
                s.spawn(move || {
                    for i in 0..60usize {
                        let mut v = connect(hub, "viewer", &format!("V{}-{}", t, i % 4));
                        let target = if (t + i) % 2 == 0 { "B1" } else { "B2" };
                        send(hub, &v, json!({"type": "viewer_join", "broadcaster_id": target}));
                        send(hub, &v, json!({"type": "request_stream", "broadcaster_id": "B1"}));
                        match i % 3 {
                            0 => send(hub, &v, json!({"type": "viewer_leave"})),
                            1 => {
                                hub.disconnect(v.id);
                            }
                            _ => {}
                        }
                        drain(&mut v);
                    }
                });
            }
        });

        let state = hub.state.read();
        for broadcaster_id in ["B1", "B2"] {
            let attached = state.registry.viewers_of(broadcaster_id).count();
            let record = state.directory.get(broadcaster_id).unwrap();
            assert_eq!(record.viewer_count as usize, attached, "{}", broadcaster_id);
        }
    }

    #[test]
    fn test_same_user_in_two_roles() {
        let hub = hub();
        let b = connect(&hub, "broadcaster", "U1");
        let v = connect(&hub, "viewer", "U1");
        let s = connect(&hub, "viewer_list", "U1");

        let state = hub.state.read();
        for id in [b.id, v.id, s.id] {
            assert_eq!(state.registry.memberships(id), 1);
        }
    }

    #[test]
    fn test_broadcast_list_and_ping() {
        let hub = hub();
        let _b1 = live(&hub, "B1");
        let _b2 = live(&hub, "B2");
        for viewer in ["V1", "V2"] {
            let v = connect(&hub, "viewer", viewer);
            send(&hub, &v, json!({"type": "viewer_join", "broadcaster_id": "B1"}));
        }
        let mut sub = connect(&hub, "viewer_list", "S1");
        drain(&mut sub);

        send(&hub, &sub, json!({"type": "get_broadcast_list"}));
        send(&hub, &sub, json!({"type": "ping"}));
        let frames = drain(&mut sub);
        assert_eq!(types(&frames), vec!["broadcast_list", "pong"]);

        let mut counts: Vec<(String, u64)> = frames[0]["broadcasts"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| {
                (
                    b["broadcaster_id"].as_str().unwrap().to_string(),
                    b["viewer_count"].as_u64().unwrap(),
                )
            })
            .collect();
        counts.sort();
        assert_eq!(counts, vec![("B1".to_string(), 2), ("B2".to_string(), 0)]);
        assert!(frames[1]["timestamp"].is_string());
    }

    #[test]
    fn test_bad_frames_keep_connection() {
        let hub = hub();
        let mut b = live(&hub, "B1");

        hub.handle_text(b.id, "not json");
        hub.handle_text(b.id, "[1, 2]");
        send(&hub, &b, json!({"type": "dance"}));
        send(&hub, &b, json!({"type": "offer_request"}));
        send(&hub, &b, json!({"type": "viewer_join", "broadcaster_id": "B1"}));

        assert!(drain(&mut b).is_empty());
        assert!(!is_closed(&mut b));
        assert_eq!(viewer_count(&hub, "B1"), Some(0));
    }

    #[test]
    fn test_query_surface() {
        let hub = hub();
        assert!(matches!(hub.broadcast_stats("B1"), Err(AppError::NotFound(_))));

        let _b1 = live(&hub, "B1");
        let _b2 = live(&hub, "B2");
        for (viewer, target) in [("V1", "B1"), ("V2", "B1"), ("V3", "B2")] {
            let v = connect(&hub, "viewer", viewer);
            send(&hub, &v, json!({"type": "request_stream", "broadcaster_id": target}));
        }
        let _sub = connect(&hub, "viewer_list", "S1");

        let stats = hub.broadcast_stats("B1").unwrap();
        assert_eq!(stats.viewer_count, 2);
        let mut viewers: Vec<_> = stats.viewers.iter().map(|v| v.viewer_id.as_str()).collect();
        viewers.sort();
        assert_eq!(viewers, vec!["V1", "V2"]);

        let status = hub.status();
        assert_eq!(status.connections.broadcasters, 2);
        assert_eq!(status.connections.viewers, 3);
        assert_eq!(status.connections.list_subscribers, 1);
        assert_eq!(status.connections.pending_offers, 3);
        assert_eq!(status.broadcasts.active_count, 2);
        assert_eq!(status.broadcasts.total_viewers, 3);
        assert!((status.broadcasts.average_viewers - 1.5).abs() < f64::EPSILON);
        assert_eq!(status.broadcasts.broadcaster_viewers["B2"], 1);
    }
}
