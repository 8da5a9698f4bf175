//! Connection lifecycle
//!
//! Each accepted connection runs [`run_connection`] on its own task. The
//! task registers the connection with the hub, then multiplexes two
//! directions until either side ends:
//!
//! - frames read from the transport are handed to the hub for routing
//! - frames the relay queued in the connection's outbox are written to the
//!   transport
//!
//! The transport is abstracted as a `Stream` of inbound [`Frame`]s and a
//! `Sink` of outbound ones, so the loop does not depend on a particular
//! WebSocket implementation.

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::hub::SignalingHub;
use super::message::ServerMessage;
use super::notifier::Notifier;
use super::registry::ConnectionId;
use crate::error::AppError;

/// Connect parameters, taken from the upgrade request's query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectParams {
    pub role: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    /// Broadcast a viewer wants to watch, used when its messages name none
    pub broadcaster_id: Option<String>,
}

/// Transport frame seen by the lifecycle loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Connecting,
    Active,
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

fn transition(conn_id: Option<ConnectionId>, state: LifecycleState) {
    match conn_id {
        Some(conn_id) => debug!(conn_id = %conn_id, "Connection {}", state),
        None => debug!("Connection {}", state),
    }
}

/// Drive one connection from registration to cleanup
///
/// A rejected connection gets a single `error` frame and is closed without
/// being registered. Otherwise the loop ends when the peer closes, the
/// transport fails, or the relay drops the connection (after the frames
/// already queued for it have been written). The hub's disconnect cascade
/// always runs before returning.
pub async fn run_connection<S, K, E>(
    hub: Arc<SignalingHub>,
    params: ConnectParams,
    mut stream: S,
    mut sink: K,
) where
    S: Stream<Item = Result<Frame, E>> + Unpin,
    E: fmt::Display,
    K: Sink<Frame> + Unpin,
    K::Error: fmt::Display,
{
    transition(None, LifecycleState::Connecting);

    let mut handle = match hub.connect(&params) {
        Ok(handle) => handle,
        Err(e) => {
            let reason = match e {
                AppError::ConnectionRejected(reason) => reason,
                other => other.to_string(),
            };
            if let Some(frame) = Notifier::encode(&ServerMessage::error(reason)) {
                if let Err(e) = sink.send(Frame::Text(frame.to_string())).await {
                    debug!("Failed to send rejection: {}", e);
                }
            }
            if let Err(e) = sink.send(Frame::Close).await {
                debug!("Failed to send close frame: {}", e);
            }
            transition(None, LifecycleState::Closed);
            return;
        }
    };
    let conn_id = handle.id;
    transition(Some(conn_id), LifecycleState::Active);

    loop {
        tokio::select! {
            biased;

            queued = handle.inbox.recv() => match queued {
                Some(frame) => {
                    if let Err(e) = sink.send(Frame::Text(frame.to_string())).await {
                        warn!(conn_id = %conn_id, "Failed to write to peer: {}", e);
                        break;
                    }
                }
                None => {
                    info!(conn_id = %conn_id, user_id = %handle.user_id, "Connection closed by relay");
                    break;
                }
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Frame::Text(text))) => hub.handle_text(conn_id, &text),
                Some(Ok(Frame::Close)) | None => {
                    info!(conn_id = %conn_id, user_id = %handle.user_id, "Peer disconnected");
                    break;
                }
                Some(Err(e)) => {
                    warn!(conn_id = %conn_id, "Receive error: {}", e);
                    break;
                }
            },
        }
    }

    hub.disconnect(conn_id);
    if let Err(e) = sink.send(Frame::Close).await {
        debug!(conn_id = %conn_id, "Failed to send close frame: {}", e);
    }
    transition(Some(conn_id), LifecycleState::Closed);
}
