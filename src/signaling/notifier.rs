//! Fan-out notifier
//!
//! Every connection owns a bounded outbound queue ([`Outbox`]). Delivery is
//! a non-blocking push into that queue, so it is safe to perform while the
//! relay lock is held: a peer that stops reading only loses its own
//! messages and never stalls routing for anyone else.
//!
//! Delivery is best effort. A full or closed queue is logged (throttled per
//! connection) and the message is dropped; callers never see the failure.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::message::ServerMessage;
use super::registry::ConnectionId;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Sending half of a connection's outbound queue
///
/// The relay closes a connection by dropping every `Outbox` for it: the
/// receiving side drains what is already queued and then observes the end
/// of the channel.
#[derive(Debug)]
pub struct Outbox {
    conn_id: ConnectionId,
    tx: mpsc::Sender<Arc<str>>,
}

/// Receiving half of a connection's outbound queue
pub type Inbox = mpsc::Receiver<Arc<str>>;

impl Outbox {
    /// Create a queue holding at most `capacity` pending frames
    pub fn channel(conn_id: ConnectionId, capacity: usize) -> (Outbox, Inbox) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Outbox { conn_id, tx }, rx)
    }
}

/// Outcome of a single delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The peer is not draining its queue
    Full,
    /// The peer's connection is gone
    Closed,
}

/// Best-effort message delivery to one or many connections
pub struct Notifier {
    throttler: LogThrottler,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            throttler: LogThrottler::with_secs(5),
        }
    }

    /// Serialize a message once
    pub fn encode(message: &ServerMessage) -> Option<Arc<str>> {
        match serde_json::to_string(message) {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                error!("Failed to serialize {} message: {}", message.kind(), e);
                None
            }
        }
    }

    /// Push an already-encoded frame into one outbox
    pub fn send_raw(&self, outbox: &Outbox, frame: Arc<str>) -> Delivery {
        match outbox.tx.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn_throttled!(
                    self.throttler,
                    &outbox.conn_id.to_string(),
                    conn_id = %outbox.conn_id,
                    "Outbound queue full, dropping message"
                );
                Delivery::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn_id = %outbox.conn_id, "Outbound queue closed, dropping message");
                Delivery::Closed
            }
        }
    }

    /// Single-target delivery used for direct replies
    pub fn notify_one(&self, outbox: &Outbox, message: &ServerMessage) -> Delivery {
        match Self::encode(message) {
            Some(frame) => self.send_raw(outbox, frame),
            None => Delivery::Closed,
        }
    }

    /// Serialize `message` once and deliver it to every target
    ///
    /// A failed delivery does not interrupt the others. Returns how many
    /// targets accepted the message.
    pub fn notify_all<'a, I>(&self, targets: I, message: &ServerMessage) -> usize
    where
        I: IntoIterator<Item = &'a Outbox>,
    {
        let Some(frame) = Self::encode(message) else {
            return 0;
        };

        let mut total = 0;
        let mut delivered = 0;
        for outbox in targets {
            total += 1;
            if self.send_raw(outbox, frame.clone()) == Delivery::Queued {
                delivered += 1;
            }
        }

        if total > 0 {
            debug!(
                "Fan-out {}: delivered to {}/{} connections",
                message.kind(),
                delivered,
                total
            );
        }
        delivered
    }

    /// Release per-connection log state once a connection is gone
    pub fn forget(&self, conn_id: ConnectionId) {
        self.throttler.forget(&conn_id.to_string());
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
