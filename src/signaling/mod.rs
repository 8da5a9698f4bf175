//! WebRTC signaling relay
//!
//! Brokers session setup between one broadcaster and many viewers. Only
//! signaling metadata passes through; media never touches the relay.
//!
//! # Architecture
//!
//! ```text
//! transport ──► session ──► hub ──(lock)──► router ──► registry / directory
//!                 ▲                            │
//!                 └──────── outbox ◄── notifier ┘
//! ```
//!
//! - [`registry`]: open connections by role, viewer sessions, pending offers
//! - [`directory`]: live broadcasts and their viewer counts
//! - [`router`]: the `(role, message type)` state machine
//! - [`notifier`]: best-effort delivery into per-connection outboxes
//! - [`hub`]: the coordinator owning all of the above behind one lock
//! - [`session`]: the per-connection receive/write loop

pub mod directory;
pub mod hub;
pub mod message;
pub mod notifier;
pub mod registry;
pub(crate) mod router;
pub mod session;

pub use directory::{BroadcastRecord, Directory, StartOutcome};
pub use hub::{BroadcastStats, ConnectionHandle, ServerStatus, SignalingHub, ViewerInfo};
pub use message::{BroadcastSummary, ClientMessage, Inbound, ServerMessage};
pub use notifier::{Delivery, Inbox, Notifier, Outbox};
pub use registry::{Connection, ConnectionId, Registry, Role, ViewerRecord};
pub use session::{run_connection, ConnectParams, Frame, LifecycleState};
