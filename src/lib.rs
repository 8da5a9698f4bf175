//! Beacon Relay - WebRTC signaling for one-to-many live broadcasts
//!
//! Brokers offer/answer/candidate exchange between a broadcaster and its
//! viewers over WebSocket, and keeps a live directory of broadcasts for
//! list subscribers.

pub mod config;
pub mod error;
pub mod signaling;
pub mod state;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
