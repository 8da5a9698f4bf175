//! Configuration management
//!
//! The relay keeps no state across restarts, so configuration is read once
//! at startup from an optional JSON file and then treated as immutable.

mod schema;
mod store;

pub use schema::*;
pub use store::load_config;
