//! Utility modules shared across the relay

pub mod throttle;

pub use throttle::LogThrottler;
