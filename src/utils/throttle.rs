//! Log throttling utility
//!
//! A peer that stops reading fills its outbound queue, and every further
//! delivery attempt would otherwise log the same warning. The throttler
//! limits how often a message is recorded per key.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Log throttler that limits how often the same message is logged
///
/// ```rust
/// use std::time::Duration;
/// use beacon_relay::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("outbox_full:42"));
/// assert!(!throttler.should_log("outbox_full:42"));
/// ```
pub struct LogThrottler {
    /// Map of message key to last log time
    last_logged: Mutex<HashMap<String, Instant>>,
    /// Throttle interval
    interval: Duration,
}

impl LogThrottler {
    /// Create a new log throttler with the specified interval
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Create a new log throttler with interval specified in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if a message for `key` should be logged now, and
    /// records the attempt if so.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.last_logged.lock();
        match map.get(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop throttle state for a key whose owner has gone away
    pub fn forget(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }
}

/// Macro for throttled warning logging
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}
