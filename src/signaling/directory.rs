//! Broadcast directory: the live broadcasts, keyed by broadcaster id

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::message::BroadcastSummary;

/// One live broadcast
#[derive(Debug, Clone)]
pub struct BroadcastRecord {
    pub broadcaster_id: String,
    pub broadcaster_name: String,
    pub started_at: DateTime<Utc>,
    pub viewer_count: u32,
    pub is_live: bool,
}

impl BroadcastRecord {
    pub fn summary(&self) -> BroadcastSummary {
        BroadcastSummary {
            broadcaster_id: self.broadcaster_id.clone(),
            broadcaster_name: self.broadcaster_name.clone(),
            start_time: self.started_at,
            viewer_count: self.viewer_count,
            is_live: self.is_live,
        }
    }
}

/// Result of [`Directory::start`]
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(BroadcastSummary),
    /// A record already existed; it is left untouched
    AlreadyLive(BroadcastSummary),
}

#[derive(Debug, Default)]
pub struct Directory {
    broadcasts: HashMap<String, BroadcastRecord>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a live record with zero viewers
    ///
    /// Starting an already-live broadcast keeps the existing record, so its
    /// start time and viewer count survive a repeated `start_broadcast`.
    pub fn start(&mut self, broadcaster_id: &str, broadcaster_name: &str) -> StartOutcome {
        if let Some(existing) = self.broadcasts.get(broadcaster_id) {
            return StartOutcome::AlreadyLive(existing.summary());
        }

        let record = BroadcastRecord {
            broadcaster_id: broadcaster_id.to_string(),
            broadcaster_name: broadcaster_name.to_string(),
            started_at: Utc::now(),
            viewer_count: 0,
            is_live: true,
        };
        let summary = record.summary();
        self.broadcasts.insert(broadcaster_id.to_string(), record);
        StartOutcome::Started(summary)
    }

    /// Remove a broadcast. Stopping an unknown broadcast is a no-op.
    pub fn stop(&mut self, broadcaster_id: &str) -> Option<BroadcastRecord> {
        let mut record = self.broadcasts.remove(broadcaster_id)?;
        record.is_live = false;
        Some(record)
    }

    /// Returns the new count, or `None` if the broadcast is not live
    pub fn increment(&mut self, broadcaster_id: &str) -> Option<u32> {
        let record = self.broadcasts.get_mut(broadcaster_id)?;
        record.viewer_count = record.viewer_count.saturating_add(1);
        Some(record.viewer_count)
    }

    /// Returns the new count (never below zero), or `None` if the broadcast
    /// is not live
    pub fn decrement(&mut self, broadcaster_id: &str) -> Option<u32> {
        let record = self.broadcasts.get_mut(broadcaster_id)?;
        record.viewer_count = record.viewer_count.saturating_sub(1);
        Some(record.viewer_count)
    }

    pub fn get(&self, broadcaster_id: &str) -> Option<&BroadcastRecord> {
        self.broadcasts.get(broadcaster_id)
    }

    pub fn is_live(&self, broadcaster_id: &str) -> bool {
        self.broadcasts.contains_key(broadcaster_id)
    }

    /// Snapshot of every live broadcast
    pub fn list_active(&self) -> Vec<BroadcastSummary> {
        self.broadcasts.values().map(BroadcastRecord::summary).collect()
    }
}
