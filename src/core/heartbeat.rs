use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::envelope::WireFrame;
use super::types::now_epoch_ms;

/// Result of matching an inbound heartbeat frame against outstanding probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Matched probe with its measured round trip.
    Response(Duration),
    /// Response for a probe we never sent or already timed out.
    Unmatched,
}

/// Application-level heartbeat probes keyed by the echoed timestamp.
#[derive(Debug)]
pub struct HeartbeatTracker {
    interval: Duration,
    timeout: Duration,
    pending: HashMap<u64, Instant>,
    max_pending: usize,
}

impl HeartbeatTracker {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            pending: HashMap::new(),
            max_pending: 4,
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Build the next probe, returning its key and frame; `None` while too many are in flight.
    pub fn create_probe(&mut self) -> Option<(u64, WireFrame)> {
        if self.pending.len() >= self.max_pending {
            return None;
        }

        let mut key = now_epoch_ms();
        while self.pending.contains_key(&key) {
            key = key.saturating_add(1);
        }
        self.pending.insert(key, Instant::now());
        Some((key, WireFrame::heartbeat(key)))
    }

    pub fn handle_response(&mut self, key: u64) -> HeartbeatResult {
        let Some(sent_at) = self.pending.remove(&key) else {
            return HeartbeatResult::Unmatched;
        };
        HeartbeatResult::Response(sent_at.elapsed())
    }

    /// Whether the given probe is still awaiting its response.
    pub fn is_outstanding(&self, key: u64) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}
