use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::types::{LinkError, LinkResult};

/// Sliding-window limiter keyed by `(message type, sender)`.
///
/// Gates outbound submissions only; inbound frames are never limited.
#[derive(Debug, Clone)]
pub struct KeyedRateLimiter {
    max_requests: u32,
    window: Duration,
    windows: HashMap<String, VecDeque<Instant>>,
    last_prune: Instant,
}

impl KeyedRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: HashMap::new(),
            last_prune: Instant::now(),
        }
    }

    pub fn key(kind: &str, sender: &str) -> String {
        format!("{kind}:{sender}")
    }

    pub fn try_acquire(&mut self, kind: &str, sender: &str) -> LinkResult<()> {
        self.try_acquire_at(&Self::key(kind, sender), Instant::now())
    }

    pub(crate) fn try_acquire_at(&mut self, key: &str, now: Instant) -> LinkResult<()> {
        if now.saturating_duration_since(self.last_prune) >= self.window {
            self.prune_idle(now);
        }

        if self.max_requests == 0 {
            return Err(LinkError::RateLimitExceeded {
                key: key.to_string(),
                retry_after: self.window,
            });
        }

        let window = self.window;
        let stamps = self.windows.entry(key.to_string()).or_default();
        while stamps
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            stamps.pop_front();
        }

        if stamps.len() >= self.max_requests as usize {
            // Oldest in-window request decides when a slot frees up.
            let retry_after = stamps
                .front()
                .map(|oldest| window.saturating_sub(now.saturating_duration_since(*oldest)))
                .unwrap_or(window);
            return Err(LinkError::RateLimitExceeded {
                key: key.to_string(),
                retry_after,
            });
        }

        stamps.push_back(now);
        Ok(())
    }

    /// Requests currently counted against `key`.
    pub fn in_window(&self, kind: &str, sender: &str) -> usize {
        let now = Instant::now();
        self.windows
            .get(&Self::key(kind, sender))
            .map(|stamps| {
                stamps
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < self.window)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Drop keys with no request inside the window.
    pub fn prune_idle(&mut self, now: Instant) {
        let window = self.window;
        self.windows.retain(|_, stamps| {
            stamps
                .back()
                .is_some_and(|t| now.saturating_duration_since(*t) < window)
        });
        self.last_prune = now;
    }

    pub fn clear(&mut self) {
        self.windows.clear();
    }
}

impl Default for KeyedRateLimiter {
    fn default() -> Self {
        Self::new(100, Duration::from_secs(60))
    }
}
