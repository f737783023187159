use std::time::{Duration, Instant};

use super::types::CircuitSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
}

/// Connection attempt guard that blocks new attempts after repeated failures.
///
/// There is no half-open probing: once the cooldown elapses the circuit closes with a fresh
/// failure count, and any successful connection closes it immediately.
#[derive(Debug, Clone)]
pub struct LinkCircuitBreaker {
    state: CircuitState,
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
}

impl LinkCircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_threshold: failure_threshold.max(1),
            cooldown,
            consecutive_failures: 0,
        }
    }

    /// Whether new connection attempts may proceed right now.
    pub fn can_proceed(&mut self) -> bool {
        !self.is_open_at(Instant::now())
    }

    pub fn is_open(&mut self) -> bool {
        self.is_open_at(Instant::now())
    }

    pub(crate) fn is_open_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => false,
            CircuitState::Open { opened_at } => {
                if now.saturating_duration_since(opened_at) >= self.cooldown {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub(crate) fn record_failure_at(&mut self, now: Instant) {
        // Let an elapsed cooldown close the circuit before counting.
        let _ = self.is_open_at(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state == CircuitState::Closed && self.consecutive_failures >= self.failure_threshold
        {
            self.state = CircuitState::Open { opened_at: now };
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn time_until_retry(&self) -> Option<Duration> {
        self.time_until_retry_at(Instant::now())
    }

    fn time_until_retry_at(&self, now: Instant) -> Option<Duration> {
        match self.state {
            CircuitState::Open { opened_at } => {
                (opened_at + self.cooldown).checked_duration_since(now)
            }
            CircuitState::Closed => None,
        }
    }

    pub fn snapshot(&mut self) -> CircuitSnapshot {
        let now = Instant::now();
        let is_open = self.is_open_at(now);
        CircuitSnapshot {
            is_open,
            consecutive_failures: self.consecutive_failures,
            retry_in: self.time_until_retry_at(now),
        }
    }
}

impl Default for LinkCircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}
