use std::time::{Duration, Instant};

/// One broker endpoint the link may connect to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub is_primary: bool,
}

impl Endpoint {
    pub fn primary(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_primary: true,
        }
    }

    pub fn fallback(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            is_primary: false,
        }
    }
}

/// Result of rotating the active endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailoverOutcome {
    pub from: String,
    pub to: String,
    pub failovers: u64,
}

/// Ordered `[primary, fallback..]` endpoint list with a circular cursor.
#[derive(Clone, Debug)]
pub struct EndpointSelector {
    endpoints: Vec<Endpoint>,
    cursor: usize,
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    last_failover: Option<Instant>,
    failovers: u64,
    rotations_since_success: usize,
}

impl EndpointSelector {
    /// `endpoints` must be non-empty; the first entry is treated as the primary.
    pub fn new(primary: impl Into<String>, fallbacks: Vec<String>, threshold: u32, cooldown: Duration) -> Self {
        let mut endpoints = Vec::with_capacity(fallbacks.len() + 1);
        endpoints.push(Endpoint::primary(primary));
        endpoints.extend(fallbacks.into_iter().map(Endpoint::fallback));
        Self {
            endpoints,
            cursor: 0,
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            last_failover: None,
            failovers: 0,
            rotations_since_success: 0,
        }
    }

    pub fn active(&self) -> &Endpoint {
        &self.endpoints[self.cursor]
    }

    pub fn has_fallbacks(&self) -> bool {
        self.endpoints.len() > 1
    }

    /// An endpoint not yet tried since the last successful connection remains.
    pub fn has_untried(&self) -> bool {
        self.has_fallbacks() && self.rotations_since_success < self.endpoints.len() - 1
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn failovers(&self) -> u64 {
        self.failovers
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.rotations_since_success = 0;
    }

    /// Count a failure against the active endpoint and rotate when the threshold and cooldown
    /// allow it.
    pub fn record_failure(&mut self) -> Option<FailoverOutcome> {
        self.record_failure_at(Instant::now())
    }

    pub(crate) fn record_failure_at(&mut self, now: Instant) -> Option<FailoverOutcome> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.has_fallbacks() || self.consecutive_failures < self.threshold {
            return None;
        }
        let cooled = self
            .last_failover
            .is_none_or(|at| now.saturating_duration_since(at) >= self.cooldown);
        if !cooled {
            return None;
        }
        Some(self.rotate(now))
    }

    /// Rotate regardless of threshold and cooldown, used once local retries are exhausted.
    pub fn force_failover(&mut self) -> Option<FailoverOutcome> {
        if !self.has_untried() {
            return None;
        }
        Some(self.rotate(Instant::now()))
    }

    fn rotate(&mut self, now: Instant) -> FailoverOutcome {
        let from = self.active().url.clone();
        self.cursor = (self.cursor + 1) % self.endpoints.len();
        self.consecutive_failures = 0;
        self.last_failover = Some(now);
        self.failovers = self.failovers.saturating_add(1);
        self.rotations_since_success = self.rotations_since_success.saturating_add(1);
        FailoverOutcome {
            from,
            to: self.active().url.clone(),
            failovers: self.failovers,
        }
    }
}
