use hdrhistogram::Histogram;
use std::time::{Duration, Instant};

use super::circular_buffer::CircularBuffer;
use super::types::{NetworkQuality, WsConnectionStats};

const MAX_RECENT_ERRORS: usize = 100;
const MAX_ERROR_TEXT_BYTES: usize = 1024;

/// One heartbeat round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSample {
    pub timestamp: Instant,
    pub latency: Duration,
}

/// Tier transition produced by a new sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityChange {
    pub from: Option<NetworkQuality>,
    pub to: NetworkQuality,
    pub avg_latency: Duration,
}

#[derive(Debug, Clone)]
struct InternalErrorRec {
    _timestamp: Instant,
    _context: String,
    _error: String,
}

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_ERROR_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_ERROR_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Health monitor tracking link liveness and latency without interior mutability.
#[derive(Debug)]
pub struct WsHealthMonitor {
    connection_started: Instant,
    last_message_received: Instant,
    last_message_sent: Instant,
    message_count: u64,
    error_count: u64,
    reconnect_count: u64,
    internal_errors: CircularBuffer<InternalErrorRec>,
    samples: CircularBuffer<HealthSample>,
    quality: Option<NetworkQuality>,
    latency_histogram: Histogram<u64>,
}

impl WsHealthMonitor {
    pub fn new(sample_window: usize) -> Self {
        let now = Instant::now();
        Self {
            connection_started: now,
            last_message_received: now,
            last_message_sent: now,
            message_count: 0,
            error_count: 0,
            reconnect_count: 0,
            internal_errors: CircularBuffer::new(MAX_RECENT_ERRORS),
            samples: CircularBuffer::new(sample_window.max(1)),
            quality: None,
            latency_histogram: Histogram::new_with_bounds(1, 60_000_000, 3)
                .expect("histogram bounds are valid"),
        }
    }

    /// Start a new connection period. Latency samples are kept: network quality outlives a
    /// single socket.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.connection_started = now;
        self.last_message_received = now;
        self.last_message_sent = now;
    }

    pub fn record_message(&mut self) {
        self.last_message_received = Instant::now();
        self.message_count = self.message_count.saturating_add(1);
    }

    pub fn record_sent(&mut self) {
        self.last_message_sent = Instant::now();
    }

    pub fn record_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }

    pub fn record_internal_error(&mut self, context: &str, error: &str) {
        self.record_error();
        self.internal_errors.push(InternalErrorRec {
            _timestamp: Instant::now(),
            _context: truncate_string(context),
            _error: truncate_string(error),
        });
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnect_count = self.reconnect_count.saturating_add(1);
    }

    /// Record a heartbeat round trip; returns the tier transition when the rolling average
    /// crosses a band.
    pub fn record_rtt(&mut self, latency: Duration) -> Option<QualityChange> {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        let _ = self.latency_histogram.record(micros.max(1));
        self.samples.push(HealthSample {
            timestamp: Instant::now(),
            latency,
        });

        let avg_latency = self.average_latency()?;
        let tier = NetworkQuality::from_latency(avg_latency);
        if self.quality == Some(tier) {
            return None;
        }
        let from = self.quality.replace(tier);
        Some(QualityChange {
            from,
            to: tier,
            avg_latency,
        })
    }

    /// Mean latency over the sample window.
    pub fn average_latency(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().map(|s| s.latency).sum();
        Some(total / self.samples.len() as u32)
    }

    pub fn quality(&self) -> Option<NetworkQuality> {
        self.quality
    }

    pub fn samples(&self) -> usize {
        self.samples.len()
    }

    pub fn get_stats(&self) -> WsConnectionStats {
        let latency_samples = self.latency_histogram.len();
        let (p50, p99) = if latency_samples == 0 {
            (0, 0)
        } else {
            (
                self.latency_histogram.value_at_percentile(50.0),
                self.latency_histogram.value_at_percentile(99.0),
            )
        };

        WsConnectionStats {
            uptime: self.connection_started.elapsed(),
            messages: self.message_count,
            errors: self.error_count,
            reconnects: self.reconnect_count,
            last_message_age: self.last_message_received.elapsed(),
            last_sent_age: self.last_message_sent.elapsed(),
            recent_internal_errors: self.internal_errors.len(),
            p50_latency_us: p50,
            p99_latency_us: p99,
            latency_samples,
            avg_latency: self.average_latency(),
            quality: self.quality,
        }
    }
}
