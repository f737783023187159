use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use super::envelope::MessageId;

/// Convenience result alias for link operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Canonical error surface shared across the link.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error ({context}): {error}")]
    Transport {
        context: &'static str,
        error: String,
    },

    #[error("Timeout: {context}")]
    Timeout { context: String },

    #[error("Invalid frame: {0}")]
    Validation(String),

    #[error("Rate limit exceeded for {key} (retry after {retry_after:?})")]
    RateLimitExceeded { key: String, retry_after: Duration },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Link stopped")]
    Stopped,

    #[error("Link failed: reconnect attempts exhausted")]
    Failed,
}

impl LinkError {
    /// Transport and timeout errors are recovered by reconnecting; everything else is surfaced.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectionFailed(_) | LinkError::Transport { .. } | LinkError::Timeout { .. }
        )
    }
}

/// Lifecycle of the logical broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal until an explicit reset.
    Failed,
}

impl ConnectionState {
    /// A connection attempt is in flight or established.
    #[inline]
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// Rolling network quality tier derived from heartbeat round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl NetworkQuality {
    pub fn from_latency(avg: Duration) -> Self {
        match avg.as_millis() {
            0..50 => NetworkQuality::Excellent,
            50..150 => NetworkQuality::Good,
            150..300 => NetworkQuality::Fair,
            _ => NetworkQuality::Poor,
        }
    }
}

/// Canonical disconnect causes enumerated by the link.
#[derive(Debug, Clone)]
pub enum DisconnectCause {
    HeartbeatTimeout,
    RemoteClosed,
    ReadFailure { error: String },
    WriteFailure { error: String },
    HandshakeFailed { message: String },
    ConnectTimeout,
}

impl DisconnectCause {
    pub fn to_error(&self) -> LinkError {
        match self {
            DisconnectCause::HeartbeatTimeout => LinkError::Timeout {
                context: "heartbeat".to_string(),
            },
            DisconnectCause::ConnectTimeout => LinkError::Timeout {
                context: "connect".to_string(),
            },
            DisconnectCause::RemoteClosed => LinkError::Transport {
                context: "read",
                error: "remote closed".to_string(),
            },
            DisconnectCause::ReadFailure { error } => LinkError::Transport {
                context: "read",
                error: error.clone(),
            },
            DisconnectCause::WriteFailure { error } => LinkError::Transport {
                context: "write",
                error: error.clone(),
            },
            DisconnectCause::HandshakeFailed { message } => {
                LinkError::ConnectionFailed(message.clone())
            }
        }
    }
}

/// Why an outbound envelope was given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailureReason {
    RetriesExhausted,
    Rejected,
    Expired,
    QueueOverflow,
}

/// Terminal delivery outcome for one envelope, surfaced to the submitting side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub message_id: MessageId,
    pub kind: String,
    pub attempts: u32,
    pub reason: DeliveryFailureReason,
}

/// Point-in-time view of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub is_open: bool,
    pub consecutive_failures: u32,
    pub retry_in: Option<Duration>,
}

/// Status surface answered by the link at any time.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub state: ConnectionState,
    pub registered: bool,
    pub endpoint: String,
    pub epoch: u64,
    pub reconnect_attempts: u32,
    pub failovers: u64,
    pub circuit: CircuitSnapshot,
    pub quality: Option<NetworkQuality>,
    pub pending: usize,
    pub offline_queued: usize,
    pub batched: usize,
}

/// Observable link events (state transitions, stability and delivery signals).
#[derive(Debug, Clone)]
pub enum LinkEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Registered,
    /// Emitted for every failed connection attempt or dropped connection.
    Stability {
        cause: String,
        consecutive_failures: u32,
        next_delay: Option<Duration>,
    },
    Failover {
        from: String,
        to: String,
        failovers: u64,
    },
    QualityChanged {
        from: Option<NetworkQuality>,
        to: NetworkQuality,
        avg_latency: Duration,
    },
    Delivered {
        message_id: MessageId,
        attempts: u32,
    },
    StaleDropped {
        message_id: MessageId,
    },
}

/// Basic connection statistics snapshot.
#[derive(Clone, Debug)]
pub struct WsConnectionStats {
    pub uptime: Duration,
    pub messages: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub last_message_age: Duration,
    pub last_sent_age: Duration,
    pub recent_internal_errors: usize,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
    pub latency_samples: u64,
    pub avg_latency: Option<Duration>,
    pub quality: Option<NetworkQuality>,
}

/// Transport-independent buffer sizing parameters used for websocket configuration.
#[derive(Clone, Copy, Debug)]
pub struct WebSocketBufferConfig {
    pub write_buffer_bytes: usize,
    pub max_write_buffer_bytes: usize,
    pub max_message_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for WebSocketBufferConfig {
    fn default() -> Self {
        Self {
            write_buffer_bytes: 128 << 10,
            max_write_buffer_bytes: 256 << 10,
            max_message_bytes: 16 * 1024 * 1024,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

/// TLS configuration for websocket connections.
///
/// Safe-by-default: certificate validation is enabled unless explicitly disabled for development /
/// controlled environments.
#[derive(Clone, Copy, Debug)]
pub struct WsTlsConfig {
    pub validate_certs: bool,
}

impl Default for WsTlsConfig {
    fn default() -> Self {
        Self {
            validate_certs: true,
        }
    }
}

/// Abstract reconnect strategy trait.
pub trait ReconnectStrategy: Send + Sync + 'static {
    /// Delay before the next attempt, advancing the attempt counter.
    fn next_delay(&mut self) -> Duration;
    fn reset(&mut self);
    fn should_retry(&self) -> bool;
    /// Attempts consumed since the last reset.
    fn attempts(&self) -> u32;
}

/// Best-effort current time as Unix epoch milliseconds.
#[inline]
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
        .unwrap_or(0)
}
