//! Link configuration. Every field has a default; durations are carried as milliseconds so the
//! whole tree deserializes from plain JSON.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use super::types::{LinkError, LinkResult, WebSocketBufferConfig, WsTlsConfig};

/// Which link behaviors are switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkCapabilities {
    pub heartbeat: bool,
    pub reliability: bool,
    pub batching: bool,
    pub rate_limit: bool,
    pub registration: bool,
}

impl LinkCapabilities {
    /// Liveness and quality tracking only.
    pub const fn stability_monitor() -> Self {
        Self {
            heartbeat: true,
            reliability: false,
            batching: false,
            rate_limit: false,
            registration: false,
        }
    }

    /// Full protocol agent: acks, batching, limits and the registration handshake.
    pub const fn protocol_agent() -> Self {
        Self {
            heartbeat: true,
            reliability: true,
            batching: true,
            rate_limit: true,
            registration: true,
        }
    }
}

impl Default for LinkCapabilities {
    fn default() -> Self {
        Self::protocol_agent()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 10,
            connect_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Round trips kept for the rolling quality average.
    pub sample_window: usize,
    /// Probes allowed in flight before new ones are skipped.
    pub max_outstanding: usize,
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 10_000,
            sample_window: 50,
            max_outstanding: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub fallback_urls: Vec<String>,
    pub threshold: u32,
    pub cooldown_ms: u64,
}

impl FailoverConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            fallback_urls: Vec::new(),
            threshold: 3,
            cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_batch_delay_ms: u64,
    pub compression_threshold_bytes: usize,
}

impl BatchConfig {
    pub fn max_batch_delay(&self) -> Duration {
        Duration::from_millis(self.max_batch_delay_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_batch_delay_ms: 100,
            compression_threshold_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms.max(1))
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 60_000,
        }
    }
}

/// Per-envelope resend policy for unacknowledged messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    pub capacity: usize,
    pub stale_after_ms: u64,
}

impl OfflineConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            stale_after_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub ttl_ms: u64,
    pub capacity: usize,
}

impl DedupConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 300_000,
            capacity: 10_000,
        }
    }
}

/// Registration handshake sent right after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub role: String,
    pub capabilities: Vec<String>,
    /// Frame type the broker answers with.
    pub ack_type: String,
    /// Hold outbound messages in the offline queue until the broker acknowledges.
    pub require_before_send: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            role: "agent".to_string(),
            capabilities: Vec::new(),
            ack_type: "registered".to_string(),
            require_before_send: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub url: String,
    pub client_id: String,
    pub token: Option<String>,
    pub capabilities: LinkCapabilities,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub failover: FailoverConfig,
    pub batching: BatchConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
    pub offline: OfflineConfig,
    pub dedup: DedupConfig,
    pub registration: RegistrationConfig,
    #[serde(skip)]
    pub ws_buffers: WebSocketBufferConfig,
    #[serde(skip)]
    pub tls: WsTlsConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            client_id: "client".to_string(),
            token: None,
            capabilities: LinkCapabilities::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            failover: FailoverConfig::default(),
            batching: BatchConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            offline: OfflineConfig::default(),
            dedup: DedupConfig::default(),
            registration: RegistrationConfig::default(),
            ws_buffers: WebSocketBufferConfig::default(),
            tls: WsTlsConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn new(url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn with_capabilities(mut self, capabilities: LinkCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_fallbacks<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failover.fallback_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> LinkResult<Self> {
        let config: Self =
            sonic_rs::from_str(json).map_err(|e| LinkError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LinkResult<()> {
        for endpoint in std::iter::once(&self.url).chain(&self.failover.fallback_urls) {
            let parsed = Url::parse(endpoint)
                .map_err(|e| LinkError::Config(format!("invalid endpoint {endpoint:?}: {e}")))?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(LinkError::Config(format!(
                    "endpoint {endpoint:?} must use ws:// or wss://"
                )));
            }
        }
        if self.client_id.is_empty() {
            return Err(LinkError::Config("client_id must not be empty".to_string()));
        }
        if !self.reconnect.multiplier.is_finite() || !self.retry.multiplier.is_finite() {
            return Err(LinkError::Config("multipliers must be finite".to_string()));
        }
        if self.heartbeat.sample_window == 0 {
            return Err(LinkError::Config("sample_window must be positive".to_string()));
        }
        if self.heartbeat.max_outstanding == 0 {
            return Err(LinkError::Config("max_outstanding must be positive".to_string()));
        }
        if self.batching.max_batch_size == 0 {
            return Err(LinkError::Config("max_batch_size must be positive".to_string()));
        }
        Ok(())
    }

    /// Endpoint URL with the `token` and `clientId` query parameters appended.
    pub fn connection_url(&self, endpoint: &str) -> LinkResult<String> {
        let mut url = Url::parse(endpoint)
            .map_err(|e| LinkError::Config(format!("invalid endpoint {endpoint:?}: {e}")))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = self.token.as_deref() {
                query.append_pair("token", token);
            }
            query.append_pair("clientId", &self.client_id);
        }
        Ok(url.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_documented_defaults() {
        let config: LinkConfig = sonic_rs::from_str("{}").unwrap();
        assert_eq!(config.reconnect.base_delay(), Duration::from_secs(1));
        assert_eq!(config.reconnect.max_delay(), Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.heartbeat.interval(), Duration::from_secs(30));
        assert_eq!(config.heartbeat.timeout(), Duration::from_secs(10));
        assert_eq!(config.heartbeat.sample_window, 50);
        assert_eq!(config.heartbeat.max_outstanding, 4);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.failover.threshold, 3);
        assert_eq!(config.batching.max_batch_size, 10);
        assert_eq!(config.batching.max_batch_delay(), Duration::from_millis(100));
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.offline.capacity, 100);
        assert_eq!(config.offline.stale_after(), Duration::from_secs(300));
        assert_eq!(config.dedup.capacity, 10_000);
        assert_eq!(config.capabilities, LinkCapabilities::protocol_agent());
    }

    #[test]
    fn from_json_overrides_and_validates() {
        let config = LinkConfig::from_json(
            r#"{
                "url": "wss://broker.example/ws",
                "client_id": "agent-7",
                "failover": {"fallback_urls": ["wss://backup.example/ws"], "threshold": 2},
                "capabilities": {"heartbeat": true, "reliability": false, "batching": false,
                                 "rate_limit": false, "registration": false}
            }"#,
        )
        .unwrap();
        assert_eq!(config.client_id, "agent-7");
        assert_eq!(config.failover.threshold, 2);
        assert_eq!(config.failover.cooldown(), Duration::from_secs(30));
        assert_eq!(config.capabilities, LinkCapabilities::stability_monitor());
    }

    #[test]
    fn invalid_endpoints_are_rejected() {
        assert!(matches!(
            LinkConfig::from_json(r#"{"url": "http://broker"}"#),
            Err(LinkError::Config(_))
        ));
        assert!(LinkConfig::new("not a url", "c").validate().is_err());
        let mut no_probes = LinkConfig::new("ws://a", "c");
        no_probes.heartbeat.max_outstanding = 0;
        assert!(matches!(no_probes.validate(), Err(LinkError::Config(_))));
        assert!(
            LinkConfig::new("ws://a", "c")
                .with_fallbacks(["ws://b"])
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn connection_url_carries_token_and_client_id() {
        let config = LinkConfig::new("wss://broker.example/ws?v=2", "agent 1").with_token("s3cret");
        let url = config.connection_url("wss://broker.example/ws?v=2").unwrap();
        assert_eq!(url, "wss://broker.example/ws?v=2&token=s3cret&clientId=agent+1");
    }
}
