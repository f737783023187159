//! Kameo-based resilient websocket link to a message broker.
//!
//! A [`BrokerLinkActor`] owns one logical connection: reconnect with backoff, endpoint
//! failover, a circuit breaker, heartbeats, acknowledged delivery with retries, batching and
//! compression, keyed rate limiting, and routing of inbound frames.

pub mod core;
pub mod testing;
pub mod tls;
pub mod transport;
pub mod ws;

pub use crate::core::{
    ConnectionState, DeliveryFailure, DeliveryFailureReason, LinkCapabilities, LinkConfig,
    LinkError, LinkEvent, LinkResult, LinkStatus, MessageId, NetworkQuality, OutboundMessage,
    Priority, WireFrame,
};
pub use ws::{
    BrokerLinkActor, BrokerLinkArgs, Connect, GetConnectionStats, GetStatus, LinkHandler,
    ProtocolRouter, Reset, Stop, Submit,
};
