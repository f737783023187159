//! Reliability envelope and the JSON wire frames exchanged with the broker.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use sonic_rs::Value;

use super::types::now_epoch_ms;

pub const HEARTBEAT: &str = "heartbeat";
pub const HEARTBEAT_RESPONSE: &str = "heartbeat_response";
pub const MESSAGE_ACK: &str = "message_ack";
pub const BATCH: &str = "batch";
pub const REGISTER: &str = "register";

static NEXT_MESSAGE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identifier shared by every transmission of one envelope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `msg-<epoch ms>-<process sequence>-<random suffix>`; unique within and across processes.
    pub fn generate() -> Self {
        let seq = NEXT_MESSAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::thread_rng().r#gen();
        Self(format!("msg-{}-{seq}-{suffix:08x}", now_epoch_ms()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Bypasses batching.
    Critical,
    #[default]
    Normal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

/// Caller-facing description of something to send.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    pub kind: String,
    pub payload: Value,
    pub message_id: Option<MessageId>,
    pub priority: Priority,
    pub requires_ack: bool,
    pub sender: Option<String>,
    pub ttl: Option<Duration>,
}

impl OutboundMessage {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            message_id: None,
            priority: Priority::Normal,
            requires_ack: false,
            sender: None,
            ttl: None,
        }
    }

    /// Track the message until the broker acknowledges it.
    pub fn reliable(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    pub fn critical(mut self) -> Self {
        self.priority = Priority::Critical;
        self
    }

    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Reliability-tracked outbound unit.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub message_id: MessageId,
    pub kind: String,
    pub payload: Value,
    pub created_at: Instant,
    pub timestamp: u64,
    pub attempt: u32,
    pub max_attempts: u32,
    pub ttl: Option<Duration>,
    pub priority: Priority,
    pub requires_ack: bool,
    pub sender: Option<String>,
}

impl Envelope {
    pub fn from_message(message: OutboundMessage, max_attempts: u32) -> Self {
        Self {
            message_id: message.message_id.unwrap_or_else(MessageId::generate),
            kind: message.kind,
            payload: message.payload,
            created_at: Instant::now(),
            timestamp: now_epoch_ms(),
            attempt: 0,
            max_attempts: max_attempts.max(1),
            ttl: message.ttl,
            priority: message.priority,
            requires_ack: message.requires_ack,
            sender: message.sender,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.created_at) >= ttl)
    }

    pub fn to_wire(&self) -> WireFrame {
        WireFrame {
            kind: self.kind.clone(),
            message_id: Some(self.message_id.clone()),
            timestamp: self.timestamp,
            payload: self.payload.clone(),
            priority: Some(self.priority),
            requires_ack: self.requires_ack,
            status: None,
            messages: None,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// JSON frame as it appears on the wire, for every frame type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub requires_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AckStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<WireFrame>>,
}

impl WireFrame {
    fn control(kind: &str, timestamp: u64) -> Self {
        Self {
            kind: kind.to_string(),
            message_id: None,
            timestamp,
            payload: Value::default(),
            priority: None,
            requires_ack: false,
            status: None,
            messages: None,
        }
    }

    pub fn heartbeat(timestamp: u64) -> Self {
        Self::control(HEARTBEAT, timestamp)
    }

    pub fn heartbeat_response(timestamp: u64) -> Self {
        Self::control(HEARTBEAT_RESPONSE, timestamp)
    }

    pub fn ack(message_id: MessageId, status: AckStatus) -> Self {
        Self {
            message_id: Some(message_id),
            status: Some(status),
            ..Self::control(MESSAGE_ACK, now_epoch_ms())
        }
    }

    pub fn batch(messages: Vec<WireFrame>) -> Self {
        Self {
            messages: Some(messages),
            ..Self::control(BATCH, now_epoch_ms())
        }
    }

    pub fn register(payload: Value) -> Self {
        Self {
            payload,
            ..Self::control(REGISTER, now_epoch_ms())
        }
    }
}
