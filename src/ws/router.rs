//! Inbound decoding and classification, plus per-type application routes.

use std::collections::HashMap;

use crate::core::{
    AckStatus, BATCH, HEARTBEAT, HEARTBEAT_RESPONSE, LinkError, LinkResult, MESSAGE_ACK,
    MessageId, WireFrame, WsFrame, decompress_frame,
};

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Broker-initiated heartbeat; answer with `heartbeat_response`.
    HeartbeatRequest { timestamp: u64 },
    HeartbeatResponse { timestamp: u64 },
    Ack {
        message_id: MessageId,
        status: AckStatus,
    },
    Registered,
    Application(WireFrame),
}

type Route = Box<dyn FnMut(WireFrame) + Send>;

/// Decodes and classifies inbound frames and dispatches application frames by `type`.
pub struct ProtocolRouter {
    registration_ack: String,
    routes: HashMap<String, Route>,
}

impl ProtocolRouter {
    pub fn new(registration_ack: impl Into<String>) -> Self {
        Self {
            registration_ack: registration_ack.into(),
            routes: HashMap::new(),
        }
    }

    /// Deliver application frames of type `kind` to `route` instead of the link handler.
    pub fn route<F>(&mut self, kind: impl Into<String>, route: F)
    where
        F: FnMut(WireFrame) + Send + 'static,
    {
        self.routes.insert(kind.into(), Box::new(route));
    }

    /// Decode a data frame. Control frames yield `Ok(None)`; malformed payloads are a
    /// validation error.
    pub fn decode(frame: &WsFrame) -> LinkResult<Option<WireFrame>> {
        let parsed = match frame {
            WsFrame::Text(bytes) => sonic_rs::from_slice::<WireFrame>(bytes),
            WsFrame::Binary(bytes) => {
                let inflated = decompress_frame(bytes)?;
                sonic_rs::from_slice::<WireFrame>(&inflated)
            }
            WsFrame::Ping(_) | WsFrame::Pong(_) | WsFrame::Close(_) => return Ok(None),
        };
        parsed
            .map(Some)
            .map_err(|e| LinkError::Validation(e.to_string()))
    }

    /// Classify a decoded frame, unpacking batches recursively in order.
    pub fn classify(&self, frame: WireFrame) -> LinkResult<Vec<Inbound>> {
        let mut out = Vec::new();
        self.classify_into(frame, &mut out)?;
        Ok(out)
    }

    fn classify_into(&self, frame: WireFrame, out: &mut Vec<Inbound>) -> LinkResult<()> {
        match frame.kind.as_str() {
            HEARTBEAT => out.push(Inbound::HeartbeatRequest {
                timestamp: frame.timestamp,
            }),
            HEARTBEAT_RESPONSE => out.push(Inbound::HeartbeatResponse {
                timestamp: frame.timestamp,
            }),
            MESSAGE_ACK => {
                let message_id = frame
                    .message_id
                    .ok_or_else(|| LinkError::Validation("ack without messageId".to_string()))?;
                out.push(Inbound::Ack {
                    message_id,
                    status: frame.status.unwrap_or(AckStatus::Ok),
                });
            }
            BATCH => {
                for inner in frame.messages.unwrap_or_default() {
                    self.classify_into(inner, out)?;
                }
            }
            kind if kind == self.registration_ack => out.push(Inbound::Registered),
            _ => out.push(Inbound::Application(frame)),
        }
        Ok(())
    }

    /// Hand an application frame to its route; returns it back when none is registered.
    pub fn dispatch(&mut self, frame: WireFrame) -> Option<WireFrame> {
        match self.routes.get_mut(frame.kind.as_str()) {
            Some(route) => {
                route(frame);
                None
            }
            None => Some(frame),
        }
    }
}
