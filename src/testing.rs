//! Reusable test utilities for exercising the broker link without a real socket.
//!
//! [`MockTransport::pair`] yields the transport handed to the link plus a [`MockBroker`]
//! that accepts each connection the link opens, can script connect failures, and lets
//! tests push inbound frames or drop the socket per connection.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Sink;
use kameo::prelude::ActorRef;
use tokio::sync::mpsc;

use crate::core::{
    BATCH, ConnectionState, DeliveryFailure, LinkCapabilities, LinkConfig, LinkError, LinkEvent,
    LinkStatus, ReconnectStrategy, WebSocketBufferConfig, WireFrame, WsFrame, WsTlsConfig,
    encode_wire,
};
use crate::transport::{WsTransport, WsTransportConnectFuture};
use crate::ws::{BrokerLinkActor, GetStatus, LinkHandler, ProtocolRouter};

#[derive(Debug, Default)]
struct Script {
    attempts: usize,
    fail_next: usize,
    fail_all: bool,
    stall: bool,
    urls: Vec<String>,
}

/// In-memory transport; every successful connect hands a [`MockConnection`] to the broker.
#[derive(Clone)]
pub struct MockTransport {
    script: Arc<Mutex<Script>>,
    accepted_tx: mpsc::UnboundedSender<MockConnection>,
}

impl MockTransport {
    /// Build a transport + broker control pair.
    pub fn pair() -> (Self, MockBroker) {
        let script = Arc::new(Mutex::new(Script::default()));
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Arc::clone(&script),
                accepted_tx,
            },
            MockBroker {
                script,
                accepted_rx,
            },
        )
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        url: String,
        _buffers: WebSocketBufferConfig,
        _tls: WsTlsConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let script = Arc::clone(&self.script);
        let accepted_tx = self.accepted_tx.clone();
        Box::pin(async move {
            let (fail, stall) = {
                let mut script = script.lock().unwrap_or_else(PoisonError::into_inner);
                script.attempts += 1;
                script.urls.push(url.clone());
                let fail = script.fail_all || script.fail_next > 0;
                script.fail_next = script.fail_next.saturating_sub(1);
                (fail, script.stall)
            };
            if stall {
                std::future::pending::<()>().await;
            }
            if fail {
                return Err(LinkError::Transport {
                    context: "mock_connect",
                    error: "connection refused".to_string(),
                });
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            accepted_tx
                .send(MockConnection {
                    url,
                    outbound_rx,
                    inbound_tx: Some(inbound_tx),
                })
                .map_err(|_| LinkError::Transport {
                    context: "mock_connect",
                    error: "mock broker dropped".to_string(),
                })?;
            Ok((MockReader { rx: inbound_rx }, MockWriter { tx: outbound_tx }))
        })
    }
}

/// Broker-side handle paired with [`MockTransport`].
pub struct MockBroker {
    script: Arc<Mutex<Script>>,
    accepted_rx: mpsc::UnboundedReceiver<MockConnection>,
}

impl MockBroker {
    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        self.script().fail_next = n;
    }

    /// Refuse every connection attempt until switched off.
    pub fn fail_all(&self, fail: bool) {
        self.script().fail_all = fail;
    }

    /// Never complete connection attempts (exercises the connect timeout).
    pub fn stall_connects(&self, stall: bool) {
        self.script().stall = stall;
    }

    pub fn connect_attempts(&self) -> usize {
        self.script().attempts
    }

    /// URLs of every attempt, in order.
    pub fn attempted_urls(&self) -> Vec<String> {
        self.script().urls.clone()
    }

    /// Wait for the next successful connection.
    pub async fn accept(&mut self, timeout: Duration) -> Option<MockConnection> {
        tokio::time::timeout(timeout, self.accepted_rx.recv())
            .await
            .unwrap_or_default()
    }
}

/// One accepted socket as seen from the broker.
pub struct MockConnection {
    url: String,
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<Result<WsFrame, LinkError>>>,
}

impl MockConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Next raw frame written by the link.
    pub async fn recv_frame(&mut self, timeout: Duration) -> Option<WsFrame> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Next data frame written by the link, decoded (and inflated when compressed).
    pub async fn recv_wire(&mut self, timeout: Duration) -> Option<WireFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = self.recv_frame(remaining).await?;
            if let Ok(Some(wire)) = ProtocolRouter::decode(&frame) {
                return Some(wire);
            }
        }
    }

    /// Next data frame with batches flattened into their members.
    pub async fn recv_unpacked(&mut self, timeout: Duration) -> Vec<WireFrame> {
        match self.recv_wire(timeout).await {
            Some(frame) if frame.kind == BATCH => frame.messages.unwrap_or_default(),
            Some(frame) => vec![frame],
            None => Vec::new(),
        }
    }

    /// Skip frames until one of type `kind` arrives.
    pub async fn recv_kind(&mut self, kind: &str, timeout: Duration) -> Option<WireFrame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = self.recv_wire(remaining).await?;
            if frame.kind == kind {
                return Some(frame);
            }
        }
    }

    pub fn send_frame(&self, frame: WsFrame) -> Result<(), LinkError> {
        let tx = self
            .inbound_tx
            .as_ref()
            .ok_or_else(|| LinkError::InvalidState("mock socket already dropped".to_string()))?;
        tx.send(Ok(frame))
            .map_err(|_| LinkError::InvalidState("link reader is gone".to_string()))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), LinkError> {
        self.send_frame(WsFrame::text(text))
    }

    pub fn send_wire(&self, frame: &WireFrame) -> Result<(), LinkError> {
        self.send_frame(WsFrame::text(encode_wire(frame)?))
    }

    /// Surface a read error on the link's reader.
    pub fn fail_read(&self, error: &str) -> Result<(), LinkError> {
        let tx = self
            .inbound_tx
            .as_ref()
            .ok_or_else(|| LinkError::InvalidState("mock socket already dropped".to_string()))?;
        tx.send(Err(LinkError::Transport {
            context: "read",
            error: error.to_string(),
        }))
        .map_err(|_| LinkError::InvalidState("link reader is gone".to_string()))
    }

    /// Simulate the broker dropping the socket.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<Result<WsFrame, LinkError>>,
}

impl futures_util::Stream for MockReader {
    type Item = Result<WsFrame, LinkError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    tx: mpsc::UnboundedSender<WsFrame>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = LinkError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        self.get_mut()
            .tx
            .send(item)
            .map_err(|_| LinkError::Transport {
                context: "mock_transport_write",
                error: "mock outbound channel closed".to_string(),
            })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// Reconnect strategy that never retries.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoReconnect;

impl ReconnectStrategy for NoReconnect {
    fn next_delay(&mut self) -> Duration {
        Duration::from_secs(24 * 60 * 60)
    }

    fn reset(&mut self) {}

    fn should_retry(&self) -> bool {
        false
    }

    fn attempts(&self) -> u32 {
        0
    }
}

/// Everything a [`RecordingHandler`] observed, in order.
#[derive(Debug, Clone)]
pub enum Recorded {
    Message(WireFrame),
    Failure(DeliveryFailure),
    Event(LinkEvent),
}

/// Handler that forwards every callback to a channel.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Recorded>,
}

impl RecordingHandler {
    pub fn new() -> (Self, Recordings) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, Recordings { rx })
    }
}

impl LinkHandler for RecordingHandler {
    fn on_message(&mut self, frame: WireFrame) {
        let _ = self.tx.send(Recorded::Message(frame));
    }

    fn on_delivery_failure(&mut self, failure: DeliveryFailure) {
        let _ = self.tx.send(Recorded::Failure(failure));
    }

    fn on_event(&mut self, event: LinkEvent) {
        let _ = self.tx.send(Recorded::Event(event));
    }
}

pub struct Recordings {
    rx: mpsc::UnboundedReceiver<Recorded>,
}

impl Recordings {
    /// Skip records until `pick` returns `Some`.
    pub async fn wait_for<T, F>(&mut self, timeout: Duration, mut pick: F) -> Option<T>
    where
        F: FnMut(Recorded) -> Option<T>,
    {
        tokio::time::timeout(timeout, async {
            while let Some(record) = self.rx.recv().await {
                if let Some(found) = pick(record) {
                    return Some(found);
                }
            }
            None
        })
        .await
        .unwrap_or_default()
    }

    /// Everything recorded so far without waiting.
    pub fn drain(&mut self) -> Vec<Recorded> {
        let mut out = Vec::new();
        while let Ok(record) = self.rx.try_recv() {
            out.push(record);
        }
        out
    }

    pub fn failures(&mut self) -> Vec<DeliveryFailure> {
        self.drain()
            .into_iter()
            .filter_map(|record| match record {
                Recorded::Failure(failure) => Some(failure),
                _ => None,
            })
            .collect()
    }
}

/// Config tuned for tests: short delays, no heartbeat traffic, no registration handshake.
pub fn test_config() -> LinkConfig {
    let mut config = LinkConfig::new("ws://primary.test/ws", "test-client");
    config.capabilities = LinkCapabilities {
        registration: false,
        ..LinkCapabilities::protocol_agent()
    };
    config.reconnect.base_delay_ms = 10;
    config.reconnect.max_delay_ms = 40;
    config.reconnect.max_attempts = 5;
    config.reconnect.connect_timeout_ms = 500;
    config.heartbeat.interval_ms = 60_000;
    config.heartbeat.timeout_ms = 60_000;
    config.circuit_breaker.failure_threshold = 100;
    config.circuit_breaker.cooldown_ms = 50;
    config.batching.max_batch_delay_ms = 20;
    config.retry.base_delay_ms = 50;
    config.retry.max_delay_ms = 200;
    config
}

/// Poll the link until it reports `state`.
pub async fn wait_for_state<H, T, R>(
    link: &ActorRef<BrokerLinkActor<H, T, R>>,
    state: ConnectionState,
    timeout: Duration,
) -> Option<LinkStatus>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(status) = link.ask(GetStatus).await {
            if status.state == state {
                return Some(status);
            }
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
