//! Broker link actor.
//!
//! The websocket read loop runs outside kameo; the actor owns connection state, policies and
//! the reliability bookkeeping, and receives frames and timer ticks as messages. Every
//! connection attempt bumps the epoch; messages from older epochs are ignored.

use std::time::Duration;

use futures_util::StreamExt;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::router::{Inbound, ProtocolRouter};
use super::types::LinkHandler;
use super::writer::{WriterWrite, WsWriterActor};
use crate::core::{
    AckStatus, BatchBuffer, BatchPush, BatchTuning, ConnectionState, DeliveryFailure,
    DeliveryFailureReason, DisconnectCause, EndpointSelector, Envelope, ExponentialBackoffReconnect,
    FailoverOutcome, HeartbeatResult, HeartbeatTracker, KeyedRateLimiter, LinkCircuitBreaker,
    LinkConfig, LinkError, LinkEvent, LinkResult, LinkStatus, MessageId, OfflineQueue,
    OutboundMessage, PendingSet, Priority, ReconnectStrategy, ScheduledTask, SeenIds, WireFrame,
    WsConnectionStats, WsFrame, WsHealthMonitor, backoff_delay, compress_frame, encode_batch,
    encode_wire,
};
use crate::transport::WsTransport;
use crate::transport::tungstenite::TungsteniteTransport;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Arguments passed when spawning a link.
pub struct BrokerLinkArgs<H, T = TungsteniteTransport, R = ExponentialBackoffReconnect>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    pub config: LinkConfig,
    pub transport: T,
    pub reconnect_strategy: R,
    pub handler: H,
    pub router: ProtocolRouter,
}

impl<H, T> BrokerLinkArgs<H, T, ExponentialBackoffReconnect>
where
    H: LinkHandler,
    T: WsTransport,
{
    /// Backoff, router and everything else derived from `config`.
    pub fn with_transport(config: LinkConfig, transport: T, handler: H) -> Self {
        let reconnect_strategy = ExponentialBackoffReconnect::new(
            config.reconnect.base_delay(),
            config.reconnect.max_delay(),
            config.reconnect.multiplier,
            config.reconnect.max_attempts,
        );
        let router = ProtocolRouter::new(config.registration.ack_type.clone());
        Self {
            config,
            transport,
            reconnect_strategy,
            handler,
            router,
        }
    }
}

impl<H> BrokerLinkArgs<H>
where
    H: LinkHandler,
{
    pub fn new(config: LinkConfig, handler: H) -> Self {
        Self::with_transport(config, TungsteniteTransport::default(), handler)
    }
}

impl<H, T, R> BrokerLinkArgs<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    /// Deliver application frames of type `kind` to `route` instead of the handler.
    pub fn route<F>(mut self, kind: impl Into<String>, route: F) -> Self
    where
        F: FnMut(WireFrame) + Send + 'static,
    {
        self.router.route(kind, route);
        self
    }
}

/// One resilient logical connection to a broker.
pub struct BrokerLinkActor<H, T = TungsteniteTransport, R = ExponentialBackoffReconnect>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    config: LinkConfig,
    transport: T,
    handler: H,
    router: ProtocolRouter,
    reconnect: R,
    breaker: LinkCircuitBreaker,
    selector: EndpointSelector,
    heartbeat: HeartbeatTracker,
    health: WsHealthMonitor,
    limiter: KeyedRateLimiter,
    pending: PendingSet,
    offline: OfflineQueue,
    seen: SeenIds,
    batch: BatchBuffer,
    tuning: BatchTuning,
    state: ConnectionState,
    registered: bool,
    /// Set by `Stop`; submissions are rejected until the next `Connect`.
    stopped: bool,
    epoch: u64,
    consecutive_failures: u32,
    actor_ref: ActorRef<Self>,
    writer_ref: Option<ActorRef<WsWriterActor<T::Writer>>>,
    reader_task: Option<JoinHandle<()>>,
    connect_task: Option<JoinHandle<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
    heartbeat_timeouts: Vec<(u64, ScheduledTask)>,
    reconnect_timer: Option<ScheduledTask>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<H, T, R> Actor for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Args = BrokerLinkArgs<H, T, R>;
    type Error = LinkError;

    fn name() -> &'static str {
        "BrokerLinkActor"
    }

    async fn on_start(args: Self::Args, ctx: ActorRef<Self>) -> LinkResult<Self> {
        let BrokerLinkArgs {
            config,
            transport,
            reconnect_strategy,
            handler,
            router,
        } = args;
        config.validate()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let selector = EndpointSelector::new(
            config.url.clone(),
            config.failover.fallback_urls.clone(),
            config.failover.threshold,
            config.failover.cooldown(),
        );
        let tuning = BatchTuning::for_quality(
            config.batching.max_batch_size,
            config.batching.max_batch_delay(),
            config.batching.compression_threshold_bytes,
            None,
        );

        Ok(Self {
            transport,
            handler,
            router,
            reconnect: reconnect_strategy,
            breaker: LinkCircuitBreaker::new(
                config.circuit_breaker.failure_threshold,
                config.circuit_breaker.cooldown(),
            ),
            selector,
            heartbeat: HeartbeatTracker::new(config.heartbeat.interval(), config.heartbeat.timeout())
                .with_max_pending(config.heartbeat.max_outstanding),
            health: WsHealthMonitor::new(config.heartbeat.sample_window),
            limiter: KeyedRateLimiter::new(
                config.rate_limit.max_requests,
                config.rate_limit.window(),
            ),
            pending: PendingSet::new(),
            offline: OfflineQueue::new(config.offline.capacity),
            seen: SeenIds::new(config.dedup.ttl(), config.dedup.capacity),
            batch: BatchBuffer::new(),
            tuning,
            state: ConnectionState::Disconnected,
            registered: false,
            stopped: false,
            epoch: 0,
            consecutive_failures: 0,
            actor_ref: ctx,
            writer_ref: None,
            reader_task: None,
            connect_task: None,
            heartbeat_task: None,
            heartbeat_timeouts: Vec::new(),
            reconnect_timer: None,
            shutdown_tx,
            shutdown_rx,
            config,
        })
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> LinkResult<()> {
        self.reconnect_timer = None;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.teardown_io().await;
        Ok(())
    }

    fn on_panic(
        &mut self,
        _actor_ref: WeakActorRef<Self>,
        err: kameo::prelude::PanicError,
    ) -> impl std::future::Future<
        Output = Result<std::ops::ControlFlow<kameo::prelude::ActorStopReason>, Self::Error>,
    > + Send {
        let label = self.connection_label().to_string();
        async move {
            tracing::error!(connection = %label, error = ?err, "BrokerLinkActor panicked");
            Ok(std::ops::ControlFlow::Break(
                kameo::prelude::ActorStopReason::Panicked(err),
            ))
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Registration<'a> {
    role: &'a str,
    capabilities: &'a [String],
    client_id: &'a str,
}

/// Open the link. Ignored while connecting, connected, or failed.
#[derive(Clone, Copy, Debug)]
pub struct Connect;

/// Clear reconnect and failover bookkeeping; leaves `Failed` for `Disconnected`.
#[derive(Clone, Copy, Debug)]
pub struct Reset;

/// Close the link for good: cancels timers and drops pending, batched and queued envelopes
/// without reporting them.
#[derive(Clone, Copy, Debug)]
pub struct Stop;

/// Submit an outbound message; replies with its id or a synchronous rejection.
#[derive(Clone, Debug)]
pub struct Submit(pub OutboundMessage);

#[derive(Clone, Copy, Debug)]
pub struct GetStatus;

#[derive(Clone, Copy, Debug)]
pub struct GetConnectionStats;

#[doc(hidden)]
pub struct ConnectionEstablished<T: WsTransport> {
    epoch: u64,
    reader: T::Reader,
    writer: T::Writer,
}

#[doc(hidden)]
pub struct ConnectionFailed {
    epoch: u64,
    cause: DisconnectCause,
}

#[doc(hidden)]
pub struct Disconnect {
    epoch: u64,
    cause: DisconnectCause,
}

#[doc(hidden)]
pub struct InboundFrame {
    epoch: u64,
    frame: WsFrame,
}

#[doc(hidden)]
pub struct ReconnectDue {
    epoch: u64,
}

#[doc(hidden)]
pub struct RetryDue {
    epoch: u64,
    message_id: MessageId,
}

#[doc(hidden)]
pub struct BatchDue {
    epoch: u64,
}

#[doc(hidden)]
pub struct HeartbeatDue {
    epoch: u64,
}

#[doc(hidden)]
pub struct HeartbeatTimeout {
    epoch: u64,
    key: u64,
}

impl<H, T, R> KameoMessage<Connect> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, _msg: Connect, _ctx: &mut Context<Self, Self::Reply>) {
        if self.state.is_active() {
            debug!(connection = %self.connection_label(), state = ?self.state, "connect ignored; already active");
            return;
        }
        if self.state == ConnectionState::Failed {
            warn!(connection = %self.connection_label(), "connect ignored; link failed, reset required");
            return;
        }
        self.stopped = false;
        self.reconnect_timer = None;
        self.start_connect_attempt();
    }
}

impl<H, T, R> KameoMessage<Reset> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, _msg: Reset, _ctx: &mut Context<Self, Self::Reply>) {
        self.reconnect.reset();
        self.breaker.record_success();
        self.selector.record_success();
        self.consecutive_failures = 0;
        if self.state == ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

impl<H, T, R> KameoMessage<Stop> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, _msg: Stop, _ctx: &mut Context<Self, Self::Reply>) {
        info!(connection = %self.connection_label(), "stopping broker link");
        // Invalidate every in-flight timer and IO message.
        self.epoch = self.epoch.wrapping_add(1);
        self.reconnect_timer = None;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        // The close frame must reach the sink before teardown flips the writer's shutdown flag.
        if let Some(writer) = self.writer_ref.as_ref() {
            let close = writer.ask(WriterWrite {
                frame: WsFrame::close(1000, "client stop"),
            });
            match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, close).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!(connection = %self.connection_label(), "writer gone; close frame not written"),
                Err(_) => warn!(connection = %self.connection_label(), "close frame write timed out"),
            }
        }
        self.teardown_io().await;
        self.pending.clear();
        self.batch.clear();
        self.offline.clear();
        self.registered = false;
        self.stopped = true;
        self.set_state(ConnectionState::Disconnected);
    }
}

impl<H, T, R> KameoMessage<Submit> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = LinkResult<MessageId>;

    async fn handle(&mut self, msg: Submit, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        self.submit(msg.0).await
    }
}

impl<H, T, R> KameoMessage<GetStatus> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = LinkResult<LinkStatus>;

    async fn handle(&mut self, _msg: GetStatus, _ctx: &mut Context<Self, Self::Reply>) -> Self::Reply {
        Ok(LinkStatus {
            state: self.state,
            registered: self.registered,
            endpoint: self.selector.active().url.clone(),
            epoch: self.epoch,
            reconnect_attempts: self.reconnect.attempts(),
            failovers: self.selector.failovers(),
            circuit: self.breaker.snapshot(),
            quality: self.health.quality(),
            pending: self.pending.len(),
            offline_queued: self.offline.len(),
            batched: self.batch.len(),
        })
    }
}

impl<H, T, R> KameoMessage<GetConnectionStats> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = LinkResult<WsConnectionStats>;

    async fn handle(
        &mut self,
        _msg: GetConnectionStats,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        Ok(self.health.get_stats())
    }
}

impl<H, T, R> KameoMessage<ConnectionEstablished<T>> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(
        &mut self,
        msg: ConnectionEstablished<T>,
        _ctx: &mut Context<Self, Self::Reply>,
    ) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            debug!(epoch = msg.epoch, current = self.epoch, "dropping stale connection");
            return;
        }
        self.connect_task = None;
        self.on_connection_established(msg.reader, msg.writer).await;
    }
}

impl<H, T, R> KameoMessage<ConnectionFailed> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, msg: ConnectionFailed, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connecting {
            return;
        }
        self.connect_task = None;
        self.breaker.record_failure();
        self.health
            .record_internal_error("connect", &msg.cause.to_error().to_string());
        self.schedule_reconnect("connection_failed", msg.cause);
    }
}

impl<H, T, R> KameoMessage<Disconnect> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, msg: Disconnect, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch {
            return;
        }
        self.handle_disconnect(msg.cause).await;
    }
}

impl<H, T, R> KameoMessage<InboundFrame> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, msg: InboundFrame, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connected {
            return;
        }
        self.process_inbound(msg.frame).await;
    }
}

impl<H, T, R> KameoMessage<ReconnectDue> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, msg: ReconnectDue, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Reconnecting {
            return;
        }
        self.reconnect_timer = None;
        self.start_connect_attempt();
    }
}

impl<H, T, R> KameoMessage<RetryDue> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, msg: RetryDue, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || !self.is_ready() {
            return;
        }
        self.retry_envelope(msg.message_id).await;
    }
}

impl<H, T, R> KameoMessage<BatchDue> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, msg: BatchDue, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch {
            return;
        }
        self.flush_batch().await;
    }
}

impl<H, T, R> KameoMessage<HeartbeatDue> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, msg: HeartbeatDue, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || self.state != ConnectionState::Connected {
            return;
        }
        self.emit_heartbeat().await;
    }
}

impl<H, T, R> KameoMessage<HeartbeatTimeout> for BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    type Reply = ();

    async fn handle(&mut self, msg: HeartbeatTimeout, _ctx: &mut Context<Self, Self::Reply>) {
        if msg.epoch != self.epoch || !self.heartbeat.is_outstanding(msg.key) {
            return;
        }
        warn!(
            connection = %self.connection_label(),
            probe = msg.key,
            timeout_ms = self.heartbeat.timeout().as_millis() as u64,
            "heartbeat response overdue"
        );
        self.handle_disconnect(DisconnectCause::HeartbeatTimeout).await;
    }
}

impl<H, T, R> BrokerLinkActor<H, T, R>
where
    H: LinkHandler,
    T: WsTransport,
    R: ReconnectStrategy,
{
    fn connection_label(&self) -> &str {
        &self.selector.active().url
    }

    fn set_state(&mut self, to: ConnectionState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        info!(connection = %self.connection_label(), ?from, ?to, "link state changed");
        self.handler.on_event(LinkEvent::StateChanged { from, to });
    }

    fn registration_gates_sends(&self) -> bool {
        self.config.capabilities.registration && self.config.registration.require_before_send
    }

    /// Connected with a live writer and, when required, acknowledged registration.
    fn is_ready(&self) -> bool {
        self.state == ConnectionState::Connected
            && self.writer_ref.is_some()
            && (self.registered || !self.registration_gates_sends())
    }

    fn fail_delivery(&mut self, envelope: &Envelope, reason: DeliveryFailureReason) {
        warn!(
            message_id = %envelope.message_id,
            kind = %envelope.kind,
            attempts = envelope.attempt,
            ?reason,
            "delivery failed"
        );
        self.handler.on_delivery_failure(DeliveryFailure {
            message_id: envelope.message_id.clone(),
            kind: envelope.kind.clone(),
            attempts: envelope.attempt,
            reason,
        });
    }

    fn start_connect_attempt(&mut self) {
        if !self.breaker.can_proceed() {
            let wait = self.breaker.time_until_retry().unwrap_or_default();
            info!(
                connection = %self.connection_label(),
                wait_ms = wait.as_millis() as u64,
                "circuit open; deferring connect"
            );
            self.set_state(ConnectionState::Reconnecting);
            self.arm_reconnect(wait);
            return;
        }

        self.epoch = self.epoch.wrapping_add(1);
        self.set_state(ConnectionState::Connecting);

        let epoch = self.epoch;
        let endpoint = self.selector.active().url.clone();
        let url = match self.config.connection_url(&endpoint) {
            Ok(url) => url,
            Err(err) => {
                let actor_ref = self.actor_ref.clone();
                self.connect_task = Some(tokio::spawn(async move {
                    let _ = actor_ref
                        .tell(ConnectionFailed {
                            epoch,
                            cause: DisconnectCause::HandshakeFailed {
                                message: err.to_string(),
                            },
                        })
                        .send()
                        .await;
                }));
                return;
            }
        };
        info!(connection = %endpoint, epoch, "connecting to broker");

        let actor_ref = self.actor_ref.clone();
        let transport = self.transport.clone();
        let buffers = self.config.ws_buffers;
        let tls = self.config.tls;
        let timeout = self.config.reconnect.connect_timeout();
        self.connect_task = Some(tokio::spawn(async move {
            match tokio::time::timeout(timeout, transport.connect(url, buffers, tls)).await {
                Ok(Ok((reader, writer))) => {
                    let _ = actor_ref
                        .tell(ConnectionEstablished::<T> {
                            epoch,
                            reader,
                            writer,
                        })
                        .send()
                        .await;
                }
                Ok(Err(err)) => {
                    let _ = actor_ref
                        .tell(ConnectionFailed {
                            epoch,
                            cause: DisconnectCause::HandshakeFailed {
                                message: err.to_string(),
                            },
                        })
                        .send()
                        .await;
                }
                Err(_) => {
                    let _ = actor_ref
                        .tell(ConnectionFailed {
                            epoch,
                            cause: DisconnectCause::ConnectTimeout,
                        })
                        .send()
                        .await;
                }
            }
        }));
    }

    fn arm_reconnect(&mut self, delay: Duration) {
        let actor_ref = self.actor_ref.clone();
        let epoch = self.epoch;
        self.reconnect_timer = Some(ScheduledTask::after(delay, async move {
            let _ = actor_ref.tell(ReconnectDue { epoch }).send().await;
        }));
    }

    fn record_failover(&mut self, outcome: FailoverOutcome) {
        warn!(
            from = %outcome.from,
            to = %outcome.to,
            failovers = outcome.failovers,
            "failing over to next endpoint"
        );
        self.reconnect.reset();
        self.handler.on_event(LinkEvent::Failover {
            from: outcome.from,
            to: outcome.to,
            failovers: outcome.failovers,
        });
    }

    /// Count a failed attempt or dropped connection and plan the next attempt.
    fn schedule_reconnect(&mut self, event: &str, cause: DisconnectCause) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if let Some(outcome) = self.selector.record_failure() {
            self.record_failover(outcome);
        }

        let delay = self.reconnect.next_delay();
        let delay = if self.reconnect.should_retry() {
            Some(delay)
        } else if let Some(outcome) = self.selector.force_failover() {
            self.record_failover(outcome);
            Some(self.reconnect.next_delay())
        } else {
            None
        };

        self.log_reconnect_plan(event, &cause, delay);
        self.handler.on_event(LinkEvent::Stability {
            cause: cause.to_error().to_string(),
            consecutive_failures: self.consecutive_failures,
            next_delay: delay,
        });

        match delay {
            Some(delay) => {
                self.health.increment_reconnect();
                self.set_state(ConnectionState::Reconnecting);
                self.arm_reconnect(delay);
            }
            None => self.set_state(ConnectionState::Failed),
        }
    }

    fn log_reconnect_plan(&self, event: &str, cause: &DisconnectCause, delay: Option<Duration>) {
        let stats = self.health.get_stats();
        let delay_ms = delay.map(|d| d.as_millis().min(u64::MAX as u128) as u64);
        let uptime_ms = stats.uptime.as_millis().min(u64::MAX as u128) as u64;
        let note = if delay.is_some() { "scheduled" } else { "exhausted" };
        warn!(
            connection = %self.connection_label(),
            event = %event,
            note,
            cause = ?cause,
            attempt = self.reconnect.attempts(),
            consecutive_failures = self.consecutive_failures,
            breaker_failures = self.breaker.consecutive_failures(),
            delay_ms,
            uptime_ms,
            messages = stats.messages,
            pending = self.pending.len(),
            offline = self.offline.len(),
            "broker reconnect plan"
        );
    }

    async fn on_connection_established(&mut self, reader: T::Reader, writer: T::Writer) {
        info!(connection = %self.connection_label(), epoch = self.epoch, "broker connection established");
        self.breaker.record_success();
        self.selector.record_success();
        self.reconnect.reset();
        self.consecutive_failures = 0;
        self.health.reset();
        self.heartbeat.reset();
        self.registered = false;

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let writer = WsWriterActor::spawn(WsWriterActor::new(
            writer,
            self.shutdown_rx.clone(),
            failures_tx,
        ));
        self.writer_ref = Some(writer);
        self.spawn_reader(reader, failures_rx);
        self.set_state(ConnectionState::Connected);

        if self.config.capabilities.heartbeat {
            self.start_heartbeat_loop();
        }

        if self.config.capabilities.registration {
            let registration = Registration {
                role: &self.config.registration.role,
                capabilities: &self.config.registration.capabilities,
                client_id: &self.config.client_id,
            };
            match sonic_rs::to_value(&registration) {
                Ok(payload) => self.send_wire(&WireFrame::register(payload)).await,
                Err(err) => warn!(error = %err, "failed to encode registration payload"),
            }
        }

        if self.is_ready() {
            self.on_ready().await;
        }
    }

    fn spawn_reader(
        &mut self,
        mut read: T::Reader,
        mut failures_rx: mpsc::UnboundedReceiver<LinkError>,
    ) {
        let epoch = self.epoch;
        let actor_ref = self.actor_ref.clone();
        let label = self.connection_label().to_string();
        let mut shutdown = self.shutdown_rx.clone();

        self.reader_task = Some(tokio::spawn(async move {
            let cause = loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow_and_update() {
                            return;
                        }
                    }
                    Some(err) = failures_rx.recv() => {
                        break DisconnectCause::WriteFailure { error: err.to_string() };
                    }
                    message = read.next() => match message {
                        Some(Ok(WsFrame::Close(frame))) => {
                            info!(connection = %label, close = ?frame, "received websocket close frame");
                            break DisconnectCause::RemoteClosed;
                        }
                        // Protocol ping/pong is answered by the transport.
                        Some(Ok(WsFrame::Ping(_) | WsFrame::Pong(_))) => {}
                        Some(Ok(frame)) => {
                            if actor_ref.tell(InboundFrame { epoch, frame }).send().await.is_err() {
                                return;
                            }
                        }
                        Some(Err(err)) => break DisconnectCause::ReadFailure { error: err.to_string() },
                        None => break DisconnectCause::RemoteClosed,
                    },
                }
            };
            let _ = actor_ref.tell(Disconnect { epoch, cause }).send().await;
        }));
    }

    fn start_heartbeat_loop(&mut self) {
        if let Some(handle) = self.heartbeat_task.take() {
            handle.abort();
        }
        let epoch = self.epoch;
        let interval = self.heartbeat.interval();
        let actor_ref = self.actor_ref.clone();
        self.heartbeat_task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if actor_ref.tell(HeartbeatDue { epoch }).send().await.is_err() {
                    break;
                }
            }
        }));
    }

    async fn emit_heartbeat(&mut self) {
        let Some((key, frame)) = self.heartbeat.create_probe() else {
            debug!(connection = %self.connection_label(), "heartbeat skipped; too many probes in flight");
            return;
        };
        self.send_wire(&frame).await;

        let actor_ref = self.actor_ref.clone();
        let epoch = self.epoch;
        let timer = ScheduledTask::after(self.heartbeat.timeout(), async move {
            let _ = actor_ref.tell(HeartbeatTimeout { epoch, key }).send().await;
        });
        self.heartbeat_timeouts.retain(|(_, task)| !task.is_finished());
        self.heartbeat_timeouts.push((key, timer));
    }

    /// Connection usable for application traffic: re-arm retries, then flush the offline queue.
    async fn on_ready(&mut self) {
        for id in self.pending.ids() {
            let attempt = self.pending.get(&id).map(|e| e.attempt).unwrap_or(1);
            self.arm_retry(&id, attempt);
        }

        let drained = self.offline.drain(self.config.offline.stale_after());
        for envelope in drained.stale {
            info!(message_id = %envelope.message_id, kind = %envelope.kind, "dropping stale queued message");
            self.handler.on_event(LinkEvent::StaleDropped {
                message_id: envelope.message_id,
            });
        }
        if !drained.fresh.is_empty() {
            info!(
                connection = %self.connection_label(),
                count = drained.fresh.len(),
                "flushing offline queue"
            );
        }
        for envelope in drained.fresh {
            self.dispatch_envelope(envelope).await;
        }
    }

    async fn teardown_io(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
        self.heartbeat_timeouts.clear();
        self.heartbeat.reset();
        if let Some(writer) = self.writer_ref.take() {
            let _ = writer.stop_gracefully().await;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;
        self.shutdown_rx = shutdown_rx;
    }

    async fn handle_disconnect(&mut self, cause: DisconnectCause) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.teardown_io().await;
        self.registered = false;
        self.pending.cancel_timers();

        // Batched envelopes were never written. They leave the PendingSet and are queued
        // offline, to be tracked again when dispatched on the next connection.
        for envelope in self.batch.take() {
            self.pending.remove(&envelope.message_id);
            self.enqueue_offline(envelope);
        }

        self.breaker.record_failure();
        self.health
            .record_internal_error("disconnect", &cause.to_error().to_string());
        self.schedule_reconnect("disconnect", cause);
    }

    async fn process_inbound(&mut self, frame: WsFrame) {
        self.health.record_message();
        let decoded = match ProtocolRouter::decode(&frame) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return,
            Err(err) => {
                warn!(connection = %self.connection_label(), error = %err, "dropping malformed frame");
                self.health.record_internal_error("decode", &err.to_string());
                return;
            }
        };
        let classified = match self.router.classify(decoded) {
            Ok(classified) => classified,
            Err(err) => {
                warn!(connection = %self.connection_label(), error = %err, "dropping invalid frame");
                self.health.record_internal_error("classify", &err.to_string());
                return;
            }
        };

        for inbound in classified {
            match inbound {
                Inbound::HeartbeatRequest { timestamp } => {
                    self.send_wire(&WireFrame::heartbeat_response(timestamp)).await;
                }
                Inbound::HeartbeatResponse { timestamp } => self.on_heartbeat_response(timestamp),
                Inbound::Ack { message_id, status } => self.on_ack(message_id, status),
                Inbound::Registered => {
                    if self.registered {
                        continue;
                    }
                    info!(connection = %self.connection_label(), "registration acknowledged");
                    self.registered = true;
                    self.handler.on_event(LinkEvent::Registered);
                    if self.registration_gates_sends() && self.is_ready() {
                        self.on_ready().await;
                    }
                }
                Inbound::Application(frame) => self.on_application(frame).await,
            }
        }
    }

    fn on_heartbeat_response(&mut self, timestamp: u64) {
        match self.heartbeat.handle_response(timestamp) {
            HeartbeatResult::Response(rtt) => {
                self.heartbeat_timeouts.retain(|(key, _)| *key != timestamp);
                if let Some(change) = self.health.record_rtt(rtt) {
                    info!(
                        connection = %self.connection_label(),
                        from = ?change.from,
                        to = ?change.to,
                        avg_latency_ms = change.avg_latency.as_millis() as u64,
                        "network quality changed"
                    );
                    self.tuning = BatchTuning::for_quality(
                        self.config.batching.max_batch_size,
                        self.config.batching.max_batch_delay(),
                        self.config.batching.compression_threshold_bytes,
                        Some(change.to),
                    );
                    self.handler.on_event(LinkEvent::QualityChanged {
                        from: change.from,
                        to: change.to,
                        avg_latency: change.avg_latency,
                    });
                }
            }
            HeartbeatResult::Unmatched => {
                debug!(connection = %self.connection_label(), timestamp, "unmatched heartbeat response");
            }
        }
    }

    fn on_ack(&mut self, message_id: MessageId, status: AckStatus) {
        let Some(envelope) = self.pending.remove(&message_id) else {
            debug!(%message_id, "ack for untracked message");
            return;
        };
        match status {
            AckStatus::Ok => {
                debug!(%message_id, attempts = envelope.attempt, "message acknowledged");
                self.handler.on_event(LinkEvent::Delivered {
                    message_id,
                    attempts: envelope.attempt,
                });
            }
            AckStatus::Error => self.fail_delivery(&envelope, DeliveryFailureReason::Rejected),
        }
    }

    async fn on_application(&mut self, frame: WireFrame) {
        if let Some(id) = frame.message_id.clone() {
            let first = self.seen.insert(&id);
            if frame.requires_ack {
                self.send_wire(&WireFrame::ack(id.clone(), AckStatus::Ok)).await;
            }
            if !first {
                debug!(message_id = %id, "duplicate inbound message");
                return;
            }
        }
        if let Some(unrouted) = self.router.dispatch(frame) {
            self.handler.on_message(unrouted);
        }
    }

    async fn submit(&mut self, message: OutboundMessage) -> LinkResult<MessageId> {
        if self.state == ConnectionState::Failed {
            return Err(LinkError::Failed);
        }
        if self.stopped {
            return Err(LinkError::Stopped);
        }
        if self.config.capabilities.rate_limit {
            let sender = message
                .sender
                .as_deref()
                .unwrap_or(self.config.client_id.as_str());
            self.limiter.try_acquire(&message.kind, sender)?;
        }

        let envelope = Envelope::from_message(message, self.config.retry.max_attempts);
        let id = envelope.message_id.clone();
        if self.is_ready() {
            self.dispatch_envelope(envelope).await;
        } else {
            debug!(message_id = %id, state = ?self.state, "link not ready; queueing message");
            self.enqueue_offline(envelope);
        }
        Ok(id)
    }

    fn enqueue_offline(&mut self, envelope: Envelope) {
        if let Some(evicted) = self.offline.push(envelope) {
            self.fail_delivery(&evicted, DeliveryFailureReason::QueueOverflow);
        }
    }

    /// Track (when acknowledged delivery is requested) and send or batch one envelope.
    async fn dispatch_envelope(&mut self, mut envelope: Envelope) {
        envelope.attempt = 1;
        if self.config.capabilities.reliability && envelope.requires_ack {
            let id = envelope.message_id.clone();
            self.pending.insert(envelope.clone());
            self.arm_retry(&id, 1);
        }

        if self.config.capabilities.batching && envelope.priority == Priority::Normal {
            match self.batch.push(envelope, self.tuning.max_batch_size) {
                BatchPush::Flush => self.flush_batch().await,
                BatchPush::StartTimer => {
                    let actor_ref = self.actor_ref.clone();
                    let epoch = self.epoch;
                    self.batch
                        .set_timer(ScheduledTask::after(self.tuning.max_batch_delay, async move {
                            let _ = actor_ref.tell(BatchDue { epoch }).send().await;
                        }));
                }
                BatchPush::Buffered => {}
            }
        } else {
            // Keep submission order: anything buffered goes first.
            self.flush_batch().await;
            self.send_envelopes(&[envelope]).await;
        }
    }

    async fn flush_batch(&mut self) {
        let envelopes = self.batch.take();
        if envelopes.is_empty() {
            return;
        }
        debug!(connection = %self.connection_label(), size = envelopes.len(), "flushing batch");
        self.send_envelopes(&envelopes).await;
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.config.retry.base_delay(),
            self.config.retry.max_delay(),
            self.config.retry.multiplier,
            attempt.saturating_sub(1),
        )
    }

    fn arm_retry(&mut self, id: &MessageId, attempt: u32) {
        let delay = self.retry_delay(attempt);
        let actor_ref = self.actor_ref.clone();
        let epoch = self.epoch;
        let message_id = id.clone();
        self.pending.set_timer(
            id,
            ScheduledTask::after(delay, async move {
                let _ = actor_ref.tell(RetryDue { epoch, message_id }).send().await;
            }),
        );
    }

    async fn retry_envelope(&mut self, id: MessageId) {
        let Some(envelope) = self.pending.get(&id).cloned() else {
            return;
        };
        if envelope.is_expired(std::time::Instant::now()) {
            self.pending.remove(&id);
            self.fail_delivery(&envelope, DeliveryFailureReason::Expired);
            return;
        }
        if envelope.attempt >= envelope.max_attempts {
            self.pending.remove(&id);
            self.fail_delivery(&envelope, DeliveryFailureReason::RetriesExhausted);
            return;
        }

        let attempt = envelope.attempt + 1;
        if let Some(tracked) = self.pending.get_mut(&id) {
            tracked.attempt = attempt;
        }
        debug!(message_id = %id, attempt, "resending unacknowledged message");
        let mut resend = envelope;
        resend.attempt = attempt;
        self.send_envelopes(&[resend]).await;
        self.arm_retry(&id, attempt);
    }

    async fn send_envelopes(&mut self, envelopes: &[Envelope]) {
        match encode_batch(envelopes) {
            Ok(text) => self.write_text(text).await,
            Err(err) => {
                warn!(error = %err, "failed to encode outbound envelopes");
                self.health.record_internal_error("encode", &err.to_string());
            }
        }
    }

    async fn send_wire(&mut self, frame: &WireFrame) {
        match encode_wire(frame) {
            Ok(text) => self.write_text(text).await,
            Err(err) => {
                warn!(error = %err, kind = %frame.kind, "failed to encode control frame");
                self.health.record_internal_error("encode", &err.to_string());
            }
        }
    }

    async fn write_text(&mut self, text: String) {
        let frame = if self.config.capabilities.batching {
            compress_frame(
                text,
                self.tuning.compression_threshold,
                self.tuning.compression_level,
            )
        } else {
            WsFrame::text(text)
        };
        self.write_frame(frame).await;
    }

    async fn write_frame(&mut self, frame: WsFrame) {
        let Some(writer) = self.writer_ref.as_ref() else {
            debug!(connection = %self.connection_label(), "no writer; dropping outbound frame");
            return;
        };
        if writer.tell(WriterWrite { frame }).send().await.is_ok() {
            self.health.record_sent();
        } else {
            warn!(connection = %self.connection_label(), "websocket writer unavailable");
            self.health.record_internal_error("outbound", "writer unavailable");
        }
    }
}
