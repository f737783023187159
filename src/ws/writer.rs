use futures_util::{Sink, SinkExt};
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::core::{LinkError, WsFrame};

/// Writer actor that owns the transport sink and serializes writes for one connection.
///
/// Writes are fire-and-forget from the link's point of view; the first sink error is reported
/// once on `failures` and every later write is dropped.
pub struct WsWriterActor<W>
where
    W: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static,
{
    writer: W,
    shutdown_rx: watch::Receiver<bool>,
    failures: mpsc::UnboundedSender<LinkError>,
    failed: bool,
}

impl<W> WsWriterActor<W>
where
    W: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static,
{
    pub fn new(
        writer: W,
        shutdown_rx: watch::Receiver<bool>,
        failures: mpsc::UnboundedSender<LinkError>,
    ) -> Self {
        Self {
            writer,
            shutdown_rx,
            failures,
            failed: false,
        }
    }

    fn accepting(&self) -> bool {
        !self.failed && !*self.shutdown_rx.borrow()
    }

    fn fail(&mut self, err: LinkError) {
        if !self.failed {
            self.failed = true;
            let _ = self.failures.send(err);
        }
    }
}

impl<W> Actor for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static,
{
    type Args = Self;
    type Error = LinkError;

    fn name() -> &'static str {
        "WsWriterActor"
    }

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    async fn on_stop(
        &mut self,
        _ctx: kameo::actor::WeakActorRef<Self>,
        _reason: kameo::error::ActorStopReason,
    ) -> Result<(), Self::Error> {
        if !self.failed {
            let _ = self.writer.close().await;
        }
        Ok(())
    }
}

pub struct WriterWrite {
    pub frame: WsFrame,
}

impl<W> KameoMessage<WriterWrite> for WsWriterActor<W>
where
    W: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static,
{
    type Reply = ();

    async fn handle(&mut self, msg: WriterWrite, _ctx: &mut Context<Self, Self::Reply>) {
        if !self.accepting() {
            return;
        }
        debug!(target: "broker-link-writer", "sending websocket frame to wire");
        if let Err(err) = self.writer.send(msg.frame).await {
            self.fail(err);
        }
    }
}
