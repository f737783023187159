use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{LinkError, WebSocketBufferConfig, WsFrame, WsTlsConfig};

pub mod tungstenite;

/// Future returned by [`WsTransport::connect`].
pub type WsTransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = Result<(R, W), LinkError>> + Send>>;

/// Transport boundary for websocket IO.
///
/// The read loop lives outside kameo; the link actor owns state and policies. Keeping the trait
/// minimal lets tests swap in an in-memory broker without touching protocol logic.
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<WsFrame, LinkError>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = LinkError> + Send + Sync + Unpin + 'static;

    fn connect(
        &self,
        url: String,
        buffers: WebSocketBufferConfig,
        tls: WsTlsConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer>;
}
