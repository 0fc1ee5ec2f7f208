//! WebSocket transport (§6, §7 redesign note): the duplex channel each
//! connection is realized over.
//!
//! The teacher's original transport is HTTP polling (`server/src/api.rs`),
//! which cannot carry a server-initiated push; this spec requires a
//! persistent full-duplex channel (§4.1), so the accept loop here binds a
//! raw `TcpListener` and upgrades each connection with `tokio-tungstenite`,
//! following `examples/original_source/management_platform/api/connection_manager.py`'s
//! `fastapi.WebSocket`-based design but in the teacher's own
//! `tokio::net::TcpListener::bind` + `tokio::spawn`-per-connection idiom
//! (`server/src/main.rs`'s listener bind, reused verbatim for the bind
//! step).

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use shared::protocol::Frame;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

pub type WsStream = WebSocketStream<TcpStream>;

/// A single logical channel: send/receive `Frame`s over a WebSocket.
pub struct Channel {
    stream: WsStream,
}

impl Channel {
    pub fn new(stream: WsStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let text = serde_json::to_string(frame)?;
        self.stream.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    /// Returns `None` when the channel closed.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Frame>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Some(serde_json::from_str(&text)?));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

/// Binds `addr` and accepts connections indefinitely, handing each
/// upgraded channel to `on_accept`. Runs until the listener errors or the
/// caller drops the returned task.
pub async fn serve<F, Fut>(addr: SocketAddr, on_accept: F) -> anyhow::Result<()>
where
    F: Fn(Channel, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    debug!(%addr, "connection manager listening");

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        match tokio_tungstenite::accept_async(stream).await {
            Ok(ws_stream) => {
                let channel = Channel::new(ws_stream);
                tokio::spawn(on_accept(channel, peer_addr));
            }
            Err(e) => {
                warn!(%peer_addr, error = %e, "websocket upgrade failed");
            }
        }
    }
}
