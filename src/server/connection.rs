//! Client connection capability.
//!
//! Everything the registry, command processor and broadcast engine need from
//! a connected client goes through [`ClientConnection`]. Identity is the
//! [`ConnectionId`] handed out at accept time, never the remote address.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{tungstenite, tungstenite::Message as WsMessage, WebSocketStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("send timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait ClientConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Remote endpoint, for log lines only
    fn peer(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<(), SendError>;

    async fn send_binary(&self, data: &[u8]) -> Result<(), SendError>;

    /// Best-effort close handshake
    async fn close(&self);
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Server side of an accepted WebSocket. The read half stays with the
/// connection's receive task; writes from the broadcast loop and command
/// notifications serialize on the sink lock.
pub struct WsConnection {
    id: ConnectionId,
    peer: SocketAddr,
    sink: Mutex<WsSink>,
    open: AtomicBool,
}

impl WsConnection {
    pub fn new(id: ConnectionId, peer: SocketAddr, sink: WsSink) -> Self {
        Self {
            id,
            peer,
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
        }
    }

    /// Called by the receive task once the read half has ended.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Relaxed);
    }

    async fn send(&self, msg: WsMessage) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::Closed);
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(msg).await {
            self.mark_closed();
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl ClientConnection for WsConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.send(WsMessage::Text(text.to_string())).await
    }

    async fn send_binary(&self, data: &[u8]) -> Result<(), SendError> {
        self.send(WsMessage::Binary(data.to_vec())).await
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        // Sink::close sends the close frame and flushes
        let _ = sink.close().await;
        self.mark_closed();
    }
}
