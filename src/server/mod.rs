//! Producer: camera capture, control-plane state machine and frame broadcast.
//!
//! Network work (accept, one receive task per client, the broadcast cadence)
//! runs on the async runtime. The camera lives on its own thread and only
//! talks to the runtime through the latest-frame cell.

pub mod broadcast;
pub mod commands;
pub mod connection;
pub mod fanout;
pub mod registry;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use futures_util::StreamExt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::camera::{CameraFactory, CaptureConfig, FrameSource};
use crate::config::ServerConfig;
use crate::crypto::SharedKey;
use broadcast::{BroadcastConfig, BroadcastEngine};
use commands::CommandProcessor;
use connection::{ConnectionId, WsConnection};
use registry::SessionRegistry;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Server {
    config: ServerConfig,
    key: Option<Arc<SharedKey>>,
    registry: Arc<SessionRegistry>,
    next_conn_id: AtomicU64,
}

/// Shared handles each receive task needs
#[derive(Clone)]
struct ConnectionContext {
    registry: Arc<SessionRegistry>,
    processor: Arc<CommandProcessor>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
}

impl Server {
    /// `key` switches on the encrypted envelope for every frame.
    pub fn new(config: ServerConfig, key: Option<SharedKey>) -> Self {
        Self {
            config,
            key: key.map(Arc::new),
            registry: Arc::new(SessionRegistry::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run_until<F>(&self, opener: CameraFactory, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.config.bind_addr))?;
        self.serve(listener, opener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve<F>(&self, listener: TcpListener, opener: CameraFactory, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr().context("Listener has no local address")?;

        let source = FrameSource::start(
            opener,
            CaptureConfig {
                fps_limit: self.config.fps_limit,
                backoff: self.config.capture_backoff(),
            },
        )
        .context("Failed to start capture thread")?;

        info!(
            addr = %local_addr,
            mode = ?self.config.broadcast_mode,
            quality = self.config.jpeg_quality,
            "camlink producer listening"
        );
        match &self.key {
            Some(key) => info!(fingerprint = %key.fingerprint().short(), "Frames are encrypted"),
            None => warn!("No shared key loaded, frames are sent unencrypted"),
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        let engine = Arc::new(BroadcastEngine::new(
            self.registry.clone(),
            source.cell(),
            self.key.clone(),
            BroadcastConfig {
                interval: self.config.broadcast_interval(),
                jpeg_quality: self.config.jpeg_quality,
                mode: self.config.broadcast_mode,
                send_timeout: self.config.send_timeout_duration(),
            },
        ));
        tracker.spawn({
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move { engine.run(cancel).await }
        });

        let ctx = ConnectionContext {
            registry: self.registry.clone(),
            processor: Arc::new(CommandProcessor::new(
                self.registry.clone(),
                self.config.send_timeout_duration(),
            )),
            handshake_timeout: self.config.handshake_timeout(),
            cancel: cancel.clone(),
        };

        tokio::select! {
            _ = shutdown => info!("Shutdown signal received"),
            _ = self.accept_loop(&listener, &tracker, &ctx) => {}
        }

        self.shutdown(source, cancel, tracker).await;
        Ok(())
    }

    async fn accept_loop(&self, listener: &TcpListener, tracker: &TaskTracker, ctx: &ConnectionContext) {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::Relaxed));
                    debug!(conn = %id, peer = %peer, "Accepted TCP connection");
                    tracker.spawn(handle_connection(socket, peer, id, ctx.clone()));
                }
                Err(e) => {
                    // EMFILE and friends persist; don't spin on them
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Stop capture, cancel network tasks, close every client, then wait
    /// for all of it to finish.
    async fn shutdown(&self, source: FrameSource, cancel: CancellationToken, tracker: TaskTracker) {
        if self.registry.is_empty() {
            info!("Deactivated with no clients connected");
        } else {
            info!(clients = self.registry.len(), "Deactivated with clients connected");
        }
        let open = self.registry.connections();

        source.stop();
        cancel.cancel();

        let grace = self.config.shutdown_grace();
        let closes = join_all(open.iter().map(|conn| conn.close()));
        if tokio::time::timeout(grace, closes).await.is_err() {
            warn!("Timed out sending close frames");
        }

        tracker.close();
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(remaining = tracker.len(), "Tasks still running after shutdown grace period");
        }

        if let Err(e) = tokio::task::spawn_blocking(move || source.join()).await {
            warn!(error = %e, "Failed to join capture thread");
        }
        info!("Producer stopped");
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, id: ConnectionId, ctx: ConnectionContext) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn = %id, error = %e, "Failed to set TCP_NODELAY");
    }

    let ws = match tokio::time::timeout(ctx.handshake_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            // Scanners and plain HTTP probes land here
            debug!(conn = %id, peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            debug!(conn = %id, peer = %peer, "WebSocket handshake timed out");
            return;
        }
    };

    let (sink, mut incoming) = ws.split();
    let conn = Arc::new(WsConnection::new(id, peer, sink));
    let clients = ctx.registry.register(conn.clone());
    info!(conn = %id, peer = %peer, clients, "Client connected");

    loop {
        let msg = tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            msg = incoming.next() => msg,
        };
        match msg {
            Some(Ok(WsMessage::Text(text))) => {
                ctx.processor.handle_text(id, &text).await;
            }
            Some(Ok(WsMessage::Binary(data))) => {
                debug!(conn = %id, len = data.len(), "Ignoring binary message from client");
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn = %id, error = %e, "Receive error");
                break;
            }
        }
    }

    conn.mark_closed();
    if let Some(departure) = ctx.registry.unregister(id) {
        if departure.forced_stop {
            warn!(
                conn = %id,
                peer = %peer,
                remaining = departure.remaining,
                "Controller disconnected, stream and recording stopped"
            );
        } else if departure.was_controller {
            info!(conn = %id, peer = %peer, remaining = departure.remaining, "Controller disconnected");
        } else {
            info!(conn = %id, peer = %peer, remaining = departure.remaining, "Client disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, TestPattern};
    use crate::config::BroadcastMode;
    use crate::crypto;
    use futures_util::SinkExt;
    use tokio::sync::oneshot;
    use tokio_tungstenite::connect_async;

    fn test_pattern() -> CameraFactory {
        Box::new(|| Ok(Box::new(TestPattern::new(32, 24, 60)?) as Box<dyn Camera>))
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    }

    async fn next_binary<S>(ws: &mut S) -> Vec<u8>
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Binary(data))) => return data,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_stream_and_controller_disconnect() {
        let key = SharedKey::from_bytes(&[9u8; 32]).unwrap();
        let config = ServerConfig::default()
            .fps_limit(Some(50))
            .broadcast_mode(BroadcastMode::Gated);
        let server = Arc::new(Server::new(config, Some(key.clone())));
        let registry = server.registry();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .serve(listener, test_pattern(), async {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        let (mut a, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        assert!(wait_until(|| registry.len() == 1).await);

        a.send(WsMessage::Text("START_LINK".into())).await.unwrap();
        a.send(WsMessage::Text("start_stream".into())).await.unwrap();
        assert_eq!(next_text(&mut a).await, "STREAM_STARTED");

        let packet = next_binary(&mut a).await;
        let jpeg = crypto::decrypt(&packet, &key).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        a.send(WsMessage::Text("START_RECORD".into())).await.unwrap();
        assert!(wait_until(|| registry.snapshot().recording_active).await);

        // Drop without STOP_LINK
        drop(a);
        assert!(wait_until(|| registry.is_empty()).await);
        let state = registry.snapshot();
        assert_eq!(state.controller, None);
        assert!(!state.streaming_active);
        assert!(!state.recording_active);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_binary_from_client_ignored() {
        let server = Arc::new(Server::new(ServerConfig::default(), None));
        let registry = server.registry();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .serve(listener, test_pattern(), async {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        assert!(wait_until(|| registry.len() == 1).await);

        client
            .send(WsMessage::Binary(b"START_STREAM".to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot(), registry::SessionState::default());

        client.send(WsMessage::Text("START_STREAM".into())).await.unwrap();
        assert_eq!(next_text(&mut client).await, "STREAM_STARTED");
        let state = registry.snapshot();
        assert!(state.streaming_active);
        assert!(state.controller.is_some());

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let server = Arc::new(Server::new(ServerConfig::default(), None));
        let registry = server.registry();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .serve(listener, test_pattern(), async {
                        let _ = stop_rx.await;
                    })
                    .await
            }
        });

        let (mut viewer, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        assert!(wait_until(|| registry.len() == 1).await);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), serving)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Close frame (or EOF) arrives; no more frames
        let ended = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match viewer.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return true,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .unwrap();
        assert!(ended);
        assert!(registry.is_empty());
    }
}
