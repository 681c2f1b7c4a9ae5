//! Consumer: dials the producer, forwards commands, receives frames and
//! records them on request.

pub mod color;
pub mod encoder;
pub mod recording;

use anyhow::{bail, Result};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::crypto::{self, SharedKey};
use crate::protocol::{Command, Notification};
use encoder::{FfmpegEncoder, VideoEncoder};
use recording::{Finalized, RecordingOptions, RecordingPipeline};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Why a link ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkEnd {
    /// Producer closed it or the transport failed
    Dropped,
    /// Local shutdown; STOP_LINK and a close frame were sent
    Shutdown,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReceiveStats {
    received: u64,
    dropped: u64,
}

impl ReceiveStats {
    fn log(&self, pipeline: &RecordingPipeline) {
        info!(
            received = self.received,
            dropped = self.dropped,
            persisted = pipeline.frames_persisted(),
            "Receive stats"
        );
    }
}

pub struct CamClient {
    config: ClientConfig,
    key: Option<SharedKey>,
    encoder: Box<dyn VideoEncoder>,
    commands: Option<mpsc::UnboundedReceiver<Command>>,
}

impl CamClient {
    pub fn new(config: ClientConfig, key: Option<SharedKey>) -> Self {
        let encoder = Box::new(FfmpegEncoder::new(config.ffmpeg_path.clone()));
        Self {
            config,
            key,
            encoder,
            commands: None,
        }
    }

    #[cfg(test)]
    pub fn with_encoder(mut self, encoder: Box<dyn VideoEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Take commands from this channel instead of stdin.
    #[cfg(test)]
    pub fn with_commands(mut self, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Run until `shutdown` resolves or the link ends with reconnection off.
    /// Fails if no candidate can be reached on the first round.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if self.config.candidates.is_empty() {
            bail!("No producer addresses configured");
        }
        if let Some(key) = &self.key {
            info!(fingerprint = %key.fingerprint().short(), "Frame decryption enabled");
        }

        let cancel = CancellationToken::new();
        let main = self.session_loop(cancel.clone());
        tokio::pin!(main);

        tokio::select! {
            result = &mut main => return result,
            _ = shutdown => {
                info!("Shutdown signal received");
                cancel.cancel();
            }
        }
        main.await
    }

    async fn session_loop(self, cancel: CancellationToken) -> Result<()> {
        let CamClient {
            config,
            key,
            encoder,
            commands,
        } = self;

        let mut pipeline = RecordingPipeline::new(RecordingOptions::from(&config), encoder);
        let mut commands = match commands {
            Some(rx) => rx,
            None => spawn_stdin_reader(),
        };
        let link = Link {
            config: &config,
            key: key.as_ref(),
        };

        let mut first_round = true;
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;

        loop {
            let dialed = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                dialed = link.dial() => dialed,
            };

            let ws = match dialed {
                Some(ws) => ws,
                None if first_round => {
                    bail!(
                        "No reachable producer among {} candidate(s)",
                        config.candidates.len()
                    );
                }
                None => {
                    attempt += 1;
                    warn!(attempt, retry_in_secs = backoff.as_secs(), "All candidates unreachable");
                    if !wait_backoff(&cancel, &mut backoff).await {
                        return Ok(());
                    }
                    continue;
                }
            };
            if !first_round {
                info!(attempt, "Reconnected");
            }
            first_round = false;
            backoff = INITIAL_BACKOFF;
            attempt = 0;

            let end = link.run(ws, &mut pipeline, &mut commands, &cancel).await;

            if let Some(session) = pipeline.session() {
                warn!(
                    dir = %session.dir().display(),
                    frames = session.frames(),
                    first_frame_at = ?session.first_frame_at(),
                    "Link ended during a recording, finalizing what was received"
                );
                report_finalized(pipeline.finish().await);
            }

            match end {
                LinkEnd::Shutdown => return Ok(()),
                LinkEnd::Dropped if !config.reconnect => {
                    info!("Link closed, reconnection disabled");
                    return Ok(());
                }
                LinkEnd::Dropped => {
                    attempt += 1;
                    warn!(attempt, retry_in_secs = backoff.as_secs(), "Connection lost, reconnecting");
                    if !wait_backoff(&cancel, &mut backoff).await {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Borrowed view of what one link needs
struct Link<'a> {
    config: &'a ClientConfig,
    key: Option<&'a SharedKey>,
}

impl Link<'_> {
    /// Try each candidate in order; first success wins.
    async fn dial(&self) -> Option<WsStream> {
        for candidate in &self.config.candidates {
            let url = self.config.url_for(candidate);
            match tokio::time::timeout(self.config.dial_timeout(), connect_async(url.as_str())).await {
                Ok(Ok((ws, _))) => {
                    info!(url = %url, "Connected to producer");
                    return Some(ws);
                }
                Ok(Err(e)) => warn!(url = %url, error = %e, "Failed to connect"),
                Err(_) => warn!(url = %url, "Connection attempt timed out"),
            }
        }
        None
    }

    async fn run(
        &self,
        ws: WsStream,
        pipeline: &mut RecordingPipeline,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) -> LinkEnd {
        let (mut sink, mut incoming) = ws.split();

        if let Err(e) = sink.send(WsMessage::Text(Command::StartLink.to_string())).await {
            warn!(error = %e, "Failed to send START_LINK");
            return LinkEnd::Dropped;
        }

        let mut stats = ReceiveStats::default();
        let mut stats_tick = interval(STATS_INTERVAL);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stats_tick.tick().await;

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = sink.send(WsMessage::Text(Command::StopLink.to_string())).await {
                        debug!(error = %e, "Failed to send STOP_LINK");
                    }
                    let _ = sink.close().await;
                    break LinkEnd::Shutdown;
                }
                Some(command) = commands.recv() => {
                    info!(command = %command, "Sending command");
                    if let Err(e) = sink.send(WsMessage::Text(command.to_string())).await {
                        warn!(error = %e, "Failed to send command");
                        break LinkEnd::Dropped;
                    }
                }
                _ = stats_tick.tick() => stats.log(pipeline),
                msg = incoming.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => self.handle_text(&text, pipeline).await,
                    Some(Ok(WsMessage::Binary(data))) => self.handle_frame(&data, pipeline, &mut stats).await,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("Producer closed the connection");
                        break LinkEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Connection error");
                        break LinkEnd::Dropped;
                    }
                },
            }
        };

        stats.log(pipeline);
        end
    }

    async fn handle_text(&self, text: &str, pipeline: &mut RecordingPipeline) {
        let notification = match text.parse::<Notification>() {
            Ok(n) => n,
            Err(_) => {
                info!(text, "Unrecognised message from producer");
                return;
            }
        };
        info!(notification = %notification, "Producer notification");

        report_finalized(pipeline.handle_notification(notification).await);
    }

    async fn handle_frame(&self, data: &[u8], pipeline: &mut RecordingPipeline, stats: &mut ReceiveStats) {
        let frame = match self.key {
            Some(key) => match crypto::decrypt(data, key) {
                Ok(plain) => plain,
                Err(e) => {
                    stats.dropped += 1;
                    warn!(error = %e, len = data.len(), "Dropping frame");
                    return;
                }
            },
            None => data.to_vec(),
        };
        stats.received += 1;

        if let Err(e) = pipeline.handle_frame(&frame).await {
            warn!(error = %e, "Failed to write frame");
        }
    }
}

/// Sleep for the current backoff, then double it. Returns `false` if
/// cancelled while waiting.
async fn wait_backoff(cancel: &CancellationToken, backoff: &mut Duration) -> bool {
    let wait = *backoff;
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(wait) => true,
    }
}

fn report_finalized(result: Result<Option<Finalized>, recording::RecordingError>) {
    match result {
        Ok(Some(Finalized::Encoded { output, frames })) => {
            info!(output = %output.display(), frames, "Recording saved")
        }
        Ok(Some(Finalized::EncoderFailed { kept: Some(dir) })) => {
            warn!(dir = %dir.display(), "Recording not encoded, frames kept")
        }
        Ok(Some(Finalized::EncoderFailed { kept: None })) => warn!("Recording not encoded, frames discarded"),
        Ok(Some(Finalized::Empty)) | Ok(None) => {}
        Err(e) => error!(error = %e, "Recording step failed"),
    }
}

/// Forward stdin lines as commands. Unknown words are reported locally and
/// not sent.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<Command> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<Command>() {
                        Ok(command) => {
                            if tx.send(command).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring console input"),
                    }
                }
                Ok(None) => {
                    debug!("stdin closed, console commands disabled");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });
    rx
}
