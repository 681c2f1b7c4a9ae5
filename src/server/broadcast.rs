//! Frame broadcast loop.
//!
//! On every cadence tick: copy the newest frame out of the capture cell,
//! JPEG-encode it (and seal it if a key is configured) on the blocking pool,
//! then fan the bytes out to every open connection.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fanout::{fan_out, FanOutReport, Payload};
use super::registry::SessionRegistry;
use crate::camera::{Frame, LatestFrame};
use crate::config::BroadcastMode;
use crate::crypto::{self, SharedKey};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub interval: Duration,
    pub jpeg_quality: u8,
    pub mode: BroadcastMode,
    pub send_timeout: Duration,
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Gated mode and no stream is active
    NotStreaming,
    /// Nothing captured yet
    NoFrame,
    /// A frame was read but nobody is connected
    NoAudience,
    EncodeFailed,
    Sent(FanOutReport),
}

pub struct BroadcastEngine {
    registry: Arc<SessionRegistry>,
    frames: Arc<LatestFrame>,
    key: Option<Arc<SharedKey>>,
    config: BroadcastConfig,
}

impl BroadcastEngine {
    pub fn new(
        registry: Arc<SessionRegistry>,
        frames: Arc<LatestFrame>,
        key: Option<Arc<SharedKey>>,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            registry,
            frames,
            key,
            config,
        }
    }

    /// Run until cancelled. A slow tick delays the next one rather than
    /// bursting to catch up.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            mode = ?self.config.mode,
            encrypted = self.key.is_some(),
            "Broadcast loop started"
        );

        let mut frames_sent = 0u64;
        let mut failed_sends = 0u64;
        let mut last_stats = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Tick::Sent(report) = self.tick().await {
                        frames_sent += 1;
                        failed_sends += report.failed as u64;
                    }
                    if last_stats.elapsed() >= STATS_INTERVAL {
                        info!(
                            frames_sent,
                            failed_sends,
                            clients = self.registry.len(),
                            "Broadcast stats"
                        );
                        last_stats = Instant::now();
                    }
                }
            }
        }

        info!(frames_sent, "Broadcast loop stopped");
    }

    pub async fn tick(&self) -> Tick {
        if self.config.mode == BroadcastMode::Gated && !self.registry.snapshot().streaming_active {
            return Tick::NotStreaming;
        }

        let Some(frame) = self.frames.latest() else {
            return Tick::NoFrame;
        };

        let connections = self.registry.connections();
        if connections.is_empty() {
            return Tick::NoAudience;
        }

        let quality = self.config.jpeg_quality;
        let key = self.key.clone();
        let prepared =
            tokio::task::spawn_blocking(move || prepare_payload(&frame, quality, key.as_deref()))
                .await;

        let bytes = match prepared {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to prepare frame, skipping tick");
                return Tick::EncodeFailed;
            }
            Err(e) => {
                warn!(error = %e, "Frame preparation task failed");
                return Tick::EncodeFailed;
            }
        };

        let report = fan_out(&connections, &Payload::Binary(bytes), self.config.send_timeout).await;
        if report.failed > 0 {
            debug!(
                delivered = report.delivered,
                failed = report.failed,
                "Frame fan-out had failures"
            );
        }
        Tick::Sent(report)
    }
}

/// Encode to JPEG and, when a key is present, wrap in the encrypted envelope.
pub fn prepare_payload(frame: &Frame, quality: u8, key: Option<&SharedKey>) -> Result<Vec<u8>> {
    let jpeg = frame.encode_jpeg(quality)?;
    match key {
        Some(key) => Ok(crypto::encrypt(&jpeg, key)?),
        None => Ok(jpeg),
    }
}
