//! Producer and consumer configuration.
//!
//! Both structs deserialize from an optional JSON file with every field
//! defaulted, and command-line flags are applied on top through the builder
//! setters.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default producer port
pub const DEFAULT_PORT: u16 = 5000;

/// Cadence used when no explicit FPS limit is configured
pub const DEFAULT_BROADCAST_FPS: u32 = 30;

/// Whether frames only flow while a controller has streaming switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastMode {
    /// Send frames only while `streaming_active` is set
    #[default]
    Gated,
    /// Send frames to every registered viewer regardless of stream state
    Always,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind_addr: SocketAddr,

    /// JPEG quality, 1-100
    pub jpeg_quality: u8,

    /// Caps both capture and broadcast cadence. `None` leaves capture
    /// unthrottled and broadcasts at 30 Hz.
    pub fps_limit: Option<u32>,

    pub broadcast_mode: BroadcastMode,

    /// Upper bound on a single send to one client
    pub send_timeout_ms: u64,

    /// Pause before reopening the camera after a capture fault
    pub capture_backoff_ms: u64,

    /// WebSocket upgrade must complete within this time
    pub handshake_timeout_ms: u64,

    /// Synthetic camera resolution
    pub frame_width: u32,
    pub frame_height: u32,

    /// How long shutdown waits for tasks to drain
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            jpeg_quality: 95,
            fps_limit: None,
            broadcast_mode: BroadcastMode::Gated,
            send_timeout_ms: 2_000,
            capture_backoff_ms: 2_000,
            handshake_timeout_ms: 10_000,
            frame_width: 640,
            frame_height: 480,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file; missing fields keep their defaults. Values go
    /// through the same normalization as the builder setters.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_json(path)?;
        let (quality, fps) = (config.jpeg_quality, config.fps_limit);
        Ok(config.jpeg_quality(quality).fps_limit(fps))
    }

    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    /// Zero is treated as "no limit"
    pub fn fps_limit(mut self, fps: Option<u32>) -> Self {
        self.fps_limit = fps.filter(|&f| f > 0);
        self
    }

    pub fn broadcast_mode(mut self, mode: BroadcastMode) -> Self {
        self.broadcast_mode = mode;
        self
    }

    pub fn broadcast_interval(&self) -> Duration {
        let fps = self.fps_limit.unwrap_or(DEFAULT_BROADCAST_FPS).max(1);
        Duration::from_secs_f64(1.0 / fps as f64)
    }

    pub fn send_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn capture_backoff(&self) -> Duration {
        Duration::from_millis(self.capture_backoff_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Producer hosts, tried in order
    pub candidates: Vec<String>,
    pub port: u16,

    /// Finished videos land here; temporary frame directories too
    pub output_dir: PathBuf,

    /// Frame rate passed to the encoder
    pub frame_rate: u32,

    /// Swap red and blue before encoding (the producer ships sensor BGR)
    pub color_correction: bool,

    pub ffmpeg_path: PathBuf,

    /// Leave raw frames on disk when the encoder fails
    pub keep_frames_on_failure: bool,

    pub reconnect: bool,

    pub dial_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            candidates: Vec::new(),
            port: DEFAULT_PORT,
            output_dir: PathBuf::from("videos"),
            frame_rate: 30,
            color_correction: true,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            keep_frames_on_failure: true,
            reconnect: true,
            dial_timeout_ms: 5_000,
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }

    /// Append candidates, skipping ones already listed.
    pub fn add_candidates<I: IntoIterator<Item = String>>(mut self, candidates: I) -> Self {
        for candidate in candidates {
            if !self.candidates.contains(&candidate) {
                self.candidates.push(candidate);
            }
        }
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = dir;
        self
    }

    pub fn ffmpeg_path(mut self, path: PathBuf) -> Self {
        self.ffmpeg_path = path;
        self
    }

    pub fn disable_color_correction(mut self) -> Self {
        self.color_correction = false;
        self
    }

    pub fn disable_reconnect(mut self) -> Self {
        self.reconnect = false;
        self
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// WebSocket URL for one candidate host. A candidate that already carries
    /// a port is used as-is.
    pub fn url_for(&self, candidate: &str) -> String {
        if candidate.starts_with("ws://") || candidate.starts_with("wss://") {
            candidate.to_string()
        } else if candidate.parse::<SocketAddr>().is_ok() {
            format!("ws://{}", candidate)
        } else {
            format!("ws://{}:{}", candidate, self.port)
        }
    }
}

/// Read a candidate list: one address per line, blanks and `#` comments
/// skipped, order preserved.
pub fn load_candidates(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read candidate list {}", path.display()))?;
    Ok(parse_candidates(&text))
}

pub fn parse_candidates(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
}
