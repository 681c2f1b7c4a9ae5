mod camera;
mod cli;
mod client;
mod config;
mod crypto;
mod protocol;
mod server;

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use std::path::{Path, PathBuf};
use tracing::info;

use camera::{Camera, CameraFactory, TestPattern};
use client::CamClient;
use config::{ClientConfig, ServerConfig};
use crypto::SharedKey;
use server::Server;

/// Nominal rate of the synthetic sensor
const SENSOR_FPS: u32 = 30;

// Everything network-facing runs on one cooperative scheduler; the camera and
// encoder work happen on their own threads.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(cli.quiet)?;

    match cli.command {
        Commands::Serve {
            config,
            addr,
            key,
            fps,
            quality,
            mode,
        } => {
            let mut server_config = match config {
                Some(path) => ServerConfig::load(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(addr) = addr {
                server_config = server_config.bind(addr);
            }
            if fps.is_some() {
                server_config = server_config.fps_limit(fps);
            }
            if let Some(quality) = quality {
                server_config = server_config.jpeg_quality(quality);
            }
            if let Some(mode) = mode {
                server_config = server_config.broadcast_mode(mode);
            }
            let key = load_key(key.as_deref())?;
            serve(server_config, key).await?;
        }
        Commands::Connect {
            config,
            servers,
            servers_file,
            port,
            key,
            output,
            ffmpeg,
            no_color_fix,
            no_reconnect,
        } => {
            let mut client_config = match config {
                Some(path) => ClientConfig::load(&path)?,
                None => ClientConfig::default(),
            };
            if let Some(path) = servers_file {
                client_config = client_config.add_candidates(config::load_candidates(&path)?);
            }
            client_config = client_config.add_candidates(servers);
            if let Some(port) = port {
                client_config = client_config.port(port);
            }
            if let Some(output) = output {
                client_config = client_config.output_dir(output);
            }
            if let Some(ffmpeg) = ffmpeg {
                client_config = client_config.ffmpeg_path(ffmpeg);
            }
            if no_color_fix {
                client_config = client_config.disable_color_correction();
            }
            if no_reconnect {
                client_config = client_config.disable_reconnect();
            }
            let key = load_key(key.as_deref())?;
            connect(client_config, key).await?;
        }
        Commands::Fingerprint { key } => {
            let key = SharedKey::load_from_file(&key)
                .with_context(|| format!("Failed to load key {}", key.display()))?;
            println!("{}", key.fingerprint().grouped());
        }
    }

    Ok(())
}

fn init_logging(quiet: bool) -> Result<()> {
    let directive = if quiet { "camlink=warn" } else { "camlink=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().context("Invalid log directive")?),
        )
        .init();
    Ok(())
}

/// A key file that is given must load; no file means unencrypted frames.
fn load_key(path: Option<&Path>) -> Result<Option<SharedKey>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let key = SharedKey::load_from_file(path)
        .with_context(|| format!("Failed to load shared key {}", path.display()))?;
    info!(fingerprint = %key.fingerprint().short(), "Shared key loaded");
    Ok(Some(key))
}

async fn serve(config: ServerConfig, key: Option<SharedKey>) -> Result<()> {
    let (width, height) = (config.frame_width, config.frame_height);
    let opener: CameraFactory =
        Box::new(move || Ok(Box::new(TestPattern::new(width, height, SENSOR_FPS)?) as Box<dyn Camera>));

    let server = Server::new(config, key);
    server.run_until(opener, shutdown_signal()).await
}

async fn connect(config: ClientConfig, key: Option<SharedKey>) -> Result<()> {
    let output: PathBuf = config.output_dir.clone();
    info!(candidates = ?config.candidates, output = %output.display(), "Starting consumer");
    CamClient::new(config, key).run_until(shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}
