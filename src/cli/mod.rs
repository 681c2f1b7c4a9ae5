use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::BroadcastMode;

#[derive(Parser)]
#[command(name = "camlink")]
#[command(about = "Live camera link with remote stream/record control", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the camera producer
    Serve {
        /// JSON config file; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Address to bind to
        #[arg(short, long)]
        addr: Option<SocketAddr>,

        /// 32-byte shared key file; frames are encrypted when given
        #[arg(short, long)]
        key: Option<PathBuf>,

        /// Cap capture and broadcast rate
        #[arg(long)]
        fps: Option<u32>,

        /// JPEG quality (1-100)
        #[arg(long)]
        quality: Option<u8>,

        /// Send frames only while streaming (gated) or to everyone (always)
        #[arg(long, value_enum)]
        mode: Option<BroadcastMode>,
    },

    /// Connect to a producer, forward stdin commands and record on request
    Connect {
        /// JSON config file; flags below override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Producer address (repeatable, tried in order)
        #[arg(short, long = "server")]
        servers: Vec<String>,

        /// File with one producer address per line
        #[arg(long)]
        servers_file: Option<PathBuf>,

        /// Port used for addresses without one
        #[arg(short, long)]
        port: Option<u16>,

        /// 32-byte shared key file; required if the producer encrypts
        #[arg(short, long)]
        key: Option<PathBuf>,

        /// Directory for finished videos
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// ffmpeg binary
        #[arg(long)]
        ffmpeg: Option<PathBuf>,

        /// Skip the red/blue swap before encoding
        #[arg(long)]
        no_color_fix: bool,

        /// Exit when the link drops instead of reconnecting
        #[arg(long)]
        no_reconnect: bool,
    },

    /// Print the fingerprint of a shared key file
    Fingerprint {
        /// Key file
        #[arg(short, long)]
        key: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
