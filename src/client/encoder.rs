//! External video encoder.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, info};

/// Frame file pattern inside a recording directory, in ffmpeg's printf syntax
pub const FRAME_PATTERN: &str = "frame_%08d.jpg";

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to start encoder: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("encoder exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
}

/// Turns an ordered directory of frames into a single container file.
#[async_trait]
pub trait VideoEncoder: Send + Sync {
    async fn encode(&self, frames_dir: &Path, frame_rate: u32, output: &Path) -> Result<(), EncoderError>;
}

/// Runs the `ffmpeg` binary as a child process. The runtime keeps serving
/// other work while it runs.
pub struct FfmpegEncoder {
    program: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn args(frames_dir: &Path, frame_rate: u32, output: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-framerate".to_string(),
            frame_rate.to_string(),
            "-i".to_string(),
            frames_dir.join(FRAME_PATTERN).to_string_lossy().into_owned(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            output.to_string_lossy().into_owned(),
        ]
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl VideoEncoder for FfmpegEncoder {
    async fn encode(&self, frames_dir: &Path, frame_rate: u32, output: &Path) -> Result<(), EncoderError> {
        let args = Self::args(frames_dir, frame_rate, output);
        debug!(program = %self.program.display(), ?args, "Spawning encoder");
        info!(output = %output.display(), "Running ffmpeg");

        let result = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr).trim().to_string();
            return Err(EncoderError::Failed {
                status: result.status,
                stderr,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod stub {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    pub struct Call {
        pub frames_dir: PathBuf,
        pub frame_rate: u32,
        pub output: PathBuf,
        /// Frame directory listing at the time of the call, sorted
        pub files: Vec<String>,
    }

    /// Records every call; writes a placeholder output file on success.
    #[derive(Clone, Default)]
    pub struct StubEncoder {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub fail: bool,
    }

    impl StubEncoder {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl VideoEncoder for StubEncoder {
        async fn encode(&self, frames_dir: &Path, frame_rate: u32, output: &Path) -> Result<(), EncoderError> {
            let mut files: Vec<String> = std::fs::read_dir(frames_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            files.sort();
            self.calls.lock().push(Call {
                frames_dir: frames_dir.to_path_buf(),
                frame_rate,
                output: output.to_path_buf(),
                files,
            });
            if self.fail {
                return Err(EncoderError::Spawn(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no encoder",
                )));
            }
            std::fs::write(output, b"mkv")?;
            Ok(())
        }
    }
}
