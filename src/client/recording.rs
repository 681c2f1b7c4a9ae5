//! Consumer-side recording.
//!
//! `RECORD_STARTED` opens a fresh temporary frame directory; every binary
//! frame that arrives while it is open is written as the next numbered JPEG.
//! `RECORD_STOPPED` corrects channel order, hands the directory to the video
//! encoder and cleans up.

use chrono::{DateTime, Local};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use super::color;
use super::encoder::VideoEncoder;
use crate::config::ClientConfig;
use crate::protocol::Notification;

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

#[derive(Debug, Clone)]
pub struct RecordingOptions {
    pub output_dir: PathBuf,
    pub frame_rate: u32,
    pub color_correction: bool,
    pub keep_frames_on_failure: bool,
}

impl From<&ClientConfig> for RecordingOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            frame_rate: config.frame_rate,
            color_correction: config.color_correction,
            keep_frames_on_failure: config.keep_frames_on_failure,
        }
    }
}

/// One open recording
#[derive(Debug)]
pub struct RecordingSession {
    dir: PathBuf,
    /// Latched by the first frame written after start
    first_frame_at: Option<DateTime<Local>>,
    frames: u64,
}

impl RecordingSession {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn first_frame_at(&self) -> Option<DateTime<Local>> {
        self.first_frame_at
    }

    fn frame_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("frame_{:08}.jpg", seq))
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finalized {
    /// No frames arrived; nothing was encoded
    Empty,
    Encoded { output: PathBuf, frames: u64 },
    /// `kept` names the frame directory when it was left on disk
    EncoderFailed { kept: Option<PathBuf> },
}

pub struct RecordingPipeline {
    options: RecordingOptions,
    encoder: Box<dyn VideoEncoder>,
    session: Option<RecordingSession>,
    frames_persisted: u64,
}

impl RecordingPipeline {
    pub fn new(options: RecordingOptions, encoder: Box<dyn VideoEncoder>) -> Self {
        Self {
            options,
            encoder,
            session: None,
            frames_persisted: 0,
        }
    }

    #[cfg(test)]
    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    /// Total frames written across every session
    pub fn frames_persisted(&self) -> u64 {
        self.frames_persisted
    }

    /// React to a server notification. Returns the finalisation result when
    /// the notification closed a session.
    pub async fn handle_notification(
        &mut self,
        notification: Notification,
    ) -> Result<Option<Finalized>, RecordingError> {
        match notification {
            Notification::RecordStarted => self.start().await,
            Notification::RecordStopped => self.finish().await,
            Notification::StreamStarted | Notification::StreamStopped => Ok(None),
        }
    }

    /// Open a fresh session. A session that is still open is finalized
    /// first and its result returned.
    pub async fn start(&mut self) -> Result<Option<Finalized>, RecordingError> {
        let previous = if self.session.is_some() {
            info!("RECORD_STARTED while already recording, closing current session first");
            self.finish().await?
        } else {
            None
        };

        let dir = create_session_dir(&self.options.output_dir).await?;
        info!(dir = %dir.display(), "Recording started");
        self.session = Some(RecordingSession {
            dir,
            first_frame_at: None,
            frames: 0,
        });
        Ok(previous)
    }

    /// Persist one frame if a session is open. Returns whether it was written.
    pub async fn handle_frame(&mut self, data: &[u8]) -> Result<bool, RecordingError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };

        if session.first_frame_at.is_none() {
            let now = Local::now();
            debug!(at = %now, "First frame of recording");
            session.first_frame_at = Some(now);
        }

        let path = session.frame_path(session.frames);
        tokio::fs::write(&path, data).await?;
        session.frames += 1;
        self.frames_persisted += 1;
        Ok(true)
    }

    /// Close the open session: correct colors, encode, clean up. A no-op
    /// returning `None` when nothing is being recorded.
    pub async fn finish(&mut self) -> Result<Option<Finalized>, RecordingError> {
        let Some(session) = self.session.take() else {
            info!("RECORD_STOPPED but not recording, ignoring");
            return Ok(None);
        };
        info!(dir = %session.dir.display(), frames = session.frames, "Recording stopped, finalizing");

        let (first_frame_at, frames) = match session.first_frame_at {
            Some(at) if session.frames > 0 => (at, session.frames),
            _ => {
                warn!("No frames to encode, skipping encoder");
                remove_dir(&session.dir).await;
                return Ok(Some(Finalized::Empty));
            }
        };

        if self.options.color_correction {
            correct_directory(session.dir.clone(), frames).await;
        }

        let output = self
            .options
            .output_dir
            .join(format!("VIDEO_{}.mkv", first_frame_at.format("%Y%m%d_%H%M%S")));

        match self
            .encoder
            .encode(&session.dir, self.options.frame_rate, &output)
            .await
        {
            Ok(()) => {
                info!(output = %output.display(), frames, "Video written");
                remove_dir(&session.dir).await;
                Ok(Some(Finalized::Encoded { output, frames }))
            }
            Err(e) => {
                error!(error = %e, "Encoder failed");
                if self.options.keep_frames_on_failure {
                    warn!(dir = %session.dir.display(), "Raw frames kept for manual recovery");
                    Ok(Some(Finalized::EncoderFailed {
                        kept: Some(session.dir),
                    }))
                } else {
                    remove_dir(&session.dir).await;
                    Ok(Some(Finalized::EncoderFailed { kept: None }))
                }
            }
        }
    }
}

/// Create `record_temp_<local time>` under `root`, adding a numeric suffix
/// if that name is taken.
async fn create_session_dir(root: &Path) -> Result<PathBuf, RecordingError> {
    tokio::fs::create_dir_all(root).await?;
    let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();

    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("record_temp_{}", stamp)
        } else {
            format!("record_temp_{}_{}", stamp, attempt)
        };
        let dir = root.join(name);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Rewrite every frame with red and blue swapped. Undecodable frames are
/// logged and left alone.
async fn correct_directory(dir: PathBuf, frames: u64) {
    let result = tokio::task::spawn_blocking(move || {
        let mut corrected = 0u64;
        for seq in 0..frames {
            let path = dir.join(format!("frame_{:08}.jpg", seq));
            match color::correct_file(&path) {
                Ok(()) => corrected += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Could not color-correct frame, skipping"),
            }
        }
        corrected
    })
    .await;

    match result {
        Ok(corrected) => info!(corrected, total = frames, "Color-corrected frames"),
        Err(e) => warn!(error = %e, "Color correction task failed"),
    }
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(dir = %dir.display(), error = %e, "Failed to remove frame directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::encoder::stub::StubEncoder;
    use image::codecs::jpeg::JpegEncoder;
    use image::{Rgb, RgbImage};

    fn options(root: &Path, color_correction: bool, keep: bool) -> RecordingOptions {
        RecordingOptions {
            output_dir: root.to_path_buf(),
            frame_rate: 30,
            color_correction,
            keep_frames_on_failure: keep,
        }
    }

    fn pipeline(root: &Path, encoder: &StubEncoder, color_correction: bool, keep: bool) -> RecordingPipeline {
        RecordingPipeline::new(options(root, color_correction, keep), Box::new(encoder.clone()))
    }

    fn jpeg(rgb: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(8, 8, Rgb(rgb));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, 100))
            .unwrap();
        buf.into_inner()
    }

    #[tokio::test]
    async fn test_frames_ignored_when_not_recording() {
        let root = tempfile::tempdir().unwrap();
        let encoder = StubEncoder::default();
        let mut pipeline = pipeline(root.path(), &encoder, false, true);

        assert!(!pipeline.handle_frame(b"frame").await.unwrap());
        assert_eq!(
            pipeline
                .handle_notification(Notification::RecordStopped)
                .await
                .unwrap(),
            None
        );
        assert!(encoder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_record_and_encode() {
        let root = tempfile::tempdir().unwrap();
        let encoder = StubEncoder::default();
        let mut pipeline = pipeline(root.path(), &encoder, true, true);

        pipeline
            .handle_notification(Notification::RecordStarted)
            .await
            .unwrap();
        let dir = pipeline.session().unwrap().dir().to_path_buf();
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("record_temp_"));
        assert!(pipeline.session().unwrap().first_frame_at().is_none());

        for shade in [10, 20, 30] {
            assert!(pipeline.handle_frame(&jpeg([shade, 0, 200])).await.unwrap());
        }
        let first = pipeline.session().unwrap().first_frame_at().unwrap();

        let result = pipeline
            .handle_notification(Notification::RecordStopped)
            .await
            .unwrap()
            .unwrap();

        let expected = root
            .path()
            .join(format!("VIDEO_{}.mkv", first.format("%Y%m%d_%H%M%S")));
        assert_eq!(
            result,
            Finalized::Encoded {
                output: expected.clone(),
                frames: 3
            }
        );

        let calls = encoder.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].frames_dir, dir);
        assert_eq!(calls[0].frame_rate, 30);
        assert_eq!(calls[0].output, expected);
        assert_eq!(
            calls[0].files,
            vec!["frame_00000000.jpg", "frame_00000001.jpg", "frame_00000002.jpg"]
        );

        assert!(expected.exists());
        assert!(!dir.exists());
        assert!(!pipeline.is_recording());
        assert_eq!(pipeline.frames_persisted(), 3);
    }

    #[tokio::test]
    async fn test_color_correction_applied_before_encode() {
        let root = tempfile::tempdir().unwrap();
        let encoder = StubEncoder::failing();
        let mut pipeline = pipeline(root.path(), &encoder, true, true);

        pipeline.start().await.unwrap();
        pipeline.handle_frame(&jpeg([0, 0, 230])).await.unwrap();
        let result = pipeline.finish().await.unwrap().unwrap();

        let Finalized::EncoderFailed { kept: Some(dir) } = result else {
            panic!("expected kept frames, got {:?}", result);
        };
        let img = image::open(dir.join("frame_00000000.jpg")).unwrap().to_rgb8();
        let p = img.get_pixel(4, 4).0;
        assert!(p[0] > 190 && p[2] < 40, "pixel {:?}", p);
    }

    #[tokio::test]
    async fn test_empty_session_skips_encoder() {
        let root = tempfile::tempdir().unwrap();
        let encoder = StubEncoder::default();
        let mut pipeline = pipeline(root.path(), &encoder, true, true);

        pipeline.start().await.unwrap();
        let dir = pipeline.session().unwrap().dir().to_path_buf();
        let result = pipeline.finish().await.unwrap();

        assert_eq!(result, Some(Finalized::Empty));
        assert!(encoder.calls().is_empty());
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_encoder_failure_discards_frames_when_configured() {
        let root = tempfile::tempdir().unwrap();
        let encoder = StubEncoder::failing();
        let mut pipeline = pipeline(root.path(), &encoder, false, false);

        pipeline.start().await.unwrap();
        let dir = pipeline.session().unwrap().dir().to_path_buf();
        pipeline.handle_frame(b"raw").await.unwrap();

        let result = pipeline.finish().await.unwrap();
        assert_eq!(result, Some(Finalized::EncoderFailed { kept: None }));
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_repeated_start_finalizes_previous_session() {
        let root = tempfile::tempdir().unwrap();
        let encoder = StubEncoder::default();
        let mut pipeline = pipeline(root.path(), &encoder, false, true);

        assert_eq!(pipeline.start().await.unwrap(), None);
        pipeline.handle_frame(b"a").await.unwrap();
        let first_dir = pipeline.session().unwrap().dir().to_path_buf();
        let first_at = pipeline.session().unwrap().first_frame_at().unwrap();

        let previous = pipeline
            .handle_notification(Notification::RecordStarted)
            .await
            .unwrap();
        let expected = root
            .path()
            .join(format!("VIDEO_{}.mkv", first_at.format("%Y%m%d_%H%M%S")));
        assert_eq!(
            previous,
            Some(Finalized::Encoded {
                output: expected,
                frames: 1
            })
        );
        assert!(!first_dir.exists());

        let session = pipeline.session().unwrap();
        assert_ne!(session.dir(), first_dir.as_path());
        assert!(session.first_frame_at().is_none());
        assert_eq!(session.frames(), 0);

        pipeline.handle_frame(b"b").await.unwrap();
        pipeline.finish().await.unwrap();

        let calls = encoder.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].files, vec!["frame_00000000.jpg"]);
        assert_eq!(calls[1].files, vec!["frame_00000000.jpg"]);
        assert_ne!(calls[0].frames_dir, calls[1].frames_dir);
    }

    #[tokio::test]
    async fn test_session_dirs_are_unique() {
        let root = tempfile::tempdir().unwrap();
        let a = create_session_dir(root.path()).await.unwrap();
        let b = create_session_dir(root.path()).await.unwrap();
        assert_ne!(a, b);
        assert!(a.is_dir() && b.is_dir());
    }

    #[tokio::test]
    async fn test_stream_notifications_ignored() {
        let root = tempfile::tempdir().unwrap();
        let encoder = StubEncoder::default();
        let mut pipeline = pipeline(root.path(), &encoder, false, true);
        pipeline.start().await.unwrap();

        assert_eq!(
            pipeline
                .handle_notification(Notification::StreamStopped)
                .await
                .unwrap(),
            None
        );
        assert!(pipeline.is_recording());
    }
}
