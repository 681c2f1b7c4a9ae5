//! Producer-side frame acquisition.
//!
//! A [`Camera`] is the hardware collaborator: it blocks until one frame is
//! available. [`source::FrameSource`] drives it from a dedicated thread and
//! publishes into a [`LatestFrame`] cell, which the network side reads by copy.

pub mod source;
pub mod test_pattern;

use anyhow::Result;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, RgbImage};
use parking_lot::Mutex;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};

pub use source::{CaptureConfig, FrameSource};
pub use test_pattern::TestPattern;

/// One captured frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Three bytes per pixel, rows packed, in the sensor's channel order.
    /// The Pi sensor path delivers BGR; nothing on the producer reorders it.
    pub pixels: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
            captured_at: Utc::now(),
        }
    }

    /// JPEG-encode the pixel buffer as-is.
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut buf = Cursor::new(Vec::new());
        let encoder = JpegEncoder::new_with_quality(&mut buf, quality);

        let img: RgbImage = ImageBuffer::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow::anyhow!("Invalid frame dimensions {}x{}", self.width, self.height))?;

        img.write_with_encoder(encoder)
            .map_err(|e| anyhow::anyhow!("JPEG encode failed: {}", e))?;

        Ok(buf.into_inner())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture device error: {0}")]
    Device(String),
}

/// Hardware collaborator. `capture` blocks until a frame is ready.
pub trait Camera: Send {
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Release the device. Called before every reopen and on shutdown.
    fn close(&mut self) {}
}

/// Opens (or reopens after a fault) the capture device.
pub type CameraFactory = Box<dyn FnMut() -> Result<Box<dyn Camera>, CaptureError> + Send>;

/// Single-slot, last-write-wins frame cell shared between the capture thread
/// and the broadcast loop. Never queues: readers only ever see the newest frame.
#[derive(Default)]
pub struct LatestFrame {
    slot: Mutex<Option<Frame>>,
    published: AtomicU64,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, frame: Frame) {
        *self.slot.lock() = Some(frame);
        self.published.fetch_add(1, Ordering::Release);
    }

    /// Independent copy of the newest frame, or `None` before the first capture.
    pub fn latest(&self) -> Option<Frame> {
        self.slot.lock().clone()
    }

    /// Number of frames published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }
}
