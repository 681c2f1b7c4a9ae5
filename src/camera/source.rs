//! Capture thread.
//!
//! Owns the camera exclusively and runs outside the async scheduler. Each
//! captured frame overwrites the shared [`LatestFrame`]; a capture fault closes
//! the device, waits out a fixed backoff and reopens it, forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Camera, CameraFactory, LatestFrame};

/// Granularity at which sleeps notice a stop request
const STOP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Cap on capture rate; `None` captures as fast as the device delivers
    pub fps_limit: Option<u32>,
    /// Pause between a capture fault and reopening the device
    pub backoff: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps_limit: None,
            backoff: Duration::from_secs(2),
        }
    }
}

pub struct FrameSource {
    running: Arc<AtomicBool>,
    cell: Arc<LatestFrame>,
    thread: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Spawn the capture thread. The camera is opened on that thread.
    pub fn start(opener: CameraFactory, config: CaptureConfig) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let cell = Arc::new(LatestFrame::new());

        let running_clone = running.clone();
        let cell_clone = cell.clone();
        let thread = std::thread::Builder::new()
            .name("camlink-capture".to_string())
            .spawn(move || capture_loop(opener, config, cell_clone, running_clone))?;

        Ok(Self {
            running,
            cell,
            thread: Some(thread),
        })
    }

    pub fn cell(&self) -> Arc<LatestFrame> {
        self.cell.clone()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// Stop and wait for the thread to release the camera.
    pub fn join(mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut opener: CameraFactory,
    config: CaptureConfig,
    cell: Arc<LatestFrame>,
    running: Arc<AtomicBool>,
) {
    let frame_interval = config
        .fps_limit
        .filter(|fps| *fps > 0)
        .map(|fps| Duration::from_secs_f64(1.0 / fps as f64));
    let mut camera: Option<Box<dyn Camera>> = None;

    while running.load(Ordering::Relaxed) {
        if camera.is_none() {
            match opener() {
                Ok(opened) => {
                    info!("Camera opened");
                    camera = Some(opened);
                }
                Err(e) => {
                    warn!(error = %e, "Camera reconfiguration failed, retrying");
                    pause(config.backoff, &running);
                    continue;
                }
            }
        }
        let Some(cam) = camera.as_mut() else {
            continue;
        };

        let frame_start = Instant::now();

        match cam.capture() {
            Ok(frame) => cell.publish(frame),
            Err(e) => {
                warn!(
                    error = %e,
                    backoff_ms = config.backoff.as_millis() as u64,
                    "Capture failed, reopening camera"
                );
                cam.close();
                camera = None;
                pause(config.backoff, &running);
                continue;
            }
        }

        if let Some(interval) = frame_interval {
            let elapsed = frame_start.elapsed();
            if elapsed < interval {
                pause(interval - elapsed, &running);
            }
        }
    }

    if let Some(mut cam) = camera {
        cam.close();
    }
    debug!(frames = cell.published(), "Capture thread exiting");
}

/// Sleep for `duration`, returning early once `running` is cleared.
fn pause(duration: Duration, running: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(STOP_POLL));
    }
}
