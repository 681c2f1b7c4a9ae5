use std::time::{Duration, Instant};

use super::{Camera, CaptureError, Frame};

/// Synthetic camera producing a scrolling BGR gradient at a nominal sensor
/// rate. Used when no hardware is attached.
pub struct TestPattern {
    width: u32,
    height: u32,
    interval: Duration,
    next_due: Option<Instant>,
    tick: u32,
}

impl TestPattern {
    pub fn new(width: u32, height: u32, sensor_fps: u32) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::Device(format!(
                "invalid test pattern size {}x{}",
                width, height
            )));
        }
        Ok(Self {
            width,
            height,
            interval: Duration::from_secs_f64(1.0 / sensor_fps.max(1) as f64),
            next_due: None,
            tick: 0,
        })
    }

    fn render(&self) -> Vec<u8> {
        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        let (width, height) = (self.width as u64, self.height as u64);
        let offset = self.tick.wrapping_mul(4) as u64 % width;
        let r = (self.tick % 256) as u8;
        for y in 0..height {
            let g = (y * 255 / height) as u8;
            for x in 0..width {
                let b = ((x + offset) % width * 255 / width) as u8;
                pixels.extend_from_slice(&[b, g, r]);
            }
        }
        pixels
    }
}

impl Camera for TestPattern {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_due = Some(Instant::now() + self.interval);

        let frame = Frame::new(self.width, self.height, self.render());
        self.tick = self.tick.wrapping_add(1);
        Ok(frame)
    }
}
