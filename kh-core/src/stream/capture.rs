//! Camera capture seam.
//!
//! [`DepthCamera`] is what the sender's capture task pulls frames from.
//! [`SyntheticCamera`] renders a moving scene with realistic sensor
//! artefacts (per-pixel jitter, single-frame dropouts, a permanently
//! invalid border) so the pipeline can run without hardware.

use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec::color::YuvImage;
use crate::error::KhError;
use crate::stream::types::{Calibration, CapturedFrame};

/// A source of synchronized color + depth frames.
pub trait DepthCamera: Send {
    /// Resolutions announced to the receiver.
    fn calibration(&self) -> Calibration;

    /// Block until the next frame. `Ok(None)` means the device had no
    /// frame in time and the caller should simply try again.
    fn capture(&mut self) -> Result<Option<CapturedFrame>, KhError>;
}

// ── SyntheticCamera ──────────────────────────────────────────────

/// Background plane distance in millimetres.
const BACKGROUND_MM: i16 = 2500;
/// Distance of the moving disc.
const OBJECT_MM: i16 = 1200;
/// Columns on the left edge that never return depth.
const SHADOW_COLUMNS: u32 = 8;

/// Deterministic stand-in for a depth camera.
pub struct SyntheticCamera {
    calibration: Calibration,
    frame_interval: Duration,
    next_capture: Instant,
    tick: u64,
    rng: StdRng,
    jitter_mm: i16,
    dropout_rate: f64,
}

impl SyntheticCamera {
    pub fn new(calibration: Calibration, frame_rate: f64, seed: u64) -> Self {
        Self {
            calibration,
            frame_interval: Duration::from_secs_f64(1.0 / frame_rate.max(1.0)),
            next_capture: Instant::now(),
            tick: 0,
            rng: StdRng::seed_from_u64(seed),
            jitter_mm: 4,
            dropout_rate: 0.002,
        }
    }

    /// Sensor noise amplitude and per-pixel dropout probability.
    pub fn with_noise(mut self, jitter_mm: i16, dropout_rate: f64) -> Self {
        self.jitter_mm = jitter_mm.max(0);
        self.dropout_rate = dropout_rate.clamp(0.0, 1.0);
        self
    }

    /// Render the frame for the current tick without waiting.
    pub fn render(&mut self) -> CapturedFrame {
        let frame = CapturedFrame {
            depth: self.render_depth(),
            color: self.render_color(),
            captured_at: Instant::now(),
        };
        self.tick += 1;
        frame
    }

    // ── Internal ─────────────────────────────────────────────────

    fn render_depth(&mut self) -> Vec<i16> {
        let Calibration {
            depth_width: width,
            depth_height: height,
            ..
        } = self.calibration;
        let radius = (height / 6).max(1) as i64;
        let cx = (self.tick * 4 % u64::from(width.max(1))) as i64;
        let cy = i64::from(height / 2);

        let mut depth = Vec::with_capacity(self.calibration.depth_pixels());
        for y in 0..height {
            for x in 0..width {
                if x < SHADOW_COLUMNS {
                    depth.push(0);
                    continue;
                }
                if self.dropout_rate > 0.0 && self.rng.random_bool(self.dropout_rate) {
                    depth.push(0);
                    continue;
                }
                let (dx, dy) = (i64::from(x) - cx, i64::from(y) - cy);
                let base = if dx * dx + dy * dy <= radius * radius {
                    OBJECT_MM
                } else {
                    BACKGROUND_MM.saturating_add(i16::try_from(y / 4).unwrap_or(i16::MAX))
                };
                let noise = if self.jitter_mm > 0 {
                    self.rng.random_range(-self.jitter_mm..=self.jitter_mm)
                } else {
                    0
                };
                // Valid readings stay positive whatever the noise.
                depth.push(base.saturating_add(noise).max(1));
            }
        }
        depth
    }

    fn render_color(&self) -> YuvImage {
        let Calibration {
            color_width: width,
            color_height: height,
            ..
        } = self.calibration;
        let mut image = YuvImage::blank(width, height);
        let shift = self.tick as usize;
        for (i, luma) in image.y.iter_mut().enumerate() {
            let (x, y) = (i % width.max(1) as usize, i / width.max(1) as usize);
            *luma = ((x + y + shift) & 0xff) as u8;
        }
        image
    }
}

impl DepthCamera for SyntheticCamera {
    fn calibration(&self) -> Calibration {
        self.calibration
    }

    fn capture(&mut self) -> Result<Option<CapturedFrame>, KhError> {
        let now = Instant::now();
        if now < self.next_capture {
            std::thread::sleep(self.next_capture - now);
        }
        self.next_capture += self.frame_interval;
        // Fell more than a frame behind: realign instead of bursting.
        if self.next_capture < Instant::now() {
            self.next_capture = Instant::now() + self.frame_interval;
        }
        Ok(Some(self.render()))
    }
}

// ── Tests ────────────────────────────────────────────────────────
