//! Shared frame types used across the streaming pipeline.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::codec::color::YuvImage;

/// Camera resolutions announced to the receiver at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calibration {
    pub color_width: u32,
    pub color_height: u32,
    pub depth_width: u32,
    pub depth_height: u32,
}

impl Calibration {
    /// Pixels per depth frame.
    pub fn depth_pixels(&self) -> usize {
        self.depth_width as usize * self.depth_height as usize
    }
}

impl Default for Calibration {
    /// Azure Kinect NFOV unbinned depth with color mapped onto it.
    fn default() -> Self {
        Self {
            color_width: 640,
            color_height: 576,
            depth_width: 640,
            depth_height: 576,
        }
    }
}

/// One raw capture from the camera.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub color: YuvImage,
    /// Depth in millimetres, row-major; 0 marks an invalid pixel.
    pub depth: Vec<i16>,
    pub captured_at: Instant,
}

/// A frame after reassembly and decoding on the receiver.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub frame_id: u32,
    pub timestamp_ms: f32,
    pub keyframe: bool,
    pub color: YuvImage,
    pub depth: Vec<i16>,
    pub depth_width: u32,
    pub depth_height: u32,
}
