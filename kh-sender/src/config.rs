//! Configuration for the sender.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kh_core::stream::{Calibration, StreamServiceConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Pacing, FEC and session timing.
    pub stream: StreamConfig,
    /// Depth and color codec settings.
    pub codec: CodecConfig,
    /// Synthetic camera settings.
    pub camera: CameraConfig,
    /// Audio settings.
    pub audio: AudioConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port offered at the prompt.
    pub port: u16,
}

/// Stream timing and protection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Nominal frame rate used for pacing.
    pub frame_rate: f64,
    /// Data packets per XOR parity packet.
    pub fec_group_size: usize,
    /// Receiver lag beyond which every frame is a keyframe.
    pub keyframe_lag: i64,
    /// Init packet repeat interval until the first ack.
    pub init_interval_ms: u64,
    /// Interval between summary log lines.
    pub summary_interval_secs: u64,
}

/// Codec tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Depth changes at or below this many millimetres are ignored.
    pub change_threshold: i16,
    /// Zero readings in a row before a depth pixel is invalidated.
    pub invalid_threshold: u32,
    /// zstd level of the color codec.
    pub color_level: i32,
}

/// Synthetic camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub color_width: u32,
    pub color_height: u32,
    pub depth_width: u32,
    pub depth_height: u32,
    /// Capture rate of the camera itself.
    pub capture_rate: f64,
    /// Seed of the sensor noise generator.
    pub seed: u64,
    /// Per-pixel depth noise amplitude in millimetres.
    pub jitter_mm: i16,
    /// Probability of a single-frame depth dropout per pixel.
    pub dropout_rate: f64,
}

/// Audio configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Stream a test tone alongside video.
    pub enabled: bool,
    /// Tone frequency in Hz.
    pub tone_hz: f32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { port: 7777 }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30.0,
            fec_group_size: 5,
            keyframe_lag: 5,
            init_interval_ms: 100,
            summary_interval_secs: 10,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            change_threshold: 10,
            invalid_threshold: 2,
            color_level: 1,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        let calibration = Calibration::default();
        Self {
            color_width: calibration.color_width,
            color_height: calibration.color_height,
            depth_width: calibration.depth_width,
            depth_height: calibration.depth_height,
            capture_rate: 30.0,
            seed: 0,
            jitter_mm: 4,
            dropout_rate: 0.002,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tone_hz: 440.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl SenderConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Resolutions announced to the receiver.
    pub fn calibration(&self) -> Calibration {
        Calibration {
            color_width: self.camera.color_width.max(1),
            color_height: self.camera.color_height.max(1),
            depth_width: self.camera.depth_width.max(1),
            depth_height: self.camera.depth_height.max(1),
        }
    }

    /// Convert stream and codec settings into a `StreamServiceConfig`.
    pub fn to_service_config(&self) -> StreamServiceConfig {
        StreamServiceConfig {
            frame_rate: self.stream.frame_rate.clamp(1.0, 120.0),
            keyframe_lag: self.stream.keyframe_lag.max(0),
            change_threshold: self.codec.change_threshold.max(0),
            invalid_threshold: self.codec.invalid_threshold.max(1),
            fec_group_size: self.stream.fec_group_size.clamp(1, 64),
            init_interval: Duration::from_millis(self.stream.init_interval_ms.max(1)),
            summary_interval: Duration::from_secs(self.stream.summary_interval_secs.max(1)),
            ..StreamServiceConfig::default()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
