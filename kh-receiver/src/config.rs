//! Receiver configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kh_core::stream::{StallPolicy, StreamClientConfig};

/// Top-level configuration for the receiver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Frame delivery behaviour.
    pub delivery: DeliveryConfig,
    /// Console viewer.
    pub viewer: ViewerConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Sender IP offered at the prompt.
    pub address: String,
    /// Sender port offered at the prompt.
    pub port: u16,
    /// Longest idle wait of the receive loop.
    pub poll_interval_ms: u64,
    /// Ping repeat interval while no init has arrived.
    pub ping_interval_ms: u64,
}

/// What to do about frames that can never complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StallMode {
    /// Wait for the missing frame forever.
    Block,
    /// Jump to the next buffered keyframe after `stall_timeout_ms`.
    SkipToKeyframe,
}

/// Delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub stall_policy: StallMode,
    /// Stall duration before skipping, for `skip-to-keyframe`.
    pub stall_timeout_ms: u64,
}

/// Console viewer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Interval between frame reports.
    pub report_interval_secs: u64,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".into(),
            port: 7777,
            poll_interval_ms: 10,
            ping_interval_ms: 1000,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            stall_policy: StallMode::SkipToKeyframe,
            stall_timeout_ms: 1000,
        }
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 1,
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

impl ReceiverConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Write the default configuration to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    pub fn stall_policy(&self) -> StallPolicy {
        match self.delivery.stall_policy {
            StallMode::Block => StallPolicy::Block,
            StallMode::SkipToKeyframe => StallPolicy::SkipToKeyframe {
                timeout: Duration::from_millis(self.delivery.stall_timeout_ms),
            },
        }
    }

    /// Convert into a `StreamClientConfig`.
    pub fn to_client_config(&self) -> StreamClientConfig {
        StreamClientConfig {
            poll_interval: Duration::from_millis(self.network.poll_interval_ms.clamp(1, 1000)),
            ping_interval: Duration::from_millis(self.network.ping_interval_ms.max(10)),
            stall_policy: self.stall_policy(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = ReceiverConfig::default();
        assert_eq!(cfg.network.address, "127.0.0.1");
        assert_eq!(cfg.network.port, 7777);
        assert_eq!(cfg.stall_policy(), StallPolicy::default());
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&ReceiverConfig::default()).unwrap();
        assert!(text.contains("stall_policy = \"skip-to-keyframe\""));
        let parsed: ReceiverConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.delivery.stall_timeout_ms, 1000);
    }

    #[test]
    fn block_policy_from_toml() {
        let parsed: ReceiverConfig =
            toml::from_str("[delivery]\nstall_policy = \"block\"\n").unwrap();
        assert_eq!(parsed.stall_policy(), StallPolicy::Block);
        assert_eq!(parsed.network.port, 7777);
    }

    #[test]
    fn to_client_config_clamps() {
        let mut cfg = ReceiverConfig::default();
        cfg.network.poll_interval_ms = 0;
        let client = cfg.to_client_config();
        assert_eq!(client.poll_interval, Duration::from_millis(1));
        assert_eq!(client.ping_interval, Duration::from_secs(1));
    }
}
