//! Error types for the depth streaming pipeline.
//!
//! Fallible operations return `Result<T, KhError>`. Malformed input
//! from the network is always a typed error, never a panic.
//!
//! Non-blocking socket reads use `Result<Option<T>, KhError>`: a
//! would-block is `Ok(None)`, anything in [`KhError::Transport`] is
//! fatal for the current session.

use thiserror::Error;

/// The canonical error type for `kh-core`.
#[derive(Debug, Error)]
pub enum KhError {
    // ── Packet Errors ────────────────────────────────────────────
    /// A datagram was shorter than its fixed header requires.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A packet header carried inconsistent fields.
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    // ── Message Errors ───────────────────────────────────────────
    /// A reassembled frame message could not be parsed.
    #[error("invalid frame message: {0}")]
    InvalidMessage(&'static str),

    /// The leading size field disagrees with the buffer.
    #[error("message size mismatch: declared {declared} bytes, buffer holds {actual}")]
    MessageSizeMismatch { declared: usize, actual: usize },

    // ── Codec Errors ─────────────────────────────────────────────
    /// A depth buffer did not match the size the codec was built for.
    #[error("frame size mismatch: codec expects {expected} pixels, got {actual}")]
    FrameSizeMismatch { expected: usize, actual: usize },

    /// Compressed data could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    // ── Transport Errors ─────────────────────────────────────────
    /// The UDP socket reported a non-transient error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    // ── Application Errors ───────────────────────────────────────
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl KhError {
    /// Whether the error originates from bad peer input rather than
    /// local I/O. Such errors only cost the offending datagram.
    pub fn is_malformed_input(&self) -> bool {
        matches!(
            self,
            KhError::PacketTooShort { .. }
                | KhError::UnknownVariant { .. }
                | KhError::InvalidPacket(_)
                | KhError::InvalidMessage(_)
                | KhError::MessageSizeMismatch { .. }
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for KhError {
    fn from(s: String) -> Self {
        KhError::Other(s)
    }
}

impl From<&str> for KhError {
    fn from(s: &str) -> Self {
        KhError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = KhError::PacketTooShort {
            expected: 17,
            actual: 3,
        };
        assert!(e.to_string().contains("17"));
        assert!(e.to_string().contains('3'));

        let e = KhError::FrameSizeMismatch {
            expected: 4,
            actual: 9,
        };
        assert!(e.to_string().contains("pixels"));
    }

    #[test]
    fn from_string() {
        let e: KhError = "something broke".into();
        assert!(matches!(e, KhError::Other(_)));
    }

    #[test]
    fn from_io_is_transport() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let e: KhError = io_err.into();
        assert!(matches!(e, KhError::Transport(_)));
        assert!(!e.is_malformed_input());
    }

    #[test]
    fn malformed_input_classification() {
        assert!(KhError::InvalidPacket("bad index").is_malformed_input());
        assert!(
            KhError::UnknownVariant {
                type_name: "PacketType",
                value: 9
            }
            .is_malformed_input()
        );
        assert!(!KhError::Config("fec_group_size".into()).is_malformed_input());
    }
}
