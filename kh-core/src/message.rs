//! Frame message framing.
//!
//! One captured frame becomes one self-describing byte buffer before it
//! is fragmented into packets. All integers are little-endian.
//!
//! ```text
//! message_size:  i32  (4)   total length, this field included
//! message_type:  u8   (1)   0 = video
//! frame_id:      i32  (4)
//! timestamp_ms:  f32  (4)   milliseconds since session start
//! flags:         u8   (1)   bit 0 = keyframe
//! color_size:    i32  (4)
//! color:         [u8] (color_size)
//! depth_size:    i32  (4)
//! depth:         [u8] (depth_size)
//! ```
//!
//! Bytes past `message_size` are ignored on decode, so a buffer that
//! picked up zero padding during reassembly still parses.

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use std::fmt;

use crate::error::KhError;

bitflags! {
    /// Per-message flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u8 {
        /// Decodable without any previous frame.
        const KEYFRAME = 0b0000_0001;
    }
}

// ── MessageType ──────────────────────────────────────────────────

/// Kind of frame message. Only video exists today; the byte keeps the
/// layout open for other payloads.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Video = 0,
}

impl TryFrom<u8> for MessageType {
    type Error = KhError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Video),
            _ => Err(KhError::UnknownVariant {
                type_name: "MessageType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Video => write!(f, "Video"),
        }
    }
}

// ── FrameMessage ─────────────────────────────────────────────────

/// One frame's metadata and compressed payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameMessage {
    pub frame_id: u32,
    pub timestamp_ms: f32,
    pub keyframe: bool,
    pub color: Vec<u8>,
    pub depth: Vec<u8>,
}

impl FrameMessage {
    /// Bytes of framing around the two payloads.
    pub const OVERHEAD: usize = 4 + 1 + 4 + 4 + 1 + 4 + 4;

    pub fn new(
        frame_id: u32,
        timestamp_ms: f32,
        keyframe: bool,
        color: Vec<u8>,
        depth: Vec<u8>,
    ) -> Self {
        Self {
            frame_id,
            timestamp_ms,
            keyframe,
            color,
            depth,
        }
    }

    /// Total encoded length, equal to the `message_size` field.
    pub fn message_size(&self) -> usize {
        Self::OVERHEAD + self.color.len() + self.depth.len()
    }

    pub fn flags(&self) -> MessageFlags {
        if self.keyframe {
            MessageFlags::KEYFRAME
        } else {
            MessageFlags::empty()
        }
    }

    /// Serialize to a message buffer.
    pub fn encode(&self) -> Vec<u8> {
        let size = self.message_size();
        let mut buf = Vec::with_capacity(size);
        buf.put_i32_le(size as i32);
        buf.put_u8(MessageType::Video as u8);
        buf.put_i32_le(self.frame_id as i32);
        buf.put_f32_le(self.timestamp_ms);
        buf.put_u8(self.flags().bits());
        buf.put_i32_le(self.color.len() as i32);
        buf.put_slice(&self.color);
        buf.put_i32_le(self.depth.len() as i32);
        buf.put_slice(&self.depth);
        buf
    }

    /// Parse a message buffer, validating every length field.
    pub fn decode(data: &[u8]) -> Result<Self, KhError> {
        if data.len() < Self::OVERHEAD {
            return Err(KhError::MessageSizeMismatch {
                declared: Self::OVERHEAD,
                actual: data.len(),
            });
        }

        let mut buf = data;
        let declared = buf.get_i32_le();
        let declared = usize::try_from(declared)
            .ok()
            .filter(|&size| size >= Self::OVERHEAD)
            .ok_or(KhError::InvalidMessage("message_size below framing overhead"))?;
        if declared > data.len() {
            return Err(KhError::MessageSizeMismatch {
                declared,
                actual: data.len(),
            });
        }
        let mut buf = &data[4..declared];

        MessageType::try_from(buf.get_u8())?;
        let frame_id = buf.get_i32_le();
        let frame_id =
            u32::try_from(frame_id).map_err(|_| KhError::InvalidMessage("negative frame id"))?;
        let timestamp_ms = buf.get_f32_le();
        let flags = MessageFlags::from_bits_truncate(buf.get_u8());
        let color = take_payload(&mut buf)?;
        let depth = take_payload(&mut buf)?;
        if buf.has_remaining() {
            return Err(KhError::InvalidMessage("payload sizes do not add up"));
        }

        Ok(Self {
            frame_id,
            timestamp_ms,
            keyframe: flags.contains(MessageFlags::KEYFRAME),
            color,
            depth,
        })
    }
}

// ── Internal ─────────────────────────────────────────────────────

fn take_payload(buf: &mut &[u8]) -> Result<Vec<u8>, KhError> {
    if buf.remaining() < 4 {
        return Err(KhError::InvalidMessage("missing payload size"));
    }
    let size = usize::try_from(buf.get_i32_le())
        .map_err(|_| KhError::InvalidMessage("negative payload size"))?;
    if size > buf.remaining() {
        return Err(KhError::InvalidMessage("payload runs past message end"));
    }
    let (payload, rest) = buf.split_at(size);
    *buf = rest;
    Ok(payload.to_vec())
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FrameMessage {
        FrameMessage::new(7, 233.5, true, vec![1, 2, 3], vec![9; 10])
    }

    #[test]
    fn roundtrip() {
        let msg = sample();
        let bytes = msg.encode();
        assert_eq!(bytes.len(), msg.message_size());
        assert_eq!(FrameMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn size_field_leads() {
        let bytes = sample().encode();
        let size = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!(size as usize, bytes.len());
        assert_eq!(bytes[4], MessageType::Video as u8);
        assert_eq!(bytes[13], MessageFlags::KEYFRAME.bits());
    }

    #[test]
    fn empty_payloads() {
        let msg = FrameMessage::new(0, 0.0, false, Vec::new(), Vec::new());
        let bytes = msg.encode();
        assert_eq!(bytes.len(), FrameMessage::OVERHEAD);
        assert_eq!(FrameMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn trailing_padding_ignored() {
        let mut bytes = sample().encode();
        bytes.extend_from_slice(&[0; 32]);
        assert_eq!(FrameMessage::decode(&bytes).unwrap(), sample());
    }

    #[test]
    fn truncated_buffer_rejected() {
        let bytes = sample().encode();
        let err = FrameMessage::decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, KhError::MessageSizeMismatch { .. }));
        assert!(FrameMessage::decode(&bytes[..5]).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let mut bytes = sample().encode();
        bytes[4] = 0x7f;
        assert!(matches!(
            FrameMessage::decode(&bytes),
            Err(KhError::UnknownVariant { .. })
        ));
    }

    #[test]
    fn inconsistent_payload_size_rejected() {
        let mut bytes = sample().encode();
        // Claim a color payload larger than the message.
        bytes[14..18].copy_from_slice(&1000i32.to_le_bytes());
        assert!(matches!(
            FrameMessage::decode(&bytes),
            Err(KhError::InvalidMessage(_))
        ));

        let mut bytes = sample().encode();
        bytes[14..18].copy_from_slice(&1i32.to_le_bytes());
        assert!(FrameMessage::decode(&bytes).is_err());
    }

    #[test]
    fn message_type_display() {
        assert_eq!(MessageType::Video.to_string(), "Video");
        assert!(MessageType::try_from(3).is_err());
    }
}
