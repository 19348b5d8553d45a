//! Wire packets.
//!
//! Every sender datagram starts with a 5-byte prefix so a receiver can
//! drop traffic from a previous session before looking any further:
//!
//! ```text
//! packet_type:  u8   (1)
//! session_id:   u32  (4)
//! ```
//!
//! followed by, per type (all little-endian):
//!
//! ```text
//! init   (0)  color_width i32 | color_height i32 | depth_width i32
//!             | depth_height i32 | fec_group_size i32
//! video  (2)  frame_id i32 | packet_index i32 | packet_count i32 | payload
//! parity (3)  frame_id i32 | group_index i32 | packet_count i32
//!             | length_recovery i32 | payload
//! audio  (4)  frame_id i32 | payload
//! ```
//!
//! The receiver answers with a 1-byte ping (`0`) to open the path and
//! 5-byte acks (`1 | frame_id i32`).

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::KhError;
use crate::stream::types::Calibration;

// ── Constants ────────────────────────────────────────────────────

/// Datagram size budget.
pub const MTU: usize = 1500;

/// `packet_type` + `session_id`.
pub const PREFIX_SIZE: usize = 5;

pub const INIT_PACKET_SIZE: usize = PREFIX_SIZE + 20;
pub const VIDEO_HEADER_SIZE: usize = PREFIX_SIZE + 12;
pub const PARITY_HEADER_SIZE: usize = PREFIX_SIZE + 16;
pub const AUDIO_HEADER_SIZE: usize = PREFIX_SIZE + 4;

/// Largest payload that fits every packet kind within [`MTU`]. Parity
/// packets carry the largest header.
pub const MAX_PAYLOAD_SIZE: usize = MTU - PARITY_HEADER_SIZE;

pub const PING_PACKET_SIZE: usize = 1;
pub const ACK_PACKET_SIZE: usize = 5;

// ── PacketType ───────────────────────────────────────────────────

/// Discriminant of a sender → receiver datagram.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Init = 0,
    Video = 2,
    Parity = 3,
    Audio = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = KhError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::Init),
            2 => Ok(PacketType::Video),
            3 => Ok(PacketType::Parity),
            4 => Ok(PacketType::Audio),
            _ => Err(KhError::UnknownVariant {
                type_name: "PacketType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Init => write!(f, "Init"),
            PacketType::Video => write!(f, "Video"),
            PacketType::Parity => write!(f, "Parity"),
            PacketType::Audio => write!(f, "Audio"),
        }
    }
}

// ── Sender packets ───────────────────────────────────────────────

/// Session announcement; sizes the receiver's codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitPacket {
    pub session_id: u32,
    pub calibration: Calibration,
    pub fec_group_size: u32,
}

/// One fragment of a frame message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPacket {
    pub session_id: u32,
    pub frame_id: u32,
    pub packet_index: u32,
    pub packet_count: u32,
    pub payload: Bytes,
}

/// XOR of one FEC group's video payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParityPacket {
    pub session_id: u32,
    pub frame_id: u32,
    pub group_index: u32,
    pub packet_count: u32,
    /// XOR of the payload lengths of the group's video packets.
    pub length_recovery: u32,
    pub payload: Bytes,
}

/// One opaque encoded audio frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub session_id: u32,
    pub frame_id: u32,
    pub payload: Bytes,
}

/// Any datagram the sender emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderPacket {
    Init(InitPacket),
    Video(VideoPacket),
    Parity(ParityPacket),
    Audio(AudioPacket),
}

impl SenderPacket {
    pub fn packet_type(&self) -> PacketType {
        match self {
            SenderPacket::Init(_) => PacketType::Init,
            SenderPacket::Video(_) => PacketType::Video,
            SenderPacket::Parity(_) => PacketType::Parity,
            SenderPacket::Audio(_) => PacketType::Audio,
        }
    }

    pub fn session_id(&self) -> u32 {
        match self {
            SenderPacket::Init(p) => p.session_id,
            SenderPacket::Video(p) => p.session_id,
            SenderPacket::Parity(p) => p.session_id,
            SenderPacket::Audio(p) => p.session_id,
        }
    }

    /// Size of the encoded datagram.
    pub fn wire_size(&self) -> usize {
        match self {
            SenderPacket::Init(_) => INIT_PACKET_SIZE,
            SenderPacket::Video(p) => VIDEO_HEADER_SIZE + p.payload.len(),
            SenderPacket::Parity(p) => PARITY_HEADER_SIZE + p.payload.len(),
            SenderPacket::Audio(p) => AUDIO_HEADER_SIZE + p.payload.len(),
        }
    }

    /// Serialize to a datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size());
        buf.put_u8(self.packet_type() as u8);
        buf.put_u32_le(self.session_id());

        match self {
            SenderPacket::Init(p) => {
                buf.put_i32_le(p.calibration.color_width as i32);
                buf.put_i32_le(p.calibration.color_height as i32);
                buf.put_i32_le(p.calibration.depth_width as i32);
                buf.put_i32_le(p.calibration.depth_height as i32);
                buf.put_i32_le(p.fec_group_size as i32);
            }
            SenderPacket::Video(p) => {
                buf.put_i32_le(p.frame_id as i32);
                buf.put_i32_le(p.packet_index as i32);
                buf.put_i32_le(p.packet_count as i32);
                buf.put_slice(&p.payload);
            }
            SenderPacket::Parity(p) => {
                buf.put_i32_le(p.frame_id as i32);
                buf.put_i32_le(p.group_index as i32);
                buf.put_i32_le(p.packet_count as i32);
                buf.put_i32_le(p.length_recovery as i32);
                buf.put_slice(&p.payload);
            }
            SenderPacket::Audio(p) => {
                buf.put_i32_le(p.frame_id as i32);
                buf.put_slice(&p.payload);
            }
        }
        buf.freeze()
    }

    /// Parse a datagram. Short or inconsistent datagrams are errors.
    pub fn decode(data: &[u8]) -> Result<Self, KhError> {
        require(data, PREFIX_SIZE)?;
        let packet_type = PacketType::try_from(data[0])?;
        let session_id = read_u32(data, 1);

        match packet_type {
            PacketType::Init => {
                require(data, INIT_PACKET_SIZE)?;
                let calibration = Calibration {
                    color_width: read_non_negative(data, 5)?,
                    color_height: read_non_negative(data, 9)?,
                    depth_width: read_non_negative(data, 13)?,
                    depth_height: read_non_negative(data, 17)?,
                };
                let fec_group_size = read_non_negative(data, 21)?;
                if fec_group_size == 0 {
                    return Err(KhError::InvalidPacket("fec group size is zero"));
                }
                Ok(SenderPacket::Init(InitPacket {
                    session_id,
                    calibration,
                    fec_group_size,
                }))
            }
            PacketType::Video => {
                require(data, VIDEO_HEADER_SIZE)?;
                let frame_id = read_non_negative(data, 5)?;
                let packet_index = read_non_negative(data, 9)?;
                let packet_count = read_non_negative(data, 13)?;
                if packet_index >= packet_count {
                    return Err(KhError::InvalidPacket("packet index beyond packet count"));
                }
                Ok(SenderPacket::Video(VideoPacket {
                    session_id,
                    frame_id,
                    packet_index,
                    packet_count,
                    payload: Bytes::copy_from_slice(&data[VIDEO_HEADER_SIZE..]),
                }))
            }
            PacketType::Parity => {
                require(data, PARITY_HEADER_SIZE)?;
                let frame_id = read_non_negative(data, 5)?;
                let group_index = read_non_negative(data, 9)?;
                let packet_count = read_non_negative(data, 13)?;
                if packet_count == 0 {
                    return Err(KhError::InvalidPacket("parity for empty frame"));
                }
                Ok(SenderPacket::Parity(ParityPacket {
                    session_id,
                    frame_id,
                    group_index,
                    packet_count,
                    length_recovery: read_u32(data, 17),
                    payload: Bytes::copy_from_slice(&data[PARITY_HEADER_SIZE..]),
                }))
            }
            PacketType::Audio => {
                require(data, AUDIO_HEADER_SIZE)?;
                Ok(SenderPacket::Audio(AudioPacket {
                    session_id,
                    frame_id: read_non_negative(data, 5)?,
                    payload: Bytes::copy_from_slice(&data[AUDIO_HEADER_SIZE..]),
                }))
            }
        }
    }
}

// ── Receiver packets ─────────────────────────────────────────────

/// Any datagram the receiver emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverPacket {
    /// Opens the path so the sender learns the reply endpoint.
    Ping,
    /// "I have decoded through this frame id."
    Ack { frame_id: u32 },
}

impl ReceiverPacket {
    const PING: u8 = 0;
    const ACK: u8 = 1;

    pub fn encode(&self) -> Bytes {
        match self {
            ReceiverPacket::Ping => Bytes::from_static(&[Self::PING]),
            ReceiverPacket::Ack { frame_id } => {
                let mut buf = BytesMut::with_capacity(ACK_PACKET_SIZE);
                buf.put_u8(Self::ACK);
                buf.put_i32_le(*frame_id as i32);
                buf.freeze()
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, KhError> {
        require(data, PING_PACKET_SIZE)?;
        match data[0] {
            Self::PING => Ok(ReceiverPacket::Ping),
            Self::ACK => {
                require(data, ACK_PACKET_SIZE)?;
                Ok(ReceiverPacket::Ack {
                    frame_id: read_non_negative(data, 1)?,
                })
            }
            other => Err(KhError::UnknownVariant {
                type_name: "ReceiverPacket",
                value: other as u64,
            }),
        }
    }
}

// ── Internal ─────────────────────────────────────────────────────

fn require(data: &[u8], expected: usize) -> Result<(), KhError> {
    if data.len() < expected {
        return Err(KhError::PacketTooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Callers have checked the length.
fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_non_negative(data: &[u8], offset: usize) -> Result<u32, KhError> {
    let value = read_u32(data, offset) as i32;
    u32::try_from(value).map_err(|_| KhError::InvalidPacket("negative field"))
}

// ── Tests ────────────────────────────────────────────────────────
