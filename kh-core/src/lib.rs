//! # kh-core
//!
//! Core library for streaming depth + color video over UDP.
//!
//! This crate contains:
//! - **Codecs**: `TrvlEncoder` / `TrvlDecoder` temporal depth codec over
//!   RVL, and the `ColorEncoder` / `ColorDecoder` seam
//! - **Framing**: `FrameMessage`, one frame's metadata and payloads
//! - **Packets**: `SenderPacket` / `ReceiverPacket` wire encoding
//! - **Stream**: fragmentation + FEC, reassembly, pacing, transport, and
//!   the `StreamService` / `StreamClient` orchestrators
//! - **Console**: line prompts for the interactive binaries
//! - **Error**: `KhError`, a typed `thiserror`-based error hierarchy

pub mod codec;
pub mod console;
pub mod error;
pub mod message;
pub mod packet;
pub mod stream;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{ColorDecoder, ColorEncoder, TrvlDecoder, TrvlEncoder, YuvImage, ZstdColorCodec};
pub use error::KhError;
pub use message::{FrameMessage, MessageFlags, MessageType};
pub use packet::{
    AudioPacket, InitPacket, MAX_PAYLOAD_SIZE, MTU, PacketType, ParityPacket, ReceiverPacket,
    SenderPacket, VideoPacket,
};
pub use stream::{
    Calibration, DecodedFrame, FrameReassembler, Fragmenter, StallPolicy, StreamClient,
    StreamClientConfig, StreamService, StreamServiceConfig,
};
