//! # Depth + color streaming over UDP
//!
//! A sender captures synchronized color and depth frames, compresses
//! them, frames each into one message, and fragments the message into
//! MTU-sized datagrams with XOR parity. The receiver reassembles frames,
//! delivers them strictly in frame-id order, decodes them, and
//! acknowledges the newest one. Acks drive the sender's pacing.
//!
//! ## Architecture
//!
//! ```text
//! SENDER                                       RECEIVER
//! ┌──────────────────────────┐                ┌───────────────────────────┐
//! │ DepthCamera::capture     │                │ ReceiverSocket::drain     │
//! │   ↓                      │                │   ↓                       │
//! │ PacingController::decide │   UDP video    │ FrameReassembler (FEC)    │
//! │   ↓                      │   + parity     │   ↓                       │
//! │ TrvlEncoder / color      │ ────────────►  │ FrameMessage::decode      │
//! │   ↓                      │                │   ↓                       │
//! │ FrameMessage::encode     │                │ TrvlDecoder / color       │
//! │   ↓                      │                │   ↓                       │
//! │ Fragmenter::packetize    │   ◄──── ack    │ watch::Sender<frame>      │
//! └──────────────────────────┘                └───────────────────────────┘
//! ```
//!
//! ## Sub-modules
//!
//! | Module      | Purpose                                             |
//! |-------------|-----------------------------------------------------|
//! | `types`     | Calibration and frame types shared by both ends     |
//! | `capture`   | Camera trait and a synthetic depth camera           |
//! | `pacing`    | Ack-driven admission and keyframe insertion         |
//! | `fragment`  | Message fragmentation and XOR parity                |
//! | `collector` | Packet collection, FEC recovery, in-order delivery  |
//! | `audio`     | Audio source trait and receive-side ordering        |
//! | `transport` | Non-blocking UDP endpoints                          |
//! | `bandwidth` | Throughput, round-trip and summary accounting       |
//! | `service`   | Sender orchestrator (capture + send tasks)          |
//! | `client`    | Receiver loop publishing decoded frames             |

pub mod audio;
pub mod bandwidth;
pub mod capture;
pub mod client;
pub mod collector;
pub mod fragment;
pub mod pacing;
pub mod service;
pub mod transport;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────

pub use audio::{AudioPacketCollector, AudioSource, ToneSource};
pub use bandwidth::{BandwidthEstimator, StreamSummary, SummaryWindow};
pub use capture::{DepthCamera, SyntheticCamera};
pub use client::{FrameStats, StreamClient, StreamClientConfig};
pub use collector::{FrameReassembler, PacketCollection, StallPolicy};
pub use fragment::Fragmenter;
pub use pacing::{PacingController, PacingDecision, ReceiverState};
pub use service::{StreamService, StreamServiceConfig, new_session_id};
pub use transport::{ReceiverSocket, SenderListener, SenderSocket};
pub use types::{Calibration, CapturedFrame, DecodedFrame};
