//! Audio transport.
//!
//! Audio frames travel one per datagram with no FEC and no
//! retransmission. The receiver releases them in id order and never
//! waits for a gap: a late audio frame is worth less than a skipped one.

use std::collections::BTreeMap;
use std::f32::consts::TAU;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

use crate::packet::AudioPacket;

/// Produces encoded audio frames on the sender. The codec is opaque to
/// the transport.
pub trait AudioSource: Send {
    /// Next encoded frame if one is ready. Never blocks.
    fn poll_frame(&mut self) -> Option<Bytes>;
}

// ── ToneSource ───────────────────────────────────────────────────

/// Stand-in microphone: a sine tone as 16-bit mono PCM, one 20 ms
/// frame per poll once the frame is due.
pub struct ToneSource {
    frequency: f32,
    sample_rate: u32,
    frame_samples: usize,
    frame_interval: Duration,
    next_frame: Instant,
    phase: f32,
}

impl ToneSource {
    pub const SAMPLE_RATE: u32 = 48_000;
    pub const FRAME_DURATION: Duration = Duration::from_millis(20);

    pub fn new(frequency: f32) -> Self {
        let sample_rate = Self::SAMPLE_RATE;
        Self {
            frequency,
            sample_rate,
            frame_samples: (sample_rate as usize * Self::FRAME_DURATION.as_millis() as usize) / 1000,
            frame_interval: Self::FRAME_DURATION,
            next_frame: Instant::now(),
            phase: 0.0,
        }
    }

    /// Render one frame regardless of timing.
    pub fn render(&mut self) -> Bytes {
        let step = TAU * self.frequency / self.sample_rate as f32;
        let mut buf = BytesMut::with_capacity(self.frame_samples * 2);
        for _ in 0..self.frame_samples {
            buf.put_i16_le((self.phase.sin() * 8_000.0) as i16);
            self.phase = (self.phase + step) % TAU;
        }
        buf.freeze()
    }
}

impl AudioSource for ToneSource {
    fn poll_frame(&mut self) -> Option<Bytes> {
        if Instant::now() < self.next_frame {
            return None;
        }
        self.next_frame += self.frame_interval;
        Some(self.render())
    }
}

// ── AudioPacketCollector ─────────────────────────────────────────

/// Orders audio packets of one session and drops stale ones.
#[derive(Debug)]
pub struct AudioPacketCollector {
    session_id: u32,
    pending: BTreeMap<u32, Bytes>,
    last_released: Option<u32>,
}

impl AudioPacketCollector {
    pub fn new(session_id: u32) -> Self {
        Self {
            session_id,
            pending: BTreeMap::new(),
            last_released: None,
        }
    }

    /// Buffer one packet. Returns `false` for foreign or stale packets.
    pub fn push(&mut self, packet: AudioPacket) -> bool {
        if packet.session_id != self.session_id {
            return false;
        }
        if self.last_released.is_some_and(|last| packet.frame_id <= last) {
            return false;
        }
        self.pending.entry(packet.frame_id).or_insert(packet.payload);
        true
    }

    /// Release everything buffered, lowest id first.
    pub fn drain(&mut self) -> Vec<Bytes> {
        if let Some((&last, _)) = self.pending.last_key_value() {
            self.last_released = Some(last);
        }
        std::mem::take(&mut self.pending).into_values().collect()
    }

    pub fn last_released(&self) -> Option<u32> {
        self.last_released
    }
}

// ── Tests ────────────────────────────────────────────────────────
