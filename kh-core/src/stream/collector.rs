//! Packet collection and in-order frame reassembly.
//!
//! Packets of one frame land in a [`PacketCollection`]. A collection is
//! complete once every video slot is filled, rebuilding at most one
//! lost slot per FEC group from the group's parity packet. Complete
//! collections are parsed into [`FrameMessage`]s and parked in an
//! ordered map; [`FrameReassembler::deliver`] releases them strictly in
//! frame-id order starting at `last_delivered + 1`.
//!
//! A frame that can never complete blocks delivery. What happens then
//! is governed by [`StallPolicy`].

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::message::FrameMessage;
use crate::packet::{ParityPacket, VideoPacket};
use crate::stream::fragment::{group_count, xor_into};

/// Upper bound on `packet_count` accepted from the wire.
pub const MAX_PACKETS_PER_FRAME: usize = 1 << 16;

// ── StallPolicy ──────────────────────────────────────────────────

/// Behaviour when the next expected frame is missing while later
/// frames are already buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallPolicy {
    /// Wait for the missing frame forever.
    Block,
    /// After `timeout`, jump to the lowest buffered keyframe above the
    /// gap and drop everything below it.
    SkipToKeyframe { timeout: Duration },
}

impl Default for StallPolicy {
    fn default() -> Self {
        StallPolicy::SkipToKeyframe {
            timeout: Duration::from_secs(1),
        }
    }
}

// ── PacketCollection ─────────────────────────────────────────────

/// Video and parity slots of one frame.
#[derive(Debug)]
pub struct PacketCollection {
    frame_id: u32,
    group_size: usize,
    videos: Vec<Option<Bytes>>,
    /// `(length_recovery, payload)` per group.
    parities: Vec<Option<(u32, Bytes)>>,
}

impl PacketCollection {
    pub fn new(frame_id: u32, packet_count: usize, group_size: usize) -> Self {
        let group_size = group_size.max(1);
        Self {
            frame_id,
            group_size,
            videos: vec![None; packet_count],
            parities: vec![None; group_count(packet_count, group_size)],
        }
    }

    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    pub fn packet_count(&self) -> usize {
        self.videos.len()
    }

    /// Store a video payload. Duplicates and out-of-range indices are
    /// ignored; returns whether the slot was filled.
    pub fn add_video(&mut self, index: usize, payload: Bytes) -> bool {
        match self.videos.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(payload);
                true
            }
            _ => false,
        }
    }

    /// Store a parity payload for `group`.
    pub fn add_parity(&mut self, group: usize, length_recovery: u32, payload: Bytes) -> bool {
        match self.parities.get_mut(group) {
            Some(slot) if slot.is_none() => {
                *slot = Some((length_recovery, payload));
                true
            }
            _ => false,
        }
    }

    /// Video slots still empty.
    pub fn missing(&self) -> usize {
        self.videos.iter().filter(|slot| slot.is_none()).count()
    }

    /// Rebuild every group that lost exactly one packet and has its
    /// parity. Returns the number of packets rebuilt.
    pub fn recover(&mut self) -> usize {
        let mut recovered = 0;
        for group in 0..self.parities.len() {
            let range = self.group_range(group);
            let mut missing = range.clone().filter(|&i| self.videos[i].is_none());
            let (Some(lost), None) = (missing.next(), missing.next()) else {
                continue;
            };
            let Some((length_recovery, parity)) = &self.parities[group] else {
                continue;
            };

            let mut payload = parity.to_vec();
            let mut length = *length_recovery;
            for present in range.filter(|&i| i != lost).filter_map(|i| self.videos[i].as_ref()) {
                xor_into(&mut payload, present);
                length ^= present.len() as u32;
            }
            if length as usize > payload.len() {
                debug!(frame_id = self.frame_id, group, "parity length inconsistent");
                continue;
            }
            payload.truncate(length as usize);
            self.videos[lost] = Some(Bytes::from(payload));
            recovered += 1;
        }
        recovered
    }

    /// Recover what can be recovered and report completeness.
    pub fn try_complete(&mut self) -> bool {
        if self.missing() > 0 {
            self.recover();
        }
        self.missing() == 0
    }

    /// Concatenate all payloads in index order, or `None` if a slot is
    /// still empty.
    pub fn assemble(&self) -> Option<Vec<u8>> {
        let total = self.videos.iter().flatten().map(Bytes::len).sum();
        let mut message = Vec::with_capacity(total);
        for slot in &self.videos {
            message.extend_from_slice(slot.as_ref()?);
        }
        Some(message)
    }

    // ── Internal ─────────────────────────────────────────────────

    fn group_range(&self, group: usize) -> Range<usize> {
        let start = group * self.group_size;
        start..(start + self.group_size).min(self.videos.len())
    }
}

// ── FrameReassembler ─────────────────────────────────────────────

/// Receiver-side collector for one session.
pub struct FrameReassembler {
    session_id: u32,
    group_size: usize,
    policy: StallPolicy,
    collections: HashMap<u32, PacketCollection>,
    messages: BTreeMap<u32, FrameMessage>,
    last_delivered: Option<u32>,
    stalled_since: Option<Instant>,
    skipped_frames: u64,
}

impl FrameReassembler {
    pub fn new(session_id: u32, group_size: usize, policy: StallPolicy) -> Self {
        Self {
            session_id,
            group_size: group_size.max(1),
            policy,
            collections: HashMap::new(),
            messages: BTreeMap::new(),
            last_delivered: None,
            stalled_since: None,
            skipped_frames: 0,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Highest frame id released so far.
    pub fn last_delivered(&self) -> Option<u32> {
        self.last_delivered
    }

    /// The frame id [`deliver`](Self::deliver) is waiting for.
    pub fn next_expected(&self) -> u32 {
        self.last_delivered.map_or(0, |id| id.wrapping_add(1))
    }

    /// Frames abandoned by [`StallPolicy::SkipToKeyframe`].
    pub fn skipped_frames(&self) -> u64 {
        self.skipped_frames
    }

    pub fn pending_collections(&self) -> usize {
        self.collections.len()
    }

    pub fn buffered_messages(&self) -> usize {
        self.messages.len()
    }

    /// Accept a video packet. Returns `false` if it was discarded.
    pub fn push_video(&mut self, packet: VideoPacket) -> bool {
        let Some(collection) = self.collection_for(
            packet.session_id,
            packet.frame_id,
            packet.packet_count as usize,
        ) else {
            return false;
        };
        collection.add_video(packet.packet_index as usize, packet.payload)
    }

    /// Accept a parity packet. Returns `false` if it was discarded.
    pub fn push_parity(&mut self, packet: ParityPacket) -> bool {
        let Some(collection) = self.collection_for(
            packet.session_id,
            packet.frame_id,
            packet.packet_count as usize,
        ) else {
            return false;
        };
        collection.add_parity(
            packet.group_index as usize,
            packet.length_recovery,
            packet.payload,
        )
    }

    /// Move every complete collection into the message map. Returns the
    /// number of frames assembled.
    pub fn assemble(&mut self) -> usize {
        let complete: Vec<u32> = self
            .collections
            .iter_mut()
            .filter_map(|(&id, collection)| collection.try_complete().then_some(id))
            .collect();

        let mut assembled = 0;
        for frame_id in complete {
            let Some(buffer) = self
                .collections
                .remove(&frame_id)
                .and_then(|collection| collection.assemble())
            else {
                continue;
            };
            match FrameMessage::decode(&buffer) {
                Ok(message) if message.frame_id == frame_id => {
                    self.messages.insert(frame_id, message);
                    assembled += 1;
                }
                Ok(message) => {
                    warn!(
                        frame_id,
                        embedded = message.frame_id,
                        "frame id mismatch in reassembled message; dropped"
                    );
                }
                Err(e) => warn!(frame_id, "malformed frame message dropped: {e}"),
            }
        }
        assembled
    }

    /// Release buffered frames in order.
    pub fn deliver(&mut self) -> Vec<FrameMessage> {
        self.deliver_at(Instant::now())
    }

    /// [`deliver`](Self::deliver) with an explicit clock (for tests).
    pub fn deliver_at(&mut self, now: Instant) -> Vec<FrameMessage> {
        let mut delivered = Vec::new();

        loop {
            let before = delivered.len();
            while let Some(message) = self.messages.remove(&self.next_expected()) {
                self.last_delivered = Some(message.frame_id);
                delivered.push(message);
            }
            if delivered.len() > before {
                self.stalled_since = None;
            }

            if !self.is_stalled() {
                self.stalled_since = None;
                break;
            }
            let since = *self.stalled_since.get_or_insert(now);

            let StallPolicy::SkipToKeyframe { timeout } = self.policy else {
                break;
            };
            if now.duration_since(since) < timeout {
                break;
            }
            let Some(target) = self
                .messages
                .values()
                .find(|message| message.keyframe)
                .map(|message| message.frame_id)
            else {
                break;
            };

            let skipped = u64::from(target - self.next_expected());
            warn!(
                from = self.next_expected(),
                to = target,
                skipped,
                "frame lost beyond recovery; skipping to keyframe"
            );
            self.skipped_frames += skipped;
            self.last_delivered = target.checked_sub(1);
            self.stalled_since = None;
            self.prune();
        }

        self.prune();
        delivered
    }

    // ── Internal ─────────────────────────────────────────────────

    fn collection_for(
        &mut self,
        session_id: u32,
        frame_id: u32,
        packet_count: usize,
    ) -> Option<&mut PacketCollection> {
        if session_id != self.session_id {
            debug!(session_id, "packet from another session discarded");
            return None;
        }
        if self.last_delivered.is_some_and(|last| frame_id <= last) {
            return None;
        }
        if packet_count == 0 || packet_count > MAX_PACKETS_PER_FRAME {
            debug!(frame_id, packet_count, "implausible packet count discarded");
            return None;
        }
        if self.messages.contains_key(&frame_id) {
            return None;
        }

        let group_size = self.group_size;
        let collection = self
            .collections
            .entry(frame_id)
            .or_insert_with(|| PacketCollection::new(frame_id, packet_count, group_size));
        if collection.packet_count() != packet_count {
            debug!(
                frame_id,
                expected = collection.packet_count(),
                packet_count,
                "packet count disagrees with collection; discarded"
            );
            return None;
        }
        Some(collection)
    }

    /// Delivery waits on a missing frame while later ones exist.
    fn is_stalled(&self) -> bool {
        let next = self.next_expected();
        self.messages.keys().any(|&id| id > next) || self.collections.keys().any(|&id| id > next)
    }

    fn prune(&mut self) {
        if let Some(last) = self.last_delivered {
            self.collections.retain(|&id, _| id > last);
            self.messages.retain(|&id, _| id > last);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
