//! Frame message fragmentation and XOR forward error correction.
//!
//! A message is cut into [`MAX_PAYLOAD_SIZE`] chunks, numbered
//! `0..packet_count`. Consecutive chunks form FEC groups of
//! `group_size`; each group gets one parity packet holding the XOR of
//! its payloads (shorter payloads zero-padded) and the XOR of their
//! lengths. Any one lost packet per group can be rebuilt from the rest.
//!
//! ```text
//! group 0: V0 V1 V2 V3 V4 P0 | group 1: V5 V6 P1
//! ```

use bytes::Bytes;

use crate::error::KhError;
use crate::packet::{MAX_PAYLOAD_SIZE, ParityPacket, SenderPacket, VideoPacket};

/// Default number of video packets protected by one parity packet.
pub const DEFAULT_GROUP_SIZE: usize = 5;

/// Number of FEC groups for a frame of `packet_count` packets.
pub fn group_count(packet_count: usize, group_size: usize) -> usize {
    packet_count.div_ceil(group_size.max(1))
}

/// XOR `src` into `dst`, growing `dst` with zeros if `src` is longer.
pub fn xor_into(dst: &mut Vec<u8>, src: &[u8]) {
    if dst.len() < src.len() {
        dst.resize(src.len(), 0);
    }
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

// ── Fragmenter ───────────────────────────────────────────────────

/// Splits frame messages into video and parity packets.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    max_payload: usize,
    group_size: usize,
}

impl Fragmenter {
    /// Fragmenter producing MTU-sized packets.
    pub fn new(group_size: usize) -> Self {
        Self {
            max_payload: MAX_PAYLOAD_SIZE,
            group_size: group_size.max(1),
        }
    }

    /// Override the payload size. Must be non-zero and at most
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn with_max_payload(mut self, max_payload: usize) -> Result<Self, KhError> {
        if max_payload == 0 || max_payload > MAX_PAYLOAD_SIZE {
            return Err(KhError::Config(format!(
                "payload size {max_payload} outside 1..={MAX_PAYLOAD_SIZE}"
            )));
        }
        self.max_payload = max_payload;
        Ok(self)
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Cut `message` into video packets. An empty message still yields
    /// one (empty) packet so the frame id is announced.
    pub fn fragment(&self, session_id: u32, frame_id: u32, message: &Bytes) -> Vec<VideoPacket> {
        let packet_count = message.len().div_ceil(self.max_payload).max(1);
        (0..packet_count)
            .map(|index| {
                let start = index * self.max_payload;
                let end = (start + self.max_payload).min(message.len());
                VideoPacket {
                    session_id,
                    frame_id,
                    packet_index: index as u32,
                    packet_count: packet_count as u32,
                    payload: message.slice(start..end),
                }
            })
            .collect()
    }

    /// Parity packet for one group of consecutive video packets.
    pub fn parity_for(&self, group_index: usize, group: &[VideoPacket]) -> Option<ParityPacket> {
        let first = group.first()?;
        let mut payload = Vec::with_capacity(self.max_payload);
        let mut length_recovery = 0u32;
        for packet in group {
            xor_into(&mut payload, &packet.payload);
            length_recovery ^= packet.payload.len() as u32;
        }
        Some(ParityPacket {
            session_id: first.session_id,
            frame_id: first.frame_id,
            group_index: group_index as u32,
            packet_count: first.packet_count,
            length_recovery,
            payload: Bytes::from(payload),
        })
    }

    /// Fragment and protect one message: each group's video packets
    /// followed by its parity packet.
    pub fn packetize(&self, session_id: u32, frame_id: u32, message: &Bytes) -> Vec<SenderPacket> {
        let videos = self.fragment(session_id, frame_id, message);
        let mut packets =
            Vec::with_capacity(videos.len() + group_count(videos.len(), self.group_size));

        for (group_index, group) in videos.chunks(self.group_size).enumerate() {
            let parity = self.parity_for(group_index, group);
            packets.extend(group.iter().cloned().map(SenderPacket::Video));
            packets.extend(parity.map(SenderPacket::Parity));
        }
        packets
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_SIZE)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn message(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<_>>())
    }

    fn concat(packets: &[VideoPacket]) -> Vec<u8> {
        packets.iter().flat_map(|p| p.payload.iter().copied()).collect()
    }

    #[test]
    fn payload_size_out_of_range_is_error() {
        assert!(matches!(
            Fragmenter::default().with_max_payload(0),
            Err(KhError::Config(_))
        ));
        assert!(Fragmenter::default().with_max_payload(MAX_PAYLOAD_SIZE + 1).is_err());
        let frag = Fragmenter::default().with_max_payload(MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(frag.max_payload(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn small_message_is_one_packet() {
        let frag = Fragmenter::default();
        let packets = frag.fragment(42, 0, &message(100));
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet_count, 1);
        assert_eq!(packets[0].session_id, 42);
    }

    #[test]
    fn last_chunk_may_be_short() {
        let frag = Fragmenter::default().with_max_payload(10).unwrap();
        let packets = frag.fragment(1, 5, &message(25));
        let sizes: Vec<_> = packets.iter().map(|p| p.payload.len()).collect();
        assert_eq!(sizes, [10, 10, 5]);
        assert!(packets.iter().all(|p| p.packet_count == 3));
        assert_eq!(concat(&packets), message(25).to_vec());
    }

    #[test]
    fn empty_message_yields_one_packet() {
        let packets = Fragmenter::default().fragment(1, 0, &Bytes::new());
        assert_eq!(packets.len(), 1);
        assert!(packets[0].payload.is_empty());
    }

    #[test]
    fn parity_pads_and_records_lengths() {
        let frag = Fragmenter::new(3).with_max_payload(4).unwrap();
        let packets = frag.fragment(1, 0, &Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]));
        let parity = frag.parity_for(0, &packets).unwrap();
        assert_eq!(&parity.payload[..], &[1u8 ^ 5 ^ 9, 2 ^ 6 ^ 10, 3 ^ 7, 4 ^ 8]);
        assert_eq!(parity.length_recovery, 4 ^ 4 ^ 2);
        assert!(frag.parity_for(1, &[]).is_none());
    }

    #[test]
    fn packetize_interleaves_parity_after_each_group() {
        let frag = Fragmenter::new(2).with_max_payload(10).unwrap();
        let packets = frag.packetize(9, 3, &message(45));
        let kinds: Vec<_> = packets
            .iter()
            .map(|p| match p {
                SenderPacket::Video(v) => format!("V{}", v.packet_index),
                SenderPacket::Parity(q) => format!("P{}", q.group_index),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(kinds, ["V0", "V1", "P0", "V2", "V3", "P1", "V4", "P2"]);
        assert_eq!(group_count(5, 2), 3);
    }

    proptest! {
        #[test]
        fn prop_fragment_concat_roundtrip(
            data in prop::collection::vec(any::<u8>(), 0..20_000),
            max_payload in 1..MAX_PAYLOAD_SIZE,
        ) {
            let frag = Fragmenter::default().with_max_payload(max_payload).unwrap();
            let bytes = Bytes::from(data.clone());
            let packets = frag.fragment(7, 1, &bytes);
            prop_assert!(packets.iter().all(|p| p.payload.len() <= max_payload));
            prop_assert!(packets.iter().enumerate().all(|(i, p)| p.packet_index as usize == i));
            prop_assert_eq!(concat(&packets), data);
        }
    }
}
