//! TRVL: temporal depth compression layered over [`rvl`](super::rvl).
//!
//! The encoder keeps a filtered copy of the depth image. Each frame,
//! every pixel of that copy is updated from the raw reading with a
//! small state machine:
//!
//! 1. A stored invalid pixel (0) adopts any positive reading.
//! 2. A valid pixel reading 0 counts the dropout; only after
//!    `invalid_threshold` consecutive dropouts does it become invalid.
//! 3. Two valid readings reset the dropout count, and the stored value
//!    only moves when the reading differs by more than
//!    `change_threshold`.
//!
//! Keyframes carry the raw image; delta frames carry
//! `new_stored − old_stored` per pixel, which is mostly zeros and
//! compresses well. The decoder must see every frame the encoder
//! produced, in order, from the last keyframe on.

use crate::codec::rvl;
use crate::error::KhError;

/// Depth difference (same units as the sensor) below which readings
/// are treated as jitter.
pub const DEFAULT_CHANGE_THRESHOLD: i16 = 10;

/// Consecutive zero readings before a valid pixel is invalidated.
pub const DEFAULT_INVALID_THRESHOLD: u32 = 2;

// ── TrvlPixel ────────────────────────────────────────────────────

/// Encoder-side filter state of one depth pixel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrvlPixel {
    pub value: i16,
    pub invalid_count: u32,
}

impl TrvlPixel {
    /// Apply one raw reading.
    fn update(&mut self, raw: i16, change_threshold: i16, invalid_threshold: u32) {
        if self.value == 0 {
            if raw > 0 {
                self.value = raw;
            }
            return;
        }

        if raw == 0 {
            self.invalid_count += 1;
            if self.invalid_count >= invalid_threshold {
                self.value = 0;
                self.invalid_count = 0;
            }
            return;
        }

        self.invalid_count = 0;
        if (i32::from(self.value) - i32::from(raw)).abs() > i32::from(change_threshold) {
            self.value = raw;
        }
    }
}

// ── TrvlEncoder ──────────────────────────────────────────────────

/// Stateful depth encoder. One instance per stream.
pub struct TrvlEncoder {
    pixels: Vec<TrvlPixel>,
    change_threshold: i16,
    invalid_threshold: u32,
}

impl TrvlEncoder {
    /// Create an encoder for frames of `frame_size` pixels.
    pub fn new(frame_size: usize, change_threshold: i16, invalid_threshold: u32) -> Self {
        Self {
            pixels: vec![TrvlPixel::default(); frame_size],
            change_threshold,
            invalid_threshold,
        }
    }

    /// Encoder with the default thresholds.
    pub fn with_defaults(frame_size: usize) -> Self {
        Self::new(
            frame_size,
            DEFAULT_CHANGE_THRESHOLD,
            DEFAULT_INVALID_THRESHOLD,
        )
    }

    /// Number of pixels per frame.
    pub fn frame_size(&self) -> usize {
        self.pixels.len()
    }

    /// Current filtered state.
    pub fn pixels(&self) -> &[TrvlPixel] {
        &self.pixels
    }

    /// Encode one raw depth frame.
    pub fn encode(&mut self, depth: &[i16], keyframe: bool) -> Result<Vec<u8>, KhError> {
        if depth.len() != self.pixels.len() {
            return Err(KhError::FrameSizeMismatch {
                expected: self.pixels.len(),
                actual: depth.len(),
            });
        }

        if keyframe {
            for (pixel, &raw) in self.pixels.iter_mut().zip(depth) {
                pixel.value = raw;
                pixel.invalid_count = u32::from(raw == 0);
            }
            return Ok(rvl::compress(depth));
        }

        let mut deltas = Vec::with_capacity(depth.len());
        for (pixel, &raw) in self.pixels.iter_mut().zip(depth) {
            let old = pixel.value;
            pixel.update(raw, self.change_threshold, self.invalid_threshold);
            deltas.push(pixel.value.wrapping_sub(old));
        }
        Ok(rvl::compress(&deltas))
    }
}

// ── TrvlDecoder ──────────────────────────────────────────────────

/// Stateful depth decoder mirroring [`TrvlEncoder`].
pub struct TrvlDecoder {
    values: Vec<i16>,
}

impl TrvlDecoder {
    /// Create a decoder for frames of `frame_size` pixels.
    pub fn new(frame_size: usize) -> Self {
        Self {
            values: vec![0; frame_size],
        }
    }

    /// Number of pixels per frame.
    pub fn frame_size(&self) -> usize {
        self.values.len()
    }

    /// Decode one frame and return the reconstructed depth image.
    ///
    /// On error the decoder state is left untouched.
    pub fn decode(&mut self, frame: &[u8], keyframe: bool) -> Result<&[i16], KhError> {
        let decoded = rvl::decompress(frame, self.values.len())?;

        if keyframe {
            self.values = decoded;
        } else {
            for (value, delta) in self.values.iter_mut().zip(decoded) {
                *value = value.wrapping_add(delta);
            }
        }
        Ok(&self.values)
    }

    /// Last decoded depth image.
    pub fn values(&self) -> &[i16] {
        &self.values
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode_then_decode(
        encoder: &mut TrvlEncoder,
        decoder: &mut TrvlDecoder,
        raw: &[i16],
        keyframe: bool,
    ) -> Vec<i16> {
        let bytes = encoder.encode(raw, keyframe).unwrap();
        decoder.decode(&bytes, keyframe).unwrap().to_vec()
    }

    fn stored(encoder: &TrvlEncoder) -> Vec<i16> {
        encoder.pixels().iter().map(|p| p.value).collect()
    }

    #[test]
    fn keyframe_is_lossless() {
        let mut enc = TrvlEncoder::with_defaults(4);
        let mut dec = TrvlDecoder::new(4);
        let out = encode_then_decode(&mut enc, &mut dec, &[100, 0, 300, 0], true);
        assert_eq!(out, [100, 0, 300, 0]);
    }

    #[test]
    fn keyframe_derives_invalid_count() {
        let mut enc = TrvlEncoder::with_defaults(2);
        enc.encode(&[0, 500], true).unwrap();
        assert_eq!(enc.pixels()[0].invalid_count, 1);
        assert_eq!(enc.pixels()[1].invalid_count, 0);
    }

    #[test]
    fn delta_applies_update_rule() {
        let mut enc = TrvlEncoder::new(4, 10, 2);
        let mut dec = TrvlDecoder::new(4);
        encode_then_decode(&mut enc, &mut dec, &[100, 0, 300, 0], true);
        let out = encode_then_decode(&mut enc, &mut dec, &[105, 50, 305, 0], false);
        assert_eq!(out, [100, 50, 300, 0]);
    }

    #[test]
    fn large_change_is_adopted() {
        let mut enc = TrvlEncoder::new(1, 10, 2);
        let mut dec = TrvlDecoder::new(1);
        encode_then_decode(&mut enc, &mut dec, &[1000], true);
        let out = encode_then_decode(&mut enc, &mut dec, &[1011], false);
        assert_eq!(out, [1011]);
    }

    #[test]
    fn hysteresis_suppresses_jitter() {
        let mut enc = TrvlEncoder::new(1, 10, 2);
        let mut dec = TrvlDecoder::new(1);
        encode_then_decode(&mut enc, &mut dec, &[2000], true);
        for raw in [2010, 1990, 2005, 1995, 2010, 1990] {
            let out = encode_then_decode(&mut enc, &mut dec, &[raw], false);
            assert_eq!(out, [2000]);
        }
    }

    #[test]
    fn single_dropout_is_absorbed() {
        let mut enc = TrvlEncoder::new(1, 10, 2);
        enc.encode(&[800], true).unwrap();

        enc.encode(&[0], false).unwrap();
        assert_eq!(stored(&enc), [800]);
        assert_eq!(enc.pixels()[0].invalid_count, 1);

        enc.encode(&[803], false).unwrap();
        assert_eq!(stored(&enc), [800]);
        assert_eq!(enc.pixels()[0].invalid_count, 0);
    }

    #[test]
    fn dropout_at_threshold_invalidates() {
        let mut enc = TrvlEncoder::new(1, 10, 2);
        enc.encode(&[800], true).unwrap();
        enc.encode(&[0], false).unwrap();
        enc.encode(&[0], false).unwrap();
        assert_eq!(stored(&enc), [0]);
        assert_eq!(enc.pixels()[0].invalid_count, 0);

        // Invalid pixels adopt the next positive reading as-is.
        enc.encode(&[805], false).unwrap();
        assert_eq!(stored(&enc), [805]);
    }

    #[test]
    fn invalid_pixel_ignores_negative_reading() {
        let mut enc = TrvlEncoder::new(1, 10, 2);
        enc.encode(&[0], true).unwrap();
        enc.encode(&[-5], false).unwrap();
        assert_eq!(stored(&enc), [0]);
    }

    #[test]
    fn size_mismatch_is_error() {
        let mut enc = TrvlEncoder::with_defaults(4);
        assert!(matches!(
            enc.encode(&[1, 2, 3], true),
            Err(KhError::FrameSizeMismatch {
                expected: 4,
                actual: 3
            })
        ));
    }

    #[test]
    fn hostile_keyframe_is_error_not_panic() {
        // Zero run 0, value run 2, value 1, then a delta of i32::MAX.
        // Nibble codes packed by hand, most significant nibble first.
        let words: [u32; 2] = [0x022E_FFFF, 0xFFFF_F300];
        let stream: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let mut dec = TrvlDecoder::new(2);
        assert!(dec.decode(&stream, true).is_err());
        assert_eq!(dec.values(), [0, 0]);
    }

    #[test]
    fn decode_error_leaves_state() {
        let mut enc = TrvlEncoder::with_defaults(3);
        let mut dec = TrvlDecoder::new(3);
        encode_then_decode(&mut enc, &mut dec, &[1, 2, 3], true);
        assert!(dec.decode(&[0xff], false).is_err());
        assert_eq!(dec.values(), [1, 2, 3]);
    }

    proptest! {
        #[test]
        fn prop_decoder_tracks_encoder_state(
            frames in prop::collection::vec(
                prop::collection::vec(prop_oneof![1 => Just(0i16), 4 => 500..4000i16], 64),
                1..12,
            )
        ) {
            let mut enc = TrvlEncoder::with_defaults(64);
            let mut dec = TrvlDecoder::new(64);
            for (i, raw) in frames.iter().enumerate() {
                let keyframe = i == 0;
                let out = encode_then_decode(&mut enc, &mut dec, raw, keyframe);
                prop_assert_eq!(out, stored(&enc));
                if keyframe {
                    prop_assert_eq!(&stored(&enc), raw);
                }
            }
        }

        #[test]
        fn prop_keyframes_reproduce_input(
            raw in prop::collection::vec(any::<i16>(), 16)
        ) {
            let mut enc = TrvlEncoder::with_defaults(16);
            let mut dec = TrvlDecoder::new(16);
            prop_assert_eq!(encode_then_decode(&mut enc, &mut dec, &raw, true), raw);
        }
    }
}
