//! Color codec seam.
//!
//! The transport treats color payloads as opaque bytes. Any codec that
//! turns an I420 [`YuvImage`] into bytes and back can be plugged in via
//! [`ColorEncoder`] / [`ColorDecoder`]. [`ZstdColorCodec`] is a lossless
//! planar implementation used by the binaries and tests.

use std::io::Read;

use crate::error::KhError;

/// Decoded size limit before any init has announced the resolution:
/// one 4096x4096 I420 image.
pub const MAX_UNCONFIGURED_IMAGE_BYTES: usize = 4096 * 4096 * 3 / 2;

// ── YuvImage ─────────────────────────────────────────────────────

/// An I420 image: full-resolution luma, quarter-resolution chroma.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YuvImage {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub u: Vec<u8>,
    pub v: Vec<u8>,
}

impl YuvImage {
    /// A mid-grey image of the given size.
    pub fn blank(width: u32, height: u32) -> Self {
        let (luma, chroma) = Self::plane_sizes(width, height);
        Self {
            width,
            height,
            y: vec![128; luma],
            u: vec![128; chroma],
            v: vec![128; chroma],
        }
    }

    /// Total bytes of all three planes.
    pub fn frame_bytes(width: u32, height: u32) -> usize {
        let (luma, chroma) = Self::plane_sizes(width, height);
        luma + 2 * chroma
    }

    /// Byte sizes of the luma plane and of each chroma plane.
    pub fn plane_sizes(width: u32, height: u32) -> (usize, usize) {
        let luma = width as usize * height as usize;
        let chroma = width.div_ceil(2) as usize * height.div_ceil(2) as usize;
        (luma, chroma)
    }

    fn validate(&self) -> Result<(), KhError> {
        let (luma, chroma) = Self::plane_sizes(self.width, self.height);
        if self.y.len() != luma || self.u.len() != chroma || self.v.len() != chroma {
            return Err(KhError::Codec(format!(
                "I420 planes do not match {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

// ── Traits ───────────────────────────────────────────────────────

/// Compresses color images on the sender.
pub trait ColorEncoder: Send {
    /// Encode one image. `keyframe` requests an independently
    /// decodable frame from stateful codecs.
    fn encode(&mut self, image: &YuvImage, keyframe: bool) -> Result<Vec<u8>, KhError>;
}

/// Decompresses color payloads on the receiver.
pub trait ColorDecoder: Send {
    /// Resolution announced by the sender's init packet. Decoders may
    /// use it to bound their output.
    fn configure(&mut self, _width: u32, _height: u32) {}

    fn decode(&mut self, payload: &[u8]) -> Result<YuvImage, KhError>;
}

// ── ZstdColorCodec ───────────────────────────────────────────────

/// Lossless codec: `width:u32 | height:u32 | Y | U | V`, zstd-compressed.
#[derive(Debug, Clone)]
pub struct ZstdColorCodec {
    level: i32,
    /// Resolution set by [`ColorDecoder::configure`].
    expected: Option<(u32, u32)>,
}

impl ZstdColorCodec {
    pub fn new(level: i32) -> Self {
        Self {
            level,
            expected: None,
        }
    }

    /// Largest decompressed payload accepted, header included.
    fn output_limit(&self) -> usize {
        8 + self.expected.map_or(MAX_UNCONFIGURED_IMAGE_BYTES, |(w, h)| {
            YuvImage::frame_bytes(w, h)
        })
    }
}

impl Default for ZstdColorCodec {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ColorEncoder for ZstdColorCodec {
    fn encode(&mut self, image: &YuvImage, _keyframe: bool) -> Result<Vec<u8>, KhError> {
        image.validate()?;
        let mut raw = Vec::with_capacity(8 + image.y.len() + image.u.len() * 2);
        raw.extend_from_slice(&image.width.to_le_bytes());
        raw.extend_from_slice(&image.height.to_le_bytes());
        raw.extend_from_slice(&image.y);
        raw.extend_from_slice(&image.u);
        raw.extend_from_slice(&image.v);
        zstd::encode_all(raw.as_slice(), self.level)
            .map_err(|e| KhError::Codec(format!("zstd compress: {e}")))
    }
}

impl ColorDecoder for ZstdColorCodec {
    fn configure(&mut self, width: u32, height: u32) {
        self.expected = Some((width, height));
    }

    fn decode(&mut self, payload: &[u8]) -> Result<YuvImage, KhError> {
        let limit = self.output_limit();
        let decoder = zstd::stream::read::Decoder::new(payload)
            .map_err(|e| KhError::Codec(format!("zstd decompress: {e}")))?;
        let mut raw = Vec::new();
        decoder
            .take(limit as u64 + 1)
            .read_to_end(&mut raw)
            .map_err(|e| KhError::Codec(format!("zstd decompress: {e}")))?;
        if raw.len() > limit {
            return Err(KhError::Codec(format!(
                "color payload decompresses beyond {limit} bytes"
            )));
        }
        if raw.len() < 8 {
            return Err(KhError::Codec("color payload missing dimensions".into()));
        }
        let width = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let height = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if self.expected.is_some_and(|expected| expected != (width, height)) {
            return Err(KhError::Codec(format!(
                "color image is {width}x{height}, session announced {:?}",
                self.expected
            )));
        }
        let (luma, chroma) = YuvImage::plane_sizes(width, height);
        let planes = &raw[8..];
        if planes.len() != luma + 2 * chroma {
            return Err(KhError::Codec(format!(
                "color payload holds {} bytes, {width}x{height} needs {}",
                planes.len(),
                luma + 2 * chroma
            )));
        }
        Ok(YuvImage {
            width,
            height,
            y: planes[..luma].to_vec(),
            u: planes[luma..luma + chroma].to_vec(),
            v: planes[luma + chroma..].to_vec(),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_sizes_round_up_chroma() {
        assert_eq!(YuvImage::plane_sizes(4, 4), (16, 4));
        assert_eq!(YuvImage::plane_sizes(3, 5), (15, 6));
    }

    #[test]
    fn zstd_roundtrip() {
        let mut image = YuvImage::blank(6, 4);
        image.y.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
        let mut codec = ZstdColorCodec::default();
        let bytes = ColorEncoder::encode(&mut codec, &image, true).unwrap();
        let decoded = ColorDecoder::decode(&mut codec, &bytes).unwrap();
        assert_eq!(decoded, image);
    }

    #[test]
    fn rejects_inconsistent_planes() {
        let mut image = YuvImage::blank(4, 4);
        image.u.pop();
        let mut codec = ZstdColorCodec::default();
        assert!(ColorEncoder::encode(&mut codec, &image, false).is_err());
    }

    #[test]
    fn output_bounded_by_announced_size() {
        let mut sender = ZstdColorCodec::default();
        let large = ColorEncoder::encode(&mut sender, &YuvImage::blank(64, 64), true).unwrap();
        let small = ColorEncoder::encode(&mut sender, &YuvImage::blank(4, 4), true).unwrap();

        let mut receiver = ZstdColorCodec::default();
        receiver.configure(4, 4);
        assert!(ColorDecoder::decode(&mut receiver, &small).is_ok());
        assert!(matches!(
            ColorDecoder::decode(&mut receiver, &large),
            Err(KhError::Codec(_))
        ));
    }

    #[test]
    fn highly_compressible_bomb_is_rejected() {
        // Header claims a tiny image, then megabytes of zeros.
        let mut raw = Vec::new();
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.extend_from_slice(&2u32.to_le_bytes());
        raw.resize(8 + 32 * 1024 * 1024, 0);
        let bomb = zstd::encode_all(raw.as_slice(), 3).unwrap();

        let mut receiver = ZstdColorCodec::default();
        receiver.configure(2, 2);
        assert!(ColorDecoder::decode(&mut receiver, &bomb).is_err());
        let mut unconfigured = ZstdColorCodec::default();
        assert!(ColorDecoder::decode(&mut unconfigured, &bomb).is_err());
    }

    #[test]
    fn rejects_garbage() {
        let mut codec = ZstdColorCodec::default();
        assert!(ColorDecoder::decode(&mut codec, b"not zstd").is_err());
    }
}
