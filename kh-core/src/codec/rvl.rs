//! RVL spatial compression for 16-bit depth arrays.
//!
//! The input is scanned as alternating runs of zeros and non-zeros.
//! Every run length, and every non-zero value (as the zig-zag encoded
//! difference from the previous non-zero value), is written as a
//! variable-length code of 3-bit groups with a continuation bit.
//! Codes are packed eight nibbles per little-endian `u32` word, most
//! significant nibble first.
//!
//! ```text
//! nibble:  c b b b      c = more groups follow, bbb = 3 value bits
//! stream:  zeros nonzeros v0 v1 .. zeros nonzeros v0 ..
//! ```

use crate::error::KhError;

/// Nibbles packed into one output word.
const NIBBLES_PER_WORD: u32 = 8;

/// Compress `input` into an RVL byte stream.
///
/// The output length is always a multiple of four bytes.
pub fn compress(input: &[i16]) -> Vec<u8> {
    let mut writer = NibbleWriter::with_capacity(input.len());
    let mut previous: i32 = 0;
    let mut i = 0;

    while i < input.len() {
        let zeros_start = i;
        while i < input.len() && input[i] == 0 {
            i += 1;
        }
        writer.put_vle((i - zeros_start) as u32);

        let nonzeros_start = i;
        while i < input.len() && input[i] != 0 {
            i += 1;
        }
        writer.put_vle((i - nonzeros_start) as u32);

        for &value in &input[nonzeros_start..i] {
            let current = i32::from(value);
            writer.put_vle(zigzag(current - previous));
            previous = current;
        }
    }

    writer.finish()
}

/// Decompress an RVL byte stream holding exactly `pixel_count` values.
pub fn decompress(input: &[u8], pixel_count: usize) -> Result<Vec<i16>, KhError> {
    let mut reader = NibbleReader::new(input);
    let mut output = Vec::with_capacity(pixel_count);
    let mut previous: i32 = 0;

    while output.len() < pixel_count {
        let zeros = reader.get_vle()? as usize;
        if zeros > pixel_count - output.len() {
            return Err(KhError::Codec(format!(
                "rvl zero run of {zeros} overflows {pixel_count} pixels"
            )));
        }
        output.resize(output.len() + zeros, 0);

        let nonzeros = reader.get_vle()? as usize;
        if nonzeros > pixel_count - output.len() {
            return Err(KhError::Codec(format!(
                "rvl value run of {nonzeros} overflows {pixel_count} pixels"
            )));
        }
        for _ in 0..nonzeros {
            let delta = unzigzag(reader.get_vle()?);
            let current = previous
                .checked_add(delta)
                .ok_or_else(|| KhError::Codec(format!("rvl delta {delta} overflows")))?;
            let value = i16::try_from(current)
                .map_err(|_| KhError::Codec(format!("rvl value {current} out of range")))?;
            output.push(value);
            previous = current;
        }
    }

    Ok(output)
}

// ── Internal ─────────────────────────────────────────────────────

fn zigzag(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

fn unzigzag(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

struct NibbleWriter {
    out: Vec<u8>,
    word: u32,
    nibbles: u32,
}

impl NibbleWriter {
    fn with_capacity(pixels: usize) -> Self {
        Self {
            out: Vec::with_capacity(pixels),
            word: 0,
            nibbles: 0,
        }
    }

    fn put_vle(&mut self, mut value: u32) {
        loop {
            let mut nibble = value & 0x7;
            value >>= 3;
            if value != 0 {
                nibble |= 0x8;
            }
            self.word = (self.word << 4) | nibble;
            self.nibbles += 1;
            if self.nibbles == NIBBLES_PER_WORD {
                self.flush_word();
            }
            if value == 0 {
                break;
            }
        }
    }

    fn flush_word(&mut self) {
        self.out.extend_from_slice(&self.word.to_le_bytes());
        self.word = 0;
        self.nibbles = 0;
    }

    fn finish(mut self) -> Vec<u8> {
        if self.nibbles > 0 {
            self.word <<= 4 * (NIBBLES_PER_WORD - self.nibbles);
            self.flush_word();
        }
        self.out
    }
}

struct NibbleReader<'a> {
    input: &'a [u8],
    pos: usize,
    word: u32,
    nibbles: u32,
}

impl<'a> NibbleReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            word: 0,
            nibbles: 0,
        }
    }

    fn next_nibble(&mut self) -> Result<u32, KhError> {
        if self.nibbles == 0 {
            let bytes = self
                .input
                .get(self.pos..self.pos + 4)
                .ok_or_else(|| KhError::Codec("rvl stream truncated".into()))?;
            self.word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            self.pos += 4;
            self.nibbles = NIBBLES_PER_WORD;
        }
        let nibble = self.word >> 28;
        self.word <<= 4;
        self.nibbles -= 1;
        Ok(nibble)
    }

    fn get_vle(&mut self) -> Result<u32, KhError> {
        let mut value = 0u32;
        let mut shift = 0u32;
        loop {
            if shift > 30 {
                return Err(KhError::Codec("rvl code too long".into()));
            }
            let nibble = self.next_nibble()?;
            value |= (nibble & 0x7) << shift;
            shift += 3;
            if nibble & 0x8 == 0 {
                return Ok(value);
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn roundtrip_mixed_runs() {
        let input = [0, 0, 0, 1200, 1201, 1199, 0, 0, 4000, -3, 0];
        let packed = compress(&input);
        assert_eq!(packed.len() % 4, 0);
        assert_eq!(decompress(&packed, input.len()).unwrap(), input);
    }

    #[test]
    fn empty_input() {
        assert!(compress(&[]).is_empty());
        assert!(decompress(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn zeros_compress_to_one_word() {
        let input = vec![0i16; 10_000];
        let packed = compress(&input);
        assert_eq!(packed.len(), 4);
        assert_eq!(decompress(&packed, input.len()).unwrap(), input);
    }

    #[test]
    fn extreme_values() {
        let input = [i16::MIN, i16::MAX, i16::MIN, -1, 1];
        let packed = compress(&input);
        assert_eq!(decompress(&packed, input.len()).unwrap(), input);
    }

    #[test]
    fn truncated_stream_is_error() {
        let input: Vec<i16> = (1..200).collect();
        let packed = compress(&input);
        let result = decompress(&packed[..packed.len() - 4], input.len());
        assert!(matches!(result, Err(KhError::Codec(_))));
    }

    #[test]
    fn overlong_run_is_error() {
        let packed = compress(&[0i16; 16]);
        assert!(decompress(&packed, 8).is_err());
    }

    #[test]
    fn oversized_delta_is_error() {
        let mut writer = NibbleWriter::with_capacity(4);
        for code in [0, 2, zigzag(1), 0xFFFF_FFFE] {
            writer.put_vle(code);
        }
        let stream = writer.finish();
        assert!(matches!(decompress(&stream, 2), Err(KhError::Codec(_))));

        let mut writer = NibbleWriter::with_capacity(4);
        for code in [0, 2, zigzag(-1), 0xFFFF_FFFF] {
            writer.put_vle(code);
        }
        assert!(matches!(decompress(&writer.finish(), 2), Err(KhError::Codec(_))));
    }

    #[test]
    fn zigzag_symmetry() {
        for v in [-65535, -2, -1, 0, 1, 2, 65535] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
    }

    proptest! {
        #[test]
        fn prop_roundtrip(input in prop::collection::vec(any::<i16>(), 0..2048)) {
            let packed = compress(&input);
            prop_assert_eq!(decompress(&packed, input.len()).unwrap(), input);
        }

        #[test]
        fn prop_sparse_roundtrip(
            input in prop::collection::vec(prop_oneof![3 => Just(0i16), 1 => 1..3000i16], 0..4096)
        ) {
            let packed = compress(&input);
            prop_assert_eq!(decompress(&packed, input.len()).unwrap(), input);
        }
    }
}
