//! In-process model of the fuzz byte-stream provider.
//!
//! Consumes from the front of the buffer. Once the input is exhausted every
//! method still returns a value (zero, `false`, empty string, or the low end
//! of the float range), so decoding never fails.

/// Deterministic typed view over raw fuzz bytes.
#[derive(Debug, Clone)]
pub struct FuzzedDataProvider<'a> {
    data: &'a [u8],
}

impl<'a> FuzzedDataProvider<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Take up to `count` bytes from the front.
    pub fn consume_bytes(&mut self, count: usize) -> &'a [u8] {
        let count = count.min(self.data.len());
        let (head, tail) = self.data.split_at(count);
        self.data = tail;
        head
    }

    /// Signed little-endian integer of at most `width` bytes (capped at 8),
    /// sign-extended from the number of bytes actually read.
    pub fn consume_int(&mut self, width: usize) -> i64 {
        let bytes = self.consume_bytes(width.min(8));
        if bytes.is_empty() {
            return 0;
        }
        let mut raw = 0u64;
        for (i, byte) in bytes.iter().enumerate() {
            raw |= u64::from(*byte) << (8 * i);
        }
        let bits = 8 * bytes.len() as u32;
        if bits == 64 {
            raw as i64
        } else {
            let shift = 64 - bits;
            ((raw << shift) as i64) >> shift
        }
    }

    pub fn consume_bool(&mut self) -> bool {
        self.consume_bytes(1).first().is_some_and(|b| b & 1 == 1)
    }

    /// String of at most `max_chars` characters.
    ///
    /// The first byte selects the encoding: bit 0 clear means ASCII (each
    /// byte masked to 7 bits), else bit 1 clear means UTF-16LE, else UTF-32LE.
    /// Invalid code units decode to U+FFFD.
    pub fn consume_string(&mut self, max_chars: usize) -> String {
        let Some(&spec) = self.consume_bytes(1).first() else {
            return String::new();
        };

        if spec & 1 == 0 {
            return self
                .consume_bytes(max_chars)
                .iter()
                .map(|b| char::from(b & 0x7f))
                .collect();
        }

        if spec & 2 == 0 {
            let bytes = self.consume_bytes(max_chars.saturating_mul(2));
            let units = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
            return char::decode_utf16(units)
                .map(|unit| unit.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect();
        }

        let bytes = self.consume_bytes(max_chars.saturating_mul(4));
        bytes
            .chunks_exact(4)
            .map(|quad| {
                let unit = u32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
                char::from_u32(unit).unwrap_or(char::REPLACEMENT_CHARACTER)
            })
            .collect()
    }

    /// Value in `[0, 1]` from an 8-byte integer.
    pub fn consume_probability(&mut self) -> f64 {
        let raw = self.consume_int(8) as u64;
        raw as f64 / u64::MAX as f64
    }

    /// Finite float anywhere in `[f64::MIN, f64::MAX]`.
    ///
    /// The range is too wide to represent directly, so it is split in two
    /// halves chosen by one boolean, then scaled by a probability.
    pub fn consume_regular_float(&mut self) -> f64 {
        let (min, max) = (f64::MIN, f64::MAX);
        let range = max / 2.0 - min / 2.0;
        let mut result = min;
        if self.consume_bool() {
            result += range;
        }
        let value = result + range * self.consume_probability();
        value.clamp(min, max)
    }
}
