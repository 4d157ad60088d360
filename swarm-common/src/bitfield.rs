//! Piece availability bitmap

/// Fixed-length bitmap with one bit per piece, most significant bit first
///
/// Spare bits in the last byte are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Create an empty bitfield for `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Create a bitfield with every piece present
    pub fn full(len: usize) -> Self {
        let mut field = Self::new(len);
        for index in 0..len {
            field.set(index);
        }
        field
    }

    /// Rebuild from wire bytes
    ///
    /// Returns `None` if the byte count does not match `len` or any spare
    /// bit in the last byte is set.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Option<Self> {
        if bytes.len() != len.div_ceil(8) {
            return None;
        }
        let spare = bytes.len() * 8 - len;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes.last().is_some_and(|last| last & mask != 0) {
                return None;
            }
        }
        Some(Self {
            bits: bytes.to_vec(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether piece `index` is present; out-of-range indexes are absent
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Mark piece `index` present; out-of-range indexes are ignored
    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] |= 0x80 >> (index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] &= !(0x80 >> (index % 8));
        }
    }

    /// Number of pieces present
    pub fn count(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
