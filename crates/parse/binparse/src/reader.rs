//! Bounds-checked byte cursor.

use crate::bytes::FromBytes;

/// A forward-only cursor over a byte slice.
///
/// All accesses are bounds-checked; reading past the end yields `None` and
/// skipping past the end clamps to the end of the slice.
pub struct BinaryReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> BinaryReader<'a> {
    /// Create a reader positioned at the start of `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Current offset from the start of the underlying slice.
    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Total length of the underlying slice.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the underlying slice is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns `true` if the cursor has reached the end of the slice.
    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.position >= self.data.len()
    }

    /// The full underlying slice, regardless of cursor position.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// The bytes from the cursor to the end of the slice.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.position.min(self.data.len())..]
    }

    /// Look at the next byte without advancing.
    #[must_use]
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.position).copied()
    }

    /// Advance the cursor by `count` bytes, clamping at the end.
    pub fn skip(&mut self, count: usize) {
        self.position = self.position.saturating_add(count).min(self.data.len());
    }

    /// Read a value at the cursor and advance past it.
    ///
    /// Returns `None` without advancing if fewer than `T::SIZE` bytes
    /// remain.
    pub fn read<T: FromBytes>(&mut self) -> Option<T> {
        let value = T::read_from(self.remaining())?;
        self.position += T::SIZE;
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_reads() {
        let data = [0x01, 0x02, 0x00, 0xEF, 0xBE, 0xAD, 0xDE];
        let mut r = BinaryReader::new(&data);
        assert_eq!(r.read::<u8>(), Some(0x01));
        assert_eq!(r.read::<u16>(), Some(0x0002));
        assert_eq!(r.read::<u32>(), Some(0xDEAD_BEEF));
        assert!(r.is_at_end());
        assert_eq!(r.read::<u8>(), None);
    }

    #[test]
    fn peek_does_not_advance() {
        let data = [0xAB, 0xCD];
        let mut r = BinaryReader::new(&data);
        assert_eq!(r.peek(), Some(0xAB));
        assert_eq!(r.position(), 0);
        r.skip(1);
        assert_eq!(r.peek(), Some(0xCD));
    }

    #[test]
    fn skip_clamps_to_end() {
        let data = [0u8; 4];
        let mut r = BinaryReader::new(&data);
        r.skip(100);
        assert_eq!(r.position(), 4);
        assert!(r.remaining().is_empty());
    }

    #[test]
    fn short_read_leaves_position() {
        let data = [0x01, 0x02];
        let mut r = BinaryReader::new(&data);
        r.skip(1);
        assert_eq!(r.read::<u32>(), None);
        assert_eq!(r.position(), 1);
    }
}
