//! Little-endian bit streams over dword arrays.
//!
//! Packed node formats address fields by absolute bit position, bit 0 being
//! the least significant bit of dword 0. Fields may straddle dword
//! boundaries.

/// Write `bits` low bits of `value` at bit `offset`.
#[inline]
pub fn set_bits(words: &mut [u32], offset: u32, bits: u32, value: u32) {
    debug_assert!(bits <= 32);
    if bits == 0 {
        return;
    }
    let mask = if bits == 32 { u32::MAX } else { (1u32 << bits) - 1 };
    let value = value & mask;

    let word = (offset / 32) as usize;
    let shift = offset % 32;

    let wide_mask = (mask as u64) << shift;
    let wide_value = (value as u64) << shift;

    words[word] = (words[word] & !(wide_mask as u32)) | wide_value as u32;
    if shift + bits > 32 {
        let hi_mask = (wide_mask >> 32) as u32;
        words[word + 1] = (words[word + 1] & !hi_mask) | (wide_value >> 32) as u32;
    }
}

/// Read `bits` bits at bit `offset`.
#[inline]
pub fn get_bits(words: &[u32], offset: u32, bits: u32) -> u32 {
    debug_assert!(bits <= 32);
    if bits == 0 {
        return 0;
    }
    let word = (offset / 32) as usize;
    let shift = offset % 32;

    let mut wide = (words[word] as u64) >> shift;
    if shift + bits > 32 {
        wide |= (words[word + 1] as u64) << (32 - shift);
    }
    let mask = if bits == 32 { u32::MAX as u64 } else { (1u64 << bits) - 1 };
    (wide & mask) as u32
}

/// Sequential writer appending fields from a start bit.
pub struct BitWriter<'a> {
    words: &'a mut [u32],
    pos: u32,
}

impl<'a> BitWriter<'a> {
    pub fn new(words: &'a mut [u32], pos: u32) -> Self {
        Self { words, pos }
    }

    /// Append `bits` low bits of `value`.
    #[inline]
    pub fn write(&mut self, value: u32, bits: u32) {
        set_bits(self.words, self.pos, bits, value);
        self.pos += bits;
    }

    /// Current bit position.
    #[inline]
    pub fn position(&self) -> u32 {
        self.pos
    }

    /// Jump to an absolute bit position.
    #[inline]
    pub fn seek(&mut self, pos: u32) {
        self.pos = pos;
    }
}

/// Sequential reader, the inverse of [`BitWriter`].
pub struct BitReader<'a> {
    words: &'a [u32],
    pos: u32,
}

impl<'a> BitReader<'a> {
    pub fn new(words: &'a [u32], pos: u32) -> Self {
        Self { words, pos }
    }

    #[inline]
    pub fn read(&mut self, bits: u32) -> u32 {
        let v = get_bits(self.words, self.pos, bits);
        self.pos += bits;
        v
    }

    #[inline]
    pub fn position(&self) -> u32 {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straddling_field() {
        let mut words = [0u32; 2];
        set_bits(&mut words, 28, 8, 0xab);
        assert_eq!(words[0], 0xb000_0000);
        assert_eq!(words[1], 0x0000_000a);
        assert_eq!(get_bits(&words, 28, 8), 0xab);
    }

    #[test]
    fn test_neighbours_untouched() {
        let mut words = [u32::MAX; 3];
        set_bits(&mut words, 40, 12, 0);
        assert_eq!(get_bits(&words, 40, 12), 0);
        assert_eq!(get_bits(&words, 32, 8), 0xff);
        assert_eq!(get_bits(&words, 52, 12), 0xfff);
        assert_eq!(words[0], u32::MAX);
        assert_eq!(words[2], u32::MAX);
    }

    #[test]
    fn test_writer_reader_sequence() {
        let mut words = [0u32; 4];
        let mut w = BitWriter::new(&mut words, 3);
        w.write(31, 5);
        w.write(0x1234_5678, 32);
        w.write(1, 1);
        w.write(0xfff_ffff, 28);
        assert_eq!(w.position(), 3 + 5 + 32 + 1 + 28);

        let mut r = BitReader::new(&words, 3);
        assert_eq!(r.read(5), 31);
        assert_eq!(r.read(32), 0x1234_5678);
        assert_eq!(r.read(1), 1);
        assert_eq!(r.read(28), 0xfff_ffff);
    }
}
