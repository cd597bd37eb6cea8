//! MSB-first bit reader with Exp-Golomb support, for parameter-set parsing.

use vs_common::DemuxError;

pub struct BitReader<'a> {
    data: &'a [u8],
    /// Position in bits.
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Byte offset of the next unread bit.
    pub fn byte_pos(&self) -> usize {
        self.pos / 8
    }

    pub fn bits_left(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.pos)
    }

    pub fn read_bit(&mut self) -> Result<bool, DemuxError> {
        let byte = *self.data.get(self.pos / 8).ok_or(DemuxError::TruncatedData {
            expected: self.pos / 8 + 1,
            got: self.data.len(),
        })?;
        let bit = (byte >> (7 - (self.pos % 8))) & 1;
        self.pos += 1;
        Ok(bit == 1)
    }

    /// Read `n` bits (n <= 32) as an unsigned integer.
    pub fn read_bits(&mut self, n: u32) -> Result<u32, DemuxError> {
        debug_assert!(n <= 32);
        let mut val: u32 = 0;
        for _ in 0..n {
            val = (val << 1) | self.read_bit()? as u32;
        }
        Ok(val)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), DemuxError> {
        if n > self.bits_left() {
            return Err(DemuxError::TruncatedData {
                expected: (self.pos + n).div_ceil(8),
                got: self.data.len(),
            });
        }
        self.pos += n;
        Ok(())
    }

    /// Unsigned Exp-Golomb (`ue(v)`).
    pub fn read_ue(&mut self) -> Result<u32, DemuxError> {
        let mut leading_zeros = 0u32;
        while !self.read_bit()? {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(DemuxError::InvalidStructure {
                    offset: (self.pos / 8) as u64,
                    reason: "Exp-Golomb code longer than 32 bits".into(),
                });
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zeros)?;
        Ok(((1u64 << leading_zeros) - 1 + suffix as u64) as u32)
    }

    /// Signed Exp-Golomb (`se(v)`).
    pub fn read_se(&mut self) -> Result<i32, DemuxError> {
        let k = self.read_ue()? as i64;
        let val = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        Ok(val as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_bits_msb_first() {
        let mut r = BitReader::new(&[0b1010_0000, 0xFF]);
        assert!(r.read_bit().unwrap());
        assert!(!r.read_bit().unwrap());
        assert_eq!(r.read_bits(2).unwrap(), 0b10);
        r.skip(4).unwrap();
        assert_eq!(r.read_bits(8).unwrap(), 0xFF);
        assert!(r.read_bit().is_err());
    }

    #[test]
    fn exp_golomb() {
        // ue: 1 -> 0, 010 -> 1, 011 -> 2, 00100 -> 3
        // bits: 1 010 011 00100 (+ padding)
        let mut r = BitReader::new(&[0b1010_0110, 0b0100_0000]);
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 1);
        assert_eq!(r.read_ue().unwrap(), 2);
        assert_eq!(r.read_ue().unwrap(), 3);
    }

    #[test]
    fn signed_exp_golomb() {
        // se: 010 -> +1, 011 -> -1, 00100 -> +2
        let mut r = BitReader::new(&[0b0100_1100, 0b1000_0000]);
        assert_eq!(r.read_se().unwrap(), 1);
        assert_eq!(r.read_se().unwrap(), -1);
        assert_eq!(r.read_se().unwrap(), 2);
    }

    #[test]
    fn skip_past_end_fails() {
        let mut r = BitReader::new(&[0]);
        assert!(r.skip(9).is_err());
        assert_eq!(r.bits_left(), 8);
    }
}
