use crate::error::SequencingError;
use crate::message::option::{decode_uint, encode_uint};

/// Largest block number the 20 bit NUM field holds.
pub const MAX_BLOCK_NUM: u32 = (1 << 20) - 1;

/// Value of a Block1 or Block2 option (RFC 7959 §2.2).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub size_exponent: u8,
}

impl BlockValue {
    /// Builds a block value, rounding `size` down to a valid block size.
    pub fn new(num: usize, more: bool, size: usize) -> Result<Self, SequencingError> {
        if size < 16 {
            return Err(SequencingError::InvalidBlockValue);
        }
        let size = size.min(1024);
        let true_size_exponent =
            Self::largest_power_of_2_not_in_excess(size).ok_or(SequencingError::InvalidBlockValue)?;
        let size_exponent = u8::try_from(true_size_exponent.saturating_sub(4))
            .map_err(|_| SequencingError::InvalidBlockValue)?;
        let num = u32::try_from(num)
            .ok()
            .filter(|n| *n <= MAX_BLOCK_NUM)
            .ok_or(SequencingError::InvalidBlockValue)?;
        Ok(Self {
            num,
            more,
            size_exponent,
        })
    }

    /// Finds the largest power of 2 that does not exceed `target`.
    fn largest_power_of_2_not_in_excess(target: usize) -> Option<u32> {
        if target == 0 {
            return None;
        }
        Some(usize::BITS - 1 - target.leading_zeros())
    }

    pub fn size(&self) -> usize {
        1 << (self.size_exponent + 4)
    }

    /// Byte offset of the block's first byte in the whole body.
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    /// Parses an option value; SZX 7 is reserved.
    pub fn from_option(value: &[u8]) -> Result<Self, SequencingError> {
        let scalar = decode_uint(value)
            .filter(|_| value.len() <= 3)
            .ok_or(SequencingError::InvalidBlockValue)?;
        let size_exponent = (scalar & 0x7) as u8;
        if size_exponent == 7 {
            return Err(SequencingError::InvalidBlockValue);
        }
        Ok(Self {
            num: scalar >> 4,
            more: scalar >> 3 & 0x1 == 0x1,
            size_exponent,
        })
    }

    pub fn to_option(&self) -> Vec<u8> {
        encode_uint(self.num << 4 | u32::from(self.more) << 3 | u32::from(self.size_exponent & 0x7))
    }

    /// The block of `body` this value names, with `more` set from the body's
    /// length. `None` when the block starts past the end.
    pub fn slice<'a>(&self, body: &'a [u8]) -> Option<(BlockValue, &'a [u8])> {
        let start = self.offset();
        if start > body.len() || (start == body.len() && start != 0) {
            return None;
        }
        let end = (start + self.size()).min(body.len());
        let block = BlockValue {
            more: end < body.len(),
            ..*self
        };
        Some((block, &body[start..end]))
    }
}

impl From<BlockValue> for Vec<u8> {
    fn from(block_value: BlockValue) -> Vec<u8> {
        block_value.to_option()
    }
}

impl TryFrom<&[u8]> for BlockValue {
    type Error = SequencingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        BlockValue::from_option(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_block_value() {
        let block = BlockValue::new(3, true, 64).unwrap();
        assert_eq!(block.size_exponent, 2);
        assert_eq!(block.offset(), 192);
        assert_eq!(block.to_option(), vec![0x3A]);
        assert_eq!(BlockValue::from_option(&[0x3A]).unwrap(), block);

        let block = BlockValue::new(0, false, 1000).unwrap();
        assert_eq!(block.size(), 512);
        assert_eq!(block.to_option(), vec![0x05]);
        assert_eq!(BlockValue::new(0, false, 4096).unwrap().size(), 1024);

        let last = BlockValue::new(MAX_BLOCK_NUM as usize, false, 16).unwrap();
        assert_eq!(last.to_option(), vec![0xFF, 0xFF, 0xF0]);
        assert!(BlockValue::new(MAX_BLOCK_NUM as usize + 1, false, 16).is_err());
        assert!(BlockValue::new(0, false, 8).is_err());
    }

    #[test]
    fn test_invalid_option() {
        assert_eq!(
            BlockValue::from_option(&[0x07]),
            Err(SequencingError::InvalidBlockValue)
        );
        assert_eq!(
            BlockValue::from_option(&[0, 0, 0, 1]),
            Err(SequencingError::InvalidBlockValue)
        );
        assert_eq!(
            BlockValue::from_option(&[]).unwrap(),
            BlockValue {
                num: 0,
                more: false,
                size_exponent: 0
            }
        );
    }

    #[test]
    fn test_slice() {
        let body: Vec<u8> = (0..150u8).collect();
        let (block, chunk) = BlockValue::new(0, false, 64).unwrap().slice(&body).unwrap();
        assert!(block.more);
        assert_eq!(chunk, &body[..64]);

        let (block, chunk) = BlockValue::new(2, true, 64).unwrap().slice(&body).unwrap();
        assert!(!block.more);
        assert_eq!(chunk.len(), 22);
        assert_eq!(block.offset(), 128);

        let (block, chunk) = BlockValue::new(0, true, 64).unwrap().slice(&[]).unwrap();
        assert!(!block.more);
        assert!(chunk.is_empty());

        let block = BlockValue::new(3, false, 64).unwrap();
        assert!(block.slice(&body).is_none());
    }
}
