use crate::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::Crc;

pub const ROOT_MAGIC: u32 = 0xFE82_A292;

/// Fixed part of the root block: magic, checksum, segment count.
pub const ROOT_FIXED_SIZE: usize = 12;

/// Slot capacity reserved in the root region, so the table can grow without
/// relocating the block.
pub const MAX_SEGMENT_SLOTS: usize = 64;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// One segment descriptor in the root block: where the segment lives and how
/// large it is. Slot order is not chronological; recovery orders segments by
/// their first packet's sequence number instead, so rotation never rewrites
/// the root block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSlot {
    pub start: u32,
    pub size: u32,
}

/// The log's root block: `magic, checksum, segment_count` followed by
/// `segment_count × {start, size}`. The checksum covers everything after
/// itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBlock {
    pub slots: Vec<SegmentSlot>,
}

impl RootBlock {
    pub fn new(slots: Vec<SegmentSlot>) -> Self {
        RootBlock { slots }
    }

    pub fn encoded_size(&self) -> usize {
        ROOT_FIXED_SIZE + self.slots.len() * 8
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + self.slots.len() * 8);
        body.write_u32::<LittleEndian>(self.slots.len() as u32)
            .expect("vec write cannot fail");
        for slot in &self.slots {
            body.write_u32::<LittleEndian>(slot.start).expect("vec write cannot fail");
            body.write_u32::<LittleEndian>(slot.size).expect("vec write cannot fail");
        }

        let mut buf = Vec::with_capacity(self.encoded_size());
        buf.write_u32::<LittleEndian>(ROOT_MAGIC).expect("vec write cannot fail");
        buf.write_u32::<LittleEndian>(CRC32.checksum(&body))
            .expect("vec write cannot fail");
        buf.extend_from_slice(&body);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<RootBlock> {
        let mut reader = bytes;
        let magic = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Corruption(format!("truncated root block: {}", e)))?;
        if magic != ROOT_MAGIC {
            return Err(Error::Corruption(format!(
                "bad root block magic {:#010x}",
                magic
            )));
        }
        let stored_checksum = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Corruption(format!("truncated root block: {}", e)))?;
        let count = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Corruption(format!("truncated root block: {}", e)))?
            as usize;
        if count > MAX_SEGMENT_SLOTS {
            return Err(Error::Corruption(format!(
                "root block claims {} segments (limit {})",
                count, MAX_SEGMENT_SLOTS
            )));
        }

        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            let start = reader
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::Corruption(format!("truncated segment slot: {}", e)))?;
            let size = reader
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::Corruption(format!("truncated segment slot: {}", e)))?;
            slots.push(SegmentSlot { start, size });
        }

        // Re-derive the checksum from the decoded table.
        let block = RootBlock { slots };
        let reencoded = block.encode();
        let computed = CRC32.checksum(&reencoded[8..]);
        if computed != stored_checksum {
            return Err(Error::Corruption(format!(
                "root block checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored_checksum, computed
            )));
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let block = RootBlock::new(vec![
            SegmentSlot { start: 532, size: 2 * 1024 * 1024 },
            SegmentSlot { start: 2_097_684, size: 2 * 1024 * 1024 },
        ]);
        let encoded = block.encode();
        assert_eq!(encoded.len(), block.encoded_size());
        assert_eq!(RootBlock::decode(&encoded).expect("decode failed"), block);
    }

    #[test]
    fn test_magic_is_bit_exact() {
        let block = RootBlock::new(vec![]);
        let encoded = block.encode();
        assert_eq!(&encoded[..4], &0xFE82_A292u32.to_le_bytes());
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let mut encoded = RootBlock::new(vec![]).encode();
        encoded[0] ^= 0xff;
        match RootBlock::decode(&encoded) {
            Err(Error::Corruption(_)) => {}
            other => panic!("expected Corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_flipped_slot_byte_is_corruption() {
        let mut encoded = RootBlock::new(vec![SegmentSlot { start: 1, size: 2 }]).encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        match RootBlock::decode(&encoded) {
            Err(Error::Corruption(_)) => {}
            other => panic!("expected Corruption, got {:?}", other),
        }
    }
}
