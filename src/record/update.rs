use crate::error::{Error, Result};

const TAG_FULL: u8 = 0x01;
const TAG_TOMBSTONE: u8 = 0x02;
const TAG_PARTIAL: u8 = 0x03;
const TAG_NONE: u8 = 0x04;

/// A single write against a key, as stored in layers and segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Complete replacement value.
    Full(Vec<u8>),
    /// Deletion marker. Retained so it can shadow older live values.
    Tombstone,
    /// Partial (in-place) update. Reserved, not implemented.
    Partial(Vec<u8>),
    /// Explicit absence.
    None,
}

impl Update {
    /// One tag byte followed by the raw payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Update::Full(payload) => {
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(TAG_FULL);
                buf.extend_from_slice(payload);
                buf
            }
            Update::Tombstone => vec![TAG_TOMBSTONE],
            Update::Partial(payload) => {
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(TAG_PARTIAL);
                buf.extend_from_slice(payload);
                buf
            }
            Update::None => vec![TAG_NONE],
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Update> {
        let (&tag, payload) = bytes
            .split_first()
            .ok_or_else(|| Error::Corruption("empty update".into()))?;
        match tag {
            TAG_FULL => Ok(Update::Full(payload.to_vec())),
            TAG_TOMBSTONE => Ok(Update::Tombstone),
            TAG_PARTIAL => Ok(Update::Partial(payload.to_vec())),
            TAG_NONE => Ok(Update::None),
            other => Err(Error::Corruption(format!("unknown update tag {:#04x}", other))),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Update::Tombstone)
    }
}
