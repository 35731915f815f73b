use super::descriptor::SegmentLocation;
use crate::error::{Error, Result};
use crate::record::{Key, Update};
use crate::storage::{BlockHandle, BlockStorage};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Serialized segment layout: `count:u32` then `count` entries of
/// `{key_len:u32, key, update_len:u32, update}`, in ascending key order.
pub fn write_segment(
    storage: &dyn BlockStorage,
    entries: &[(Key, Update)],
) -> Result<BlockHandle> {
    debug_assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));

    let mut buf = Vec::new();
    let mut scratch = [0u8; 4];
    LittleEndian::write_u32(&mut scratch, entries.len() as u32);
    buf.extend_from_slice(&scratch);
    for (key, update) in entries {
        let key_bytes = key.encode();
        let update_bytes = update.encode();
        LittleEndian::write_u32(&mut scratch, key_bytes.len() as u32);
        buf.extend_from_slice(&scratch);
        buf.extend_from_slice(&key_bytes);
        LittleEndian::write_u32(&mut scratch, update_bytes.len() as u32);
        buf.extend_from_slice(&scratch);
        buf.extend_from_slice(&update_bytes);
    }

    let handle = storage.allocate(buf.len() as u64)?;
    storage.write_at(handle, 0, &buf)?;
    storage.sync()?;
    tracing::debug!(addr = handle.addr, entries = entries.len(), "segment written");
    Ok(handle)
}

/// An immutable, fully-loaded segment. Loading happens once; afterwards every
/// read is against the in-memory sorted entries, so one reader instance can
/// serve any number of threads without a shared cursor.
pub struct SegmentReader {
    entries: Vec<(Key, Update)>,
}

impl SegmentReader {
    pub fn load(storage: &dyn BlockStorage, location: &SegmentLocation) -> Result<SegmentReader> {
        let handle = storage.open_existing(location.addr)?;
        if location.len > handle.size {
            return Err(Error::Corruption(format!(
                "segment at {} claims {} bytes, block holds {}",
                location.addr, location.len, handle.size
            )));
        }
        let mut buf = vec![0u8; location.len as usize];
        storage.read_at(handle, 0, &mut buf)?;

        let truncated = || Error::Corruption(format!("truncated segment at {}", location.addr));
        let mut reader: &[u8] = &buf;
        let take = |reader: &mut &[u8], n: usize| -> Result<Vec<u8>> {
            if reader.len() < n {
                return Err(truncated());
            }
            let (taken, rest) = reader.split_at(n);
            *reader = rest;
            Ok(taken.to_vec())
        };
        let take_u32 = |reader: &mut &[u8]| -> Result<u32> {
            if reader.len() < 4 {
                return Err(truncated());
            }
            let value = LittleEndian::read_u32(reader);
            *reader = &reader[4..];
            Ok(value)
        };

        let count = take_u32(&mut reader)? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key_len = take_u32(&mut reader)? as usize;
            let key = Key::decode(&take(&mut reader, key_len)?)?;
            let update_len = take_u32(&mut reader)? as usize;
            let update = Update::decode(&take(&mut reader, update_len)?)?;
            if let Some((last, _)) = entries.last() {
                if *last >= key {
                    return Err(Error::Corruption(format!(
                        "segment at {} is not sorted: {} then {}",
                        location.addr, last, key
                    )));
                }
            }
            entries.push((key, update));
        }
        Ok(SegmentReader { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(Key, Update)] {
        &self.entries
    }

    /// First and last key actually present.
    pub fn span(&self) -> Option<(&Key, &Key)> {
        match (self.entries.first(), self.entries.last()) {
            (Some((first, _)), Some((last, _))) => Some((first, last)),
            _ => None,
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Update> {
        self.entries
            .binary_search_by(|(k, _)| k.cmp(key))
            .ok()
            .map(|idx| &self.entries[idx].1)
    }

    /// Entries from `key` onwards (forward) or backwards, honoring
    /// inclusivity of the starting key.
    pub fn iter_from<'a>(
        &'a self,
        key: &Key,
        forward: bool,
        inclusive: bool,
    ) -> Box<dyn Iterator<Item = &'a (Key, Update)> + 'a> {
        let idx = self.entries.partition_point(|(k, _)| {
            if forward == inclusive {
                k < key
            } else {
                k <= key
            }
        });
        if forward {
            Box::new(self.entries[idx..].iter())
        } else {
            Box::new(self.entries[..idx].iter().rev())
        }
    }
}

/// Shared cache of opened segment readers, keyed by the descriptor key the
/// segment is registered under. Entries are dropped when a segment is
/// unmapped so stale readers cannot outlive their registration.
pub struct SegmentCache {
    storage: Arc<dyn BlockStorage>,
    readers: Mutex<HashMap<Key, (SegmentLocation, Arc<SegmentReader>)>>,
}

impl SegmentCache {
    pub fn new(storage: Arc<dyn BlockStorage>) -> SegmentCache {
        SegmentCache {
            storage,
            readers: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(&self, descriptor: &Key, location: &SegmentLocation) -> Result<Arc<SegmentReader>> {
        if let Some((cached, reader)) = self.readers.lock().unwrap().get(descriptor) {
            // A re-registration can reuse a storage key for a different
            // segment; the cached reader is only valid for the location it
            // was loaded from.
            if cached.addr == location.addr {
                return Ok(reader.clone());
            }
        }
        let reader = Arc::new(SegmentReader::load(self.storage.as_ref(), location)?);
        self.readers
            .lock()
            .unwrap()
            .insert(descriptor.clone(), (*location, reader.clone()));
        Ok(reader)
    }

    pub fn invalidate(&self, descriptor: &Key) {
        self.readers.lock().unwrap().remove(descriptor);
    }

    #[cfg(test)]
    pub fn cached(&self) -> usize {
        self.readers.lock().unwrap().len()
    }
}
