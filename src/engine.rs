use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::flock::DirLock;
use crate::index::OrderedIndex;
use crate::rangemap::{
    generation_prefix, is_reserved, metadata_key, MergeCursor, RangeKey, RangeMap, ResolveStats,
    SegmentLocation,
};
use crate::record::{Key, MergedValue, Range, Update};
use crate::sequence::SequenceGenerator;
use crate::storage::{BlockStorage, FileStorage};
use crate::wal::{Command, WriteAheadLog, CMD_CHECKPOINT_DROP, CMD_CHECKPOINT_START};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

/// Logged write of one key/update pair.
pub const CMD_SET: u8 = 0x01;

/// The log root is always the first allocation in a fresh store file.
const LOG_ROOT_ADDR: u64 = crate::storage::REGION_HEADER_SIZE;

/// Embedded ordered storage engine: writes go through the write-ahead log
/// into an in-memory layer; flushed layers become immutable segments behind
/// range-map descriptors; reads resolve across all of it.
pub struct Engine {
    _lock: DirLock,
    storage: Arc<dyn BlockStorage>,
    wal: WriteAheadLog,
    rangemap: RangeMap,
    sequences: Arc<SequenceGenerator>,
    /// Newest first; slot zero is the writable layer.
    layers: RwLock<Vec<OrderedIndex>>,
    /// Serializes flush_layer/wrap_generation against each other.
    flush_lock: Mutex<()>,
    /// Commits hold this shared; freezing a layer holds it exclusively so no
    /// commit can span the freeze with its log write already durable but its
    /// layer apply still pending.
    commit_fence: RwLock<()>,
}

impl Engine {
    pub fn open<P: AsRef<Path>>(dir: P, config: EngineConfig) -> Result<Engine> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let lock = DirLock::acquire(dir)?;

        let file_storage = FileStorage::open(dir.join("store.db"))?;
        let fresh = file_storage.is_empty();
        let storage: Arc<dyn BlockStorage> = Arc::new(file_storage);
        let sequences = Arc::new(SequenceGenerator::new());
        let current = OrderedIndex::new();

        let wal = if fresh {
            WriteAheadLog::create(storage.clone(), sequences.clone(), config.wal_options())?
        } else {
            let mut receiver = |command: &Command| apply_command(&current, command);
            WriteAheadLog::open(
                storage.clone(),
                LOG_ROOT_ADDR,
                sequences.clone(),
                config.wal_options(),
                &mut receiver,
            )?
        };

        tracing::info!(
            path = %dir.display(),
            fresh,
            recovered = current.count(),
            "engine opened"
        );
        Ok(Engine {
            _lock: lock,
            rangemap: RangeMap::new(storage.clone()),
            storage,
            wal,
            sequences,
            layers: RwLock::new(vec![current]),
            flush_lock: Mutex::new(()),
            commit_fence: RwLock::new(()),
        })
    }

    /// Durably writes one update. The reserved descriptor namespace is the
    /// engine's own; callers cannot write under it.
    pub fn set_value(&self, key: Key, update: Update) -> Result<()> {
        let mut batch = self.batch();
        batch.put(key, update)?;
        batch.commit()
    }

    pub fn delete(&self, key: Key) -> Result<()> {
        self.set_value(key, Update::Tombstone)
    }

    /// Starts an atomic write group; nothing is visible or durable until
    /// [`WriteBatch::commit`].
    pub fn batch(&self) -> WriteBatch<'_> {
        WriteBatch {
            engine: self,
            writes: Vec::new(),
        }
    }

    /// Exact lookup. `NotFound` covers both absent and deleted keys.
    pub fn get(&self, key: &Key) -> Result<MergedValue> {
        match self.find_next(key, true) {
            Ok((found, value)) if found == *key => Ok(value),
            Ok(_) => Err(Error::NotFound),
            Err(e) => Err(e),
        }
    }

    pub fn find_next(&self, key: &Key, equal_ok: bool) -> Result<(Key, MergedValue)> {
        self.find_next_with_stats(key, equal_ok, &mut ResolveStats::new())
    }

    pub fn find_next_with_stats(
        &self,
        key: &Key,
        equal_ok: bool,
        stats: &mut ResolveStats,
    ) -> Result<(Key, MergedValue)> {
        self.rangemap.resolve(&self.snapshot(), key, true, equal_ok, stats)
    }

    pub fn find_prev(&self, key: &Key, equal_ok: bool) -> Result<(Key, MergedValue)> {
        self.find_prev_with_stats(key, equal_ok, &mut ResolveStats::new())
    }

    pub fn find_prev_with_stats(
        &self,
        key: &Key,
        equal_ok: bool,
        stats: &mut ResolveStats,
    ) -> Result<(Key, MergedValue)> {
        self.rangemap.resolve(&self.snapshot(), key, false, equal_ok, stats)
    }

    /// Lazy ascending scan over `[range.low, range.high]`, consistent with
    /// the layer list snapshotted at the call.
    pub fn scan_forward(&self, range: &Range) -> Result<MergeCursor> {
        self.rangemap.scan(&self.snapshot(), range, true)
    }

    pub fn scan_backward(&self, range: &Range) -> Result<MergeCursor> {
        self.rangemap.scan(&self.snapshot(), range, false)
    }

    /// Freezes the writable layer, persists it as a generation-0 segment and
    /// registers it in the range map, then checkpoints the log so the
    /// segments holding the flushed writes can be reclaimed.
    pub fn flush_layer(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().unwrap();

        let frozen = {
            let _fence = self.commit_fence.write().unwrap();
            {
                let set = self.layers.read().unwrap();
                if set[0].is_empty() {
                    return Ok(());
                }
            }
            // Snapshot the log first: every non-current log segment holds
            // only writes that are part of the layer frozen right after.
            self.wal.checkpoint_start()?;
            let mut set = self.layers.write().unwrap();
            let frozen = set[0].clone();
            set.insert(0, OrderedIndex::new());
            frozen
        };

        // Descriptor rows never become segment data. They are carried into
        // the fresh layer instead, so the live root descriptor set always
        // sits in memory and in the retained tail of the log, and a data
        // segment's bounds are always the literal span of its own keys.
        let mut data: Vec<(Key, Update)> = Vec::new();
        let mut writes: Vec<(Key, Update)> = Vec::new();
        for (key, update) in frozen.scan_forward(Range::all()) {
            if key == metadata_key() {
                continue;
            } else if is_reserved(&key) {
                writes.push((key, update));
            } else {
                data.push((key, update));
            }
        }

        let span = match (data.first(), data.last()) {
            (Some((low, _)), Some((high, _))) => Some((low.clone(), high.clone())),
            _ => None,
        };
        let registered = match span {
            Some((low, high)) => {
                let range = RangeKey::new(0, low, high)?;
                let entries = self.fold_superseded(&range, data)?;
                let handle = crate::rangemap::write_segment(self.storage.as_ref(), &entries)?;
                let location = SegmentLocation {
                    addr: handle.addr,
                    len: handle.size,
                    ordinal: self.sequences.next() as u64,
                };
                writes.push((range.storage_key(), Update::Full(location.encode()?)));
                Some((handle.addr, entries.len()))
            }
            None => None,
        };

        let maxgen = self.max_generation().max(1);
        writes.push((metadata_key(), Update::Full(encode_maxgen(maxgen)?)));
        self.commit(writes)?;
        self.wal.checkpoint_drop()?;
        self.wal.flush()?;

        // The registered segment plus the carried-forward descriptor rows
        // now serve everything the frozen layer held.
        {
            let mut set = self.layers.write().unwrap();
            set.retain(|layer| !layer.ptr_eq(&frozen));
        }
        if let Some((addr, entries)) = registered {
            tracing::info!(addr, entries, "layer flushed and registered");
        }
        Ok(())
    }

    /// A registration whose bounds match an existing live descriptor would
    /// shadow that row and strand its segment. Fold the superseded segment's
    /// entries in under the fresh ones so the replacement is complete.
    fn fold_superseded(
        &self,
        range: &RangeKey,
        data: Vec<(Key, Update)>,
    ) -> Result<Vec<(Key, Update)>> {
        let storage_key = range.storage_key();
        let previous = {
            let set = self.layers.read().unwrap();
            set.iter().find_map(|layer| layer.get(&storage_key).ok())
        };
        let bytes = match previous {
            Some(Update::Full(bytes)) => bytes,
            _ => return Ok(data),
        };
        let location = SegmentLocation::decode(&bytes)?;
        let reader = self.rangemap.open_segment(&storage_key, &location)?;
        let mut merged: BTreeMap<Key, Update> = reader.entries().iter().cloned().collect();
        for (key, update) in data {
            merged.insert(key, update);
        }
        self.rangemap.unmap(&storage_key);
        tracing::debug!(
            descriptor = %range,
            superseded = location.addr,
            "same-span registration folded the previous segment in"
        );
        Ok(merged.into_iter().collect())
    }

    /// Wraps every live generation-`g` descriptor into a single
    /// generation-`g+1` range-of-ranges descriptor, bounding root-level
    /// fan-out. Data stays where it is; only the descriptor rows move.
    pub fn wrap_generation(&self, generation: u32) -> Result<()> {
        let _guard = self.flush_lock.lock().unwrap();
        let layers = self.snapshot();

        // Live root descriptors always reside in the layers; wrapped copies
        // inside older wrapper segments are not roots and must not be
        // wrapped again.
        let prefix = generation_prefix(generation);
        let mut rows: BTreeMap<Key, Update> = BTreeMap::new();
        for layer in &layers {
            for (key, update) in layer.scan_forward(Range::prefixed(&prefix)) {
                rows.entry(key).or_insert(update);
            }
        }
        let entries: Vec<(Key, Update)> = rows
            .into_iter()
            .filter(|(_, update)| !update.is_tombstone())
            .collect();
        if entries.len() < 2 {
            return Ok(());
        }

        // The wrapper's bounds are child storage keys. Descriptors sort by
        // their low bound, so the first child carries the lowest unwrapped
        // bound, but the highest can belong to any child and is picked by
        // unwrapped span.
        let low = entries[0].0.clone();
        let mut high = low.clone();
        let mut extreme: Option<Key> = None;
        for (key, _) in &entries {
            let resolved = RangeKey::parse(key)?.resolved_high();
            if extreme.as_ref().map_or(true, |e| resolved > *e) {
                extreme = Some(resolved);
                high = key.clone();
            }
        }
        let wrapper = RangeKey::new(generation + 1, low, high)?;

        let wrapped: Vec<Key> = entries.iter().map(|(key, _)| key.clone()).collect();
        let entries = self.fold_superseded(&wrapper, entries)?;
        let handle = crate::rangemap::write_segment(self.storage.as_ref(), &entries)?;
        let location = SegmentLocation {
            addr: handle.addr,
            len: handle.size,
            ordinal: self.sequences.next() as u64,
        };

        let maxgen = self.max_generation().max(generation + 2);
        self.commit(vec![
            (wrapper.storage_key(), Update::Full(location.encode()?)),
            (metadata_key(), Update::Full(encode_maxgen(maxgen)?)),
        ])?;

        // The wrapper now stands in for the wrapped rows. Log replay can
        // resurrect them in the layer until the next flush; resurrected rows
        // deduplicate against the wrapper's interior copies.
        {
            let set = self.layers.read().unwrap();
            for layer in set.iter() {
                for key in &wrapped {
                    layer.remove(key);
                }
            }
        }
        tracing::info!(
            generation,
            wrapped = wrapped.len(),
            "generation wrapped into range-of-ranges descriptor"
        );
        Ok(())
    }

    /// Highest generation bound recorded in the metadata row.
    pub fn max_generation(&self) -> u32 {
        let set = self.layers.read().unwrap();
        for layer in set.iter() {
            if let Ok(Update::Full(bytes)) = layer.get(&metadata_key()) {
                if let Ok(g) = bincode::deserialize::<u32>(&bytes) {
                    return g;
                }
            }
        }
        0
    }

    /// Forces pending log writes down to the medium.
    pub fn sync(&self) -> Result<()> {
        self.wal.flush()
    }

    fn snapshot(&self) -> Vec<OrderedIndex> {
        self.layers.read().unwrap().clone()
    }

    fn commit(&self, writes: Vec<(Key, Update)>) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let _fence = self.commit_fence.read().unwrap();
        for (key, update) in &writes {
            self.wal.append(CMD_SET, encode_set(key, update))?;
        }
        self.wal.flush()?;

        // Apply at commit: nothing became visible before the log write
        // succeeded, and the fence keeps the target layer the current one.
        let current = self.layers.read().unwrap()[0].clone();
        for (key, update) in writes {
            current.upsert(key, update);
        }
        Ok(())
    }
}

/// Buffered write group. Dropping it without committing discards every
/// staged write; commit makes them durable and visible together.
pub struct WriteBatch<'a> {
    engine: &'a Engine,
    writes: Vec<(Key, Update)>,
}

impl WriteBatch<'_> {
    pub fn put(&mut self, key: Key, update: Update) -> Result<()> {
        if is_reserved(&key) {
            return Err(Error::InvalidState(format!(
                "key {} is under the reserved descriptor namespace",
                key
            )));
        }
        self.writes.push((key, update));
        Ok(())
    }

    pub fn delete(&mut self, key: Key) -> Result<()> {
        self.put(key, Update::Tombstone)
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn commit(self) -> Result<()> {
        self.engine.commit(self.writes)
    }
}

fn encode_set(key: &Key, update: &Update) -> Vec<u8> {
    let key_bytes = key.encode();
    let update_bytes = update.encode();
    let mut buf = Vec::with_capacity(4 + key_bytes.len() + update_bytes.len());
    buf.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(&key_bytes);
    buf.extend_from_slice(&update_bytes);
    buf
}

fn decode_set(bytes: &[u8]) -> Result<(Key, Update)> {
    if bytes.len() < 4 {
        return Err(Error::Corruption("truncated set command".into()));
    }
    let key_len = LittleEndian::read_u32(bytes) as usize;
    let rest = &bytes[4..];
    if rest.len() < key_len {
        return Err(Error::Corruption(format!(
            "set command claims {} key bytes, {} remain",
            key_len,
            rest.len()
        )));
    }
    let key = Key::decode(&rest[..key_len])?;
    let update = Update::decode(&rest[key_len..])?;
    Ok((key, update))
}

fn apply_command(layer: &OrderedIndex, command: &Command) -> Result<()> {
    match command.kind {
        CMD_SET => {
            let (key, update) = decode_set(&command.bytes)?;
            layer.upsert(key, update);
            Ok(())
        }
        CMD_CHECKPOINT_START | CMD_CHECKPOINT_DROP => Ok(()),
        other => Err(Error::Corruption(format!(
            "unknown command type {:#04x} in log",
            other
        ))),
    }
}

fn encode_maxgen(maxgen: u32) -> Result<Vec<u8>> {
    bincode::serialize(&maxgen)
        .map_err(|e| Error::Corruption(format!("cannot encode generation count: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::KeyPart;

    fn open(dir: &Path) -> Engine {
        Engine::open(dir, EngineConfig::default()).expect("open failed")
    }

    fn put(engine: &Engine, key: &str, value: &str) {
        engine
            .set_value(Key::text(key), Update::Full(value.as_bytes().to_vec()))
            .expect("set_value failed");
    }

    fn get(engine: &Engine, key: &str) -> Option<String> {
        match engine.get(&Key::text(key)) {
            Ok(merged) => Some(
                String::from_utf8(merged.value().expect("not live").to_vec()).expect("not utf8"),
            ),
            Err(Error::NotFound) => None,
            Err(e) => panic!("get failed: {}", e),
        }
    }

    #[test]
    fn test_set_get_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        put(&engine, "alpha", "1");
        assert_eq!(get(&engine, "alpha"), Some("1".to_string()));
        assert_eq!(get(&engine, "beta"), None);

        put(&engine, "alpha", "2");
        assert_eq!(get(&engine, "alpha"), Some("2".to_string()));

        engine.delete(Key::text("alpha")).expect("delete failed");
        assert_eq!(get(&engine, "alpha"), None);
    }

    #[test]
    fn test_reopen_recovers_committed_writes() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        {
            let engine = open(dir.path());
            put(&engine, "durable", "yes");
        }
        let engine = open(dir.path());
        assert_eq!(get(&engine, "durable"), Some("yes".to_string()));
    }

    #[test]
    fn test_reserved_namespace_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        let key = Key::new(vec![KeyPart::Text("GEN".into()), KeyPart::Long(1)]);
        match engine.set_value(key, Update::Full(vec![1])) {
            Err(Error::InvalidState(_)) => {}
            other => panic!("expected InvalidState, got {:?}", other),
        }
    }

    #[test]
    fn test_second_open_of_same_directory_fails() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let _engine = open(dir.path());
        assert!(Engine::open(dir.path(), EngineConfig::default()).is_err());
    }

    #[test]
    fn test_flush_layer_and_read_back_from_segment() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        for i in 0..20 {
            put(&engine, &format!("key{:02}", i), &format!("v{}", i));
        }
        engine.flush_layer().expect("flush failed");
        assert_eq!(get(&engine, "key07"), Some("v7".to_string()));

        // Post-flush writes land in the fresh layer and shadow the segment.
        put(&engine, "key07", "patched");
        assert_eq!(get(&engine, "key07"), Some("patched".to_string()));
    }

    #[test]
    fn test_flushed_data_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        {
            let engine = open(dir.path());
            put(&engine, "flushed", "value");
            engine.flush_layer().expect("flush failed");
        }
        let engine = open(dir.path());
        assert_eq!(get(&engine, "flushed"), Some("value".to_string()));
    }

    #[test]
    fn test_delete_shadows_flushed_value() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        put(&engine, "k", "old");
        engine.flush_layer().expect("flush failed");
        engine.delete(Key::text("k")).expect("delete failed");
        assert_eq!(get(&engine, "k"), None);

        drop(engine);
        let engine = open(dir.path());
        assert_eq!(get(&engine, "k"), None);
    }

    #[test]
    fn test_find_next_and_prev_semantics() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        put(&engine, "abc", "1");
        put(&engine, "def", "2");
        put(&engine, "ghi", "3");
        engine.flush_layer().expect("flush failed");

        let (key, _) = engine
            .find_next(&Key::text("def"), false)
            .expect("find_next failed");
        assert_eq!(key, Key::text("ghi"));
        let (key, _) = engine
            .find_next(&Key::text("def"), true)
            .expect("find_next failed");
        assert_eq!(key, Key::text("def"));
        let (key, _) = engine
            .find_prev(&Key::text("def"), false)
            .expect("find_prev failed");
        assert_eq!(key, Key::text("abc"));
    }

    #[test]
    fn test_scan_merges_layer_and_segment() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        put(&engine, "a", "seg");
        put(&engine, "b", "seg");
        engine.flush_layer().expect("flush failed");
        put(&engine, "b", "layer");
        put(&engine, "c", "layer");
        engine.delete(Key::text("a")).expect("delete failed");

        let scanned: Vec<(String, String)> = engine
            .scan_forward(&Range::all())
            .expect("scan failed")
            .map(|item| {
                let (k, v) = item.expect("cursor step failed");
                (
                    k.to_string(),
                    String::from_utf8(v.value().expect("not live").to_vec()).expect("not utf8"),
                )
            })
            .collect();
        let keys: Vec<&str> = scanned.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(scanned[0].1, "layer");
    }

    #[test]
    fn test_batch_is_invisible_until_commit() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());

        let mut batch = engine.batch();
        batch
            .put(Key::text("x"), Update::Full(b"1".to_vec()))
            .expect("put failed");
        batch
            .put(Key::text("y"), Update::Full(b"2".to_vec()))
            .expect("put failed");
        assert_eq!(get(&engine, "x"), None);
        batch.commit().expect("commit failed");
        assert_eq!(get(&engine, "x"), Some("1".to_string()));
        assert_eq!(get(&engine, "y"), Some("2".to_string()));

        let mut discarded = engine.batch();
        discarded
            .put(Key::text("z"), Update::Full(b"3".to_vec()))
            .expect("put failed");
        drop(discarded);
        assert_eq!(get(&engine, "z"), None);
    }

    #[test]
    fn test_earlier_flush_outside_later_span_stays_reachable() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        put(&engine, "z", "first");
        engine.flush_layer().expect("flush failed");
        put(&engine, "b", "second");
        engine.flush_layer().expect("flush failed");

        // "z" lies outside the second segment's span; its own descriptor
        // must still be live and relevant.
        assert_eq!(get(&engine, "z"), Some("first".to_string()));
        assert_eq!(get(&engine, "b"), Some("second".to_string()));

        drop(engine);
        let engine = open(dir.path());
        assert_eq!(get(&engine, "z"), Some("first".to_string()));
        assert_eq!(get(&engine, "b"), Some("second".to_string()));
    }

    #[test]
    fn test_wrapper_bounds_follow_the_widest_child() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        put(&engine, "a", "1");
        put(&engine, "z", "2");
        engine.flush_layer().expect("flush failed");
        // This child sorts after a..z by storage key but covers less.
        put(&engine, "b", "3");
        put(&engine, "c", "4");
        engine.flush_layer().expect("flush failed");

        engine.wrap_generation(0).expect("wrap failed");
        assert_eq!(get(&engine, "z"), Some("2".to_string()));
        assert_eq!(get(&engine, "a"), Some("1".to_string()));
        assert_eq!(get(&engine, "c"), Some("4".to_string()));
    }

    #[test]
    fn test_reflush_of_identical_span_keeps_old_keys() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        put(&engine, "a", "1");
        put(&engine, "m", "2");
        put(&engine, "z", "3");
        engine.flush_layer().expect("flush failed");
        // Same a..z span, so the registration reuses the storage key.
        put(&engine, "a", "4");
        put(&engine, "z", "5");
        engine.flush_layer().expect("flush failed");

        assert_eq!(get(&engine, "a"), Some("4".to_string()));
        assert_eq!(get(&engine, "m"), Some("2".to_string()));
        assert_eq!(get(&engine, "z"), Some("5".to_string()));

        drop(engine);
        let engine = open(dir.path());
        assert_eq!(get(&engine, "m"), Some("2".to_string()));
    }

    #[test]
    fn test_wrap_generation_keeps_everything_resolvable() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        put(&engine, "early", "1");
        engine.flush_layer().expect("flush failed");
        put(&engine, "late", "2");
        engine.flush_layer().expect("flush failed");
        assert_eq!(engine.max_generation(), 1);

        engine.wrap_generation(0).expect("wrap failed");
        assert_eq!(engine.max_generation(), 2);
        assert_eq!(get(&engine, "early"), Some("1".to_string()));
        assert_eq!(get(&engine, "late"), Some("2".to_string()));

        drop(engine);
        let engine = open(dir.path());
        assert_eq!(get(&engine, "early"), Some("1".to_string()));
        assert_eq!(get(&engine, "late"), Some("2".to_string()));
    }

    #[test]
    fn test_metadata_row_probe_reports_invalid_state() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = open(dir.path());
        put(&engine, "k", "v");
        engine.flush_layer().expect("flush failed");
        match engine.get(&metadata_key()) {
            Err(Error::InvalidState(_)) => {}
            other => panic!("expected InvalidState, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let engine = std::sync::Arc::new(open(dir.path()));

        std::thread::scope(|scope| {
            for t in 0..4u8 {
                let engine = engine.clone();
                scope.spawn(move || {
                    for i in 0..25u8 {
                        engine
                            .set_value(
                                Key::text(&format!("w{}-{:02}", t, i)),
                                Update::Full(vec![t, i]),
                            )
                            .expect("set_value failed");
                    }
                });
            }
            let reader = engine.clone();
            scope.spawn(move || {
                for _ in 0..50 {
                    let _ = reader.find_next(&Key::text("w"), true);
                }
            });
        });

        let count = engine
            .scan_forward(&Range::all())
            .expect("scan failed")
            .count();
        assert_eq!(count, 100);
    }
}
