//! Range-map resolution: registration of flushed segments under descriptor
//! keys and query resolution across layers plus every reachable generation.

mod cursor;
mod descriptor;
mod resolve;
mod segment;
mod stats;

pub use self::cursor::MergeCursor;
pub use self::descriptor::{
    generation_prefix, is_reserved, metadata_key, namespace_key, RangeKey, SegmentLocation,
};
pub use self::resolve::RangeMap;
pub use self::segment::{write_segment, SegmentReader};
pub use self::stats::ResolveStats;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::index::OrderedIndex;
    use crate::record::{Key, MergedValue, Range, Update};
    use crate::storage::{BlockStorage, MemoryStorage};
    use std::sync::Arc;

    fn full(s: &str) -> Update {
        Update::Full(s.as_bytes().to_vec())
    }

    /// Writes `entries` as a segment and registers its descriptor row in
    /// `layer`, returning the storage key.
    fn register(
        layer: &OrderedIndex,
        storage: &dyn BlockStorage,
        generation: u32,
        ordinal: u64,
        entries: &[(Key, Update)],
    ) -> Key {
        let handle = write_segment(storage, entries).expect("segment write failed");
        let low = entries.first().expect("empty segment").0.clone();
        let high = entries.last().expect("empty segment").0.clone();
        let range = RangeKey::new(generation, low, high).expect("range construction failed");
        let storage_key = range.storage_key();
        let location = SegmentLocation {
            addr: handle.addr,
            len: handle.size,
            ordinal,
        };
        layer.upsert(
            storage_key.clone(),
            Update::Full(location.encode().expect("encode failed")),
        );
        storage_key
    }

    fn value_of(merged: &MergedValue) -> &str {
        std::str::from_utf8(merged.value().expect("not live")).expect("not utf8")
    }

    #[test]
    fn test_newer_generation_value_shadows_older_tombstone() {
        let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new());
        let root = OrderedIndex::new();
        register(
            &root,
            storage.as_ref(),
            1,
            1,
            &[(Key::text("k"), Update::Tombstone)],
        );
        register(&root, storage.as_ref(), 0, 2, &[(Key::text("k"), full("alive"))]);

        let rangemap = RangeMap::new(storage);
        let mut stats = ResolveStats::new();
        let (key, merged) = rangemap
            .resolve(&[root], &Key::text("k"), true, true, &mut stats)
            .expect("resolve failed");
        assert_eq!(key, Key::text("k"));
        assert_eq!(value_of(&merged), "alive");
        assert_eq!(stats.segments_visited, 2);
    }

    #[test]
    fn test_newer_generation_tombstone_shadows_older_value() {
        let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new());
        let root = OrderedIndex::new();
        register(&root, storage.as_ref(), 1, 1, &[(Key::text("k"), full("stale"))]);
        register(
            &root,
            storage.as_ref(),
            0,
            2,
            &[(Key::text("k"), Update::Tombstone)],
        );

        let rangemap = RangeMap::new(storage);
        let mut stats = ResolveStats::new();
        match rangemap.resolve(&[root.clone()], &Key::text("k"), true, true, &mut stats) {
            Err(Error::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|(k, _)| k)),
        }
        // A caller who opts into tombstones sees the deletion rather than
        // nothing at all.
        let merged = rangemap
            .resolve_merged(&[root], &Key::text("k"), true, true, &mut ResolveStats::new())
            .expect("walk failed");
        assert_eq!(merged.get(&Key::text("k")), Some(&MergedValue::Deleted));
    }

    #[test]
    fn test_layer_write_shadows_all_segments() {
        let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new());
        let old_layer = OrderedIndex::new();
        register(
            &old_layer,
            storage.as_ref(),
            0,
            1,
            &[(Key::text("k"), full("from-segment"))],
        );
        let new_layer = OrderedIndex::new();
        new_layer.upsert(Key::text("k"), full("from-layer"));

        let rangemap = RangeMap::new(storage);
        let (_, merged) = rangemap
            .resolve(
                &[new_layer, old_layer],
                &Key::text("k"),
                true,
                true,
                &mut ResolveStats::new(),
            )
            .expect("resolve failed");
        assert_eq!(value_of(&merged), "from-layer");
    }

    #[test]
    fn test_find_next_skips_keys_deleted_by_newer_generation() {
        let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new());
        let root = OrderedIndex::new();
        register(
            &root,
            storage.as_ref(),
            1,
            1,
            &[
                (Key::text("b"), full("old-b")),
                (Key::text("c"), full("old-c")),
            ],
        );
        register(
            &root,
            storage.as_ref(),
            0,
            2,
            &[(Key::text("b"), Update::Tombstone)],
        );

        let rangemap = RangeMap::new(storage);
        let (key, merged) = rangemap
            .resolve(&[root], &Key::text("a"), true, true, &mut ResolveStats::new())
            .expect("resolve failed");
        assert_eq!(key, Key::text("c"));
        assert_eq!(value_of(&merged), "old-c");
    }

    #[test]
    fn test_strict_and_inclusive_probes() {
        let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new());
        let root = OrderedIndex::new();
        register(
            &root,
            storage.as_ref(),
            0,
            1,
            &[
                (Key::text("abc"), full("1")),
                (Key::text("def"), full("2")),
                (Key::text("ghi"), full("3")),
            ],
        );
        let rangemap = RangeMap::new(storage);
        let layers = [root];

        let probe = Key::text("def");
        let mut stats = ResolveStats::new();
        let (key, _) = rangemap
            .resolve(&layers, &probe, true, false, &mut stats)
            .expect("resolve failed");
        assert_eq!(key, Key::text("ghi"));
        let (key, _) = rangemap
            .resolve(&layers, &probe, true, true, &mut stats)
            .expect("resolve failed");
        assert_eq!(key, Key::text("def"));
        let (key, _) = rangemap
            .resolve(&layers, &probe, false, false, &mut stats)
            .expect("resolve failed");
        assert_eq!(key, Key::text("abc"));
    }

    #[test]
    fn test_range_of_ranges_opens_only_the_relevant_chain() {
        let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new());

        // Two leaf segments registered in a scratch layer so their rows can
        // become the wrapper's payload.
        let scratch = OrderedIndex::new();
        register(
            &scratch,
            storage.as_ref(),
            0,
            1,
            &[(Key::text("apple"), full("low-half"))],
        );
        register(
            &scratch,
            storage.as_ref(),
            0,
            2,
            &[(Key::text("quince"), full("high-half"))],
        );
        let children: Vec<(Key, Update)> = scratch.scan_forward(Range::all()).collect();
        assert_eq!(children.len(), 2);

        // The wrapper's bounds are the child descriptors' storage keys.
        let root = OrderedIndex::new();
        let wrapper_handle =
            write_segment(storage.as_ref(), &children).expect("segment write failed");
        let wrapper = RangeKey::new(1, children[0].0.clone(), children[1].0.clone())
            .expect("range construction failed");
        let location = SegmentLocation {
            addr: wrapper_handle.addr,
            len: wrapper_handle.size,
            ordinal: 3,
        };
        root.upsert(
            wrapper.storage_key(),
            Update::Full(location.encode().expect("encode failed")),
        );

        let rangemap = RangeMap::new(storage);
        let mut stats = ResolveStats::new();
        let (key, merged) = rangemap
            .resolve(&[root], &Key::text("quince"), true, true, &mut stats)
            .expect("resolve failed");
        assert_eq!(key, Key::text("quince"));
        assert_eq!(value_of(&merged), "high-half");
        // Wrapper plus the one child whose range lies ahead of the probe.
        assert_eq!(stats.segments_visited, 2);
    }

    #[test]
    fn test_same_key_rows_for_distinct_segments_are_both_followed() {
        let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new());
        let root = OrderedIndex::new();

        // Older segment whose descriptor row survives only inside a wrapper.
        let old = write_segment(storage.as_ref(), &[(Key::text("m"), full("old-only"))])
            .expect("segment write failed");
        let range =
            RangeKey::new(0, Key::text("a"), Key::text("z")).expect("range construction failed");
        let old_location = SegmentLocation {
            addr: old.addr,
            len: old.size,
            ordinal: 1,
        };
        let old_row = (
            range.storage_key(),
            Update::Full(old_location.encode().expect("encode failed")),
        );
        let wrapper_seg =
            write_segment(storage.as_ref(), &[old_row]).expect("segment write failed");
        let wrapper = RangeKey::new(1, range.storage_key(), range.storage_key())
            .expect("range construction failed");
        let wrapper_location = SegmentLocation {
            addr: wrapper_seg.addr,
            len: wrapper_seg.size,
            ordinal: 2,
        };
        root.upsert(
            wrapper.storage_key(),
            Update::Full(wrapper_location.encode().expect("encode failed")),
        );

        // Newer segment registered at the root under the same storage key.
        let new = write_segment(storage.as_ref(), &[(Key::text("a"), full("new"))])
            .expect("segment write failed");
        let new_location = SegmentLocation {
            addr: new.addr,
            len: new.size,
            ordinal: 3,
        };
        root.upsert(
            range.storage_key(),
            Update::Full(new_location.encode().expect("encode failed")),
        );

        let rangemap = RangeMap::new(storage);
        let mut stats = ResolveStats::new();
        let (key, merged) = rangemap
            .resolve(&[root], &Key::text("m"), true, true, &mut stats)
            .expect("resolve failed");
        assert_eq!(key, Key::text("m"));
        assert_eq!(value_of(&merged), "old-only");
        assert_eq!(stats.segments_visited, 3);
    }

    #[test]
    fn test_tombstoned_descriptor_is_not_traversed() {
        let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new());
        let old_layer = OrderedIndex::new();
        let descriptor = register(
            &old_layer,
            storage.as_ref(),
            0,
            1,
            &[(Key::text("k"), full("ghost"))],
        );
        let new_layer = OrderedIndex::new();
        new_layer.upsert(descriptor, Update::Tombstone);

        let rangemap = RangeMap::new(storage);
        let mut stats = ResolveStats::new();
        match rangemap.resolve(
            &[new_layer, old_layer],
            &Key::text("k"),
            true,
            true,
            &mut stats,
        ) {
            Err(Error::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|(k, _)| k)),
        }
        assert_eq!(stats.segments_visited, 0);
        assert_eq!(stats.tombstones_skipped, 1);
        assert_eq!(stats.duplicate_rows_observed, 1);
    }

    #[test]
    fn test_metadata_row_probe_is_trapped() {
        let rangemap = RangeMap::new(Arc::new(MemoryStorage::new()));
        match rangemap.resolve(
            &[OrderedIndex::new()],
            &metadata_key(),
            true,
            true,
            &mut ResolveStats::new(),
        ) {
            Err(Error::InvalidState(_)) => {}
            other => panic!("expected InvalidState, got {:?}", other.map(|(k, _)| k)),
        }
    }

    #[test]
    fn test_cursor_agrees_with_eager_resolution() {
        let storage: Arc<dyn BlockStorage> = Arc::new(MemoryStorage::new());
        let root = OrderedIndex::new();
        register(
            &root,
            storage.as_ref(),
            1,
            1,
            &[
                (Key::text("a"), full("seg-a")),
                (Key::text("b"), full("seg-b")),
                (Key::text("d"), full("seg-d")),
            ],
        );
        register(
            &root,
            storage.as_ref(),
            0,
            2,
            &[
                (Key::text("b"), Update::Tombstone),
                (Key::text("c"), full("seg-c")),
            ],
        );
        root.upsert(Key::text("d"), full("layer-d"));
        root.upsert(Key::text("e"), full("layer-e"));

        let rangemap = RangeMap::new(storage);
        let layers = [root];

        let scanned: Vec<(Key, String)> = rangemap
            .scan(&layers, &Range::all(), true)
            .expect("scan failed")
            .map(|item| {
                let (k, v) = item.expect("cursor step failed");
                (k, value_of(&v).to_string())
            })
            .collect();
        assert_eq!(
            scanned,
            vec![
                (Key::text("a"), "seg-a".to_string()),
                (Key::text("c"), "seg-c".to_string()),
                (Key::text("d"), "layer-d".to_string()),
                (Key::text("e"), "layer-e".to_string()),
            ]
        );

        // Step the eager strategy key by key; both walks must agree.
        let mut probe = Key::text("");
        let mut eager = Vec::new();
        let mut equal_ok = true;
        loop {
            match rangemap.resolve(&layers, &probe, true, equal_ok, &mut ResolveStats::new()) {
                Ok((k, v)) => {
                    eager.push((k.clone(), value_of(&v).to_string()));
                    probe = k;
                    equal_ok = false;
                }
                Err(Error::NotFound) => break,
                Err(e) => panic!("resolve failed: {}", e),
            }
        }
        assert_eq!(scanned, eager);

        let backward: Vec<Key> = rangemap
            .scan(&layers, &Range::all(), false)
            .expect("scan failed")
            .map(|item| item.expect("cursor step failed").0)
            .collect();
        assert_eq!(
            backward,
            vec![Key::text("e"), Key::text("d"), Key::text("c"), Key::text("a")]
        );
    }
}
