use super::descriptor::{is_reserved, metadata_key, namespace_key, RangeKey, SegmentLocation};
use super::segment::{SegmentCache, SegmentReader};
use super::stats::ResolveStats;
use crate::error::{Error, Result};
use crate::index::OrderedIndex;
use crate::record::{Key, MergedValue, Range, Update};
use crate::storage::BlockStorage;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::Arc;

/// Resolves queries across in-memory layers and every generation of on-disk
/// segments reachable through descriptor indirection. Lower generations are
/// newer and shadow higher ones; within a generation, higher registration
/// ordinals are newer.
pub struct RangeMap {
    cache: SegmentCache,
}

/// A descriptor match queued for opening. Heap order is resolution priority:
/// newest first, meaning lowest generation, then highest ordinal.
struct QueuedSegment {
    generation: u32,
    ordinal: u64,
    storage_key: Key,
    location: SegmentLocation,
}

impl Ord for QueuedSegment {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .generation
            .cmp(&self.generation)
            .then(self.ordinal.cmp(&other.ordinal))
            .then_with(|| other.storage_key.cmp(&self.storage_key))
    }
}

impl PartialOrd for QueuedSegment {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedSegment {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for QueuedSegment {}

/// One opened segment in resolution priority order.
pub(crate) struct SegmentSource {
    pub generation: u32,
    pub ordinal: u64,
    pub reader: Arc<SegmentReader>,
}

impl RangeMap {
    pub fn new(storage: Arc<dyn BlockStorage>) -> RangeMap {
        RangeMap {
            cache: SegmentCache::new(storage),
        }
    }

    /// Drops the cached reader for an unmapped segment.
    pub fn unmap(&self, descriptor: &Key) {
        self.cache.invalidate(descriptor);
    }

    /// Opens the segment registered under `descriptor`, loading it on a miss.
    pub(crate) fn open_segment(
        &self,
        descriptor: &Key,
        location: &SegmentLocation,
    ) -> Result<Arc<SegmentReader>> {
        self.cache.open(descriptor, location)
    }

    /// Lazy directional scan over `[range.low, range.high]`; the preferred
    /// strategy for multi-step paging. Observably equivalent to stepping
    /// [`resolve`](Self::resolve) key by key.
    pub fn scan(
        &self,
        layers: &[OrderedIndex],
        range: &Range,
        forward: bool,
    ) -> Result<super::cursor::MergeCursor> {
        super::cursor::MergeCursor::open(self, layers, range, forward)
    }

    /// Finds the next (forward) or previous live record from `key` across
    /// all layers and segments. Tombstones in newer sources shadow values in
    /// older ones; a key whose merge ends deleted is skipped, never returned.
    ///
    /// `layers` must be ordered newest first.
    pub fn resolve(
        &self,
        layers: &[OrderedIndex],
        key: &Key,
        forward: bool,
        equal_ok: bool,
        stats: &mut ResolveStats,
    ) -> Result<(Key, MergedValue)> {
        let merged = self.resolve_merged(layers, key, forward, equal_ok, stats)?;
        let found = if forward {
            merged.iter().find(|(_, value)| value.is_live())
        } else {
            merged.iter().rev().find(|(_, value)| value.is_live())
        };
        match found {
            Some((k, value)) => Ok((k.clone(), value.clone())),
            None => Err(Error::NotFound),
        }
    }

    /// The eager walk behind [`resolve`](Self::resolve): every relevant
    /// source is drained from `key` in the requested direction and folded
    /// per key into merged values, newest source first.
    pub(crate) fn resolve_merged(
        &self,
        layers: &[OrderedIndex],
        key: &Key,
        forward: bool,
        equal_ok: bool,
        stats: &mut ResolveStats,
    ) -> Result<BTreeMap<Key, MergedValue>> {
        if *key == metadata_key() {
            return Err(Error::InvalidState(
                "search key is the reserved generation metadata row".into(),
            ));
        }

        // A segment can hold the answer if any key it covers lies on the
        // search side of `key`. Wrapper bounds are descriptor keys whose
        // unwrapped span is the real coverage, so both the literal and the
        // unwrapped reading are admitted.
        let relevant = |range: &RangeKey| {
            if forward {
                *range.high() >= *key || range.resolved_high() >= *key
            } else {
                *range.low() <= *key || range.resolved_low() <= *key
            }
        };
        let segments = self.collect_segments(layers, &relevant, stats)?;

        let mut merged: BTreeMap<Key, MergedValue> = BTreeMap::new();
        for layer in layers {
            let span_relevant = if forward {
                layer.last_key().map_or(false, |last| last >= *key)
            } else {
                layer.first_key().map_or(false, |first| first <= *key)
            };
            if !span_relevant {
                continue;
            }
            let range = if forward {
                Range {
                    low: crate::record::ScanBound::Key(key.clone()),
                    high: crate::record::ScanBound::Max,
                }
            } else {
                Range {
                    low: crate::record::ScanBound::Min,
                    high: crate::record::ScanBound::Key(key.clone()),
                }
            };
            let cursor = if forward {
                layer.scan_forward(range)
            } else {
                layer.scan_backward(range)
            };
            for (k, update) in cursor {
                if is_reserved(&k) || (!equal_ok && k == *key) {
                    continue;
                }
                fold(&mut merged, k, &update, stats)?;
            }
        }

        for source in &segments {
            for (k, update) in source.reader.iter_from(key, forward, equal_ok) {
                if is_reserved(k) {
                    continue;
                }
                fold(&mut merged, k.clone(), update, stats)?;
            }
        }

        Ok(merged)
    }

    /// Walks the descriptor tree from the layers down, opening every segment
    /// the relevance predicate admits. Returned sources are in resolution
    /// priority order (newest first). A tombstoned descriptor shadows every
    /// same-keyed row in older sources without being traversed; live rows
    /// deduplicate per (key, segment address), so two registrations that
    /// happen to share a storage key are both followed.
    pub(crate) fn collect_segments(
        &self,
        layers: &[OrderedIndex],
        relevant: &dyn Fn(&RangeKey) -> bool,
        stats: &mut ResolveStats,
    ) -> Result<Vec<SegmentSource>> {
        let mut shadowed: HashSet<Key> = HashSet::new();
        let mut handled: HashSet<(Key, u64)> = HashSet::new();
        let mut queue: BinaryHeap<QueuedSegment> = BinaryHeap::new();

        for layer in layers {
            let rows = layer.scan_forward(Range::prefixed(&namespace_key()));
            for (k, update) in rows {
                discover(&k, &update, relevant, &mut shadowed, &mut handled, &mut queue, stats)?;
            }
        }

        let mut sources = Vec::new();
        while let Some(queued) = queue.pop() {
            let reader = self.cache.open(&queued.storage_key, &queued.location)?;
            stats.segments_visited += 1;
            for (k, update) in reader
                .iter_from(&namespace_key(), true, true)
                .take_while(|(k, _)| is_reserved(k))
            {
                discover(k, update, relevant, &mut shadowed, &mut handled, &mut queue, stats)?;
            }
            sources.push(SegmentSource {
                generation: queued.generation,
                ordinal: queued.ordinal,
                reader,
            });
        }

        // Children surface after their wrapping parent popped, so re-sort
        // into strict priority order.
        sources.sort_by(|a, b| {
            a.generation
                .cmp(&b.generation)
                .then(b.ordinal.cmp(&a.ordinal))
        });
        Ok(sources)
    }
}

fn discover(
    k: &Key,
    update: &Update,
    relevant: &dyn Fn(&RangeKey) -> bool,
    shadowed: &mut HashSet<Key>,
    handled: &mut HashSet<(Key, u64)>,
    queue: &mut BinaryHeap<QueuedSegment>,
    stats: &mut ResolveStats,
) -> Result<()> {
    if *k == metadata_key() {
        return Ok(());
    }
    stats.descriptor_rows_considered += 1;
    let range = RangeKey::parse(k)?;
    if shadowed.contains(k) {
        stats.duplicate_rows_observed += 1;
        return Ok(());
    }
    if update.is_tombstone() {
        shadowed.insert(k.clone());
        stats.tombstones_skipped += 1;
        return Ok(());
    }
    let location = match update {
        Update::Full(bytes) => SegmentLocation::decode(bytes)?,
        other => {
            return Err(Error::Corruption(format!(
                "descriptor row {} carries {:?} instead of a location",
                k, other
            )));
        }
    };
    // Only an identical (key, segment) pair is a duplicate copy of a row
    // already followed; same-keyed rows pointing at distinct segments are
    // separate children.
    if !handled.insert((k.clone(), location.addr)) {
        stats.duplicate_rows_observed += 1;
        return Ok(());
    }
    if !relevant(&range) {
        return Ok(());
    }
    queue.push(QueuedSegment {
        generation: range.generation(),
        ordinal: location.ordinal,
        storage_key: k.clone(),
        location,
    });
    Ok(())
}

/// Applies one update to the accumulator for `k`. A terminal merge ignores
/// later (older-source) updates, which is how newer writes win.
fn fold(
    merged: &mut BTreeMap<Key, MergedValue>,
    k: Key,
    update: &Update,
    stats: &mut ResolveStats,
) -> Result<()> {
    let entry = merged.entry(k).or_insert_with(MergedValue::new);
    if entry.is_terminal() {
        stats.duplicate_rows_observed += 1;
        return Ok(());
    }
    if update.is_tombstone() {
        stats.tombstones_accumulated += 1;
    }
    entry.apply(update)
}
