use super::descriptor::is_reserved;
use super::resolve::RangeMap;
use super::segment::SegmentReader;
use super::stats::ResolveStats;
use crate::error::Result;
use crate::index::{IndexCursor, OrderedIndex};
use crate::record::{Key, MergedValue, Range, Update};
use std::cmp::Ordering;
use std::sync::Arc;

/// One merge input. Position 0 in the source list is the newest source; a
/// key yielded by a lower position shadows the same key from higher ones.
enum SourceIter {
    Layer(IndexCursor),
    Segment {
        reader: Arc<SegmentReader>,
        /// Window of entry indices still to yield.
        next: usize,
        end: usize,
        forward: bool,
    },
}

impl SourceIter {
    fn next(&mut self) -> Option<(Key, Update)> {
        match self {
            SourceIter::Layer(cursor) => cursor.next(),
            SourceIter::Segment { reader, next, end, forward } => {
                if next >= end {
                    return None;
                }
                let idx = if *forward {
                    let idx = *next;
                    *next += 1;
                    idx
                } else {
                    *end -= 1;
                    *end
                };
                let (key, update) = &reader.entries()[idx];
                Some((key.clone(), update.clone()))
            }
        }
    }
}

/// Lazy k-way merge over a snapshot of the layer list plus every segment the
/// range can reach. Yields each key at most once, with all of its updates
/// (newest source first) folded into one merged value; keys whose merge ends
/// deleted are skipped. Consuming it further never re-reads emitted keys, so
/// a partially-consumed scan stays consistent with the snapshot it started
/// from.
pub struct MergeCursor {
    sources: Vec<SourceIter>,
    /// Peeked head of each source, aligned with `sources`.
    heads: Vec<Option<(Key, Update)>>,
    forward: bool,
    stats: ResolveStats,
    done: bool,
}

impl MergeCursor {
    pub(crate) fn open(
        rangemap: &RangeMap,
        layers: &[OrderedIndex],
        range: &Range,
        forward: bool,
    ) -> Result<MergeCursor> {
        let mut stats = ResolveStats::new();
        // Admit both the literal and the unwrapped bounds; see the matching
        // relevance test in `RangeMap::resolve_merged`.
        let overlaps = |candidate: &super::descriptor::RangeKey| {
            let reaches_up = range.low.compare(candidate.high()) != Ordering::Greater
                || range.low.compare(&candidate.resolved_high()) != Ordering::Greater;
            let reaches_down = range.high.compare(candidate.low()) != Ordering::Less
                || range.high.compare(&candidate.resolved_low()) != Ordering::Less;
            reaches_up && reaches_down
        };
        let segments = rangemap.collect_segments(layers, &overlaps, &mut stats)?;

        let mut sources = Vec::with_capacity(layers.len() + segments.len());
        for layer in layers {
            let cursor = if forward {
                layer.scan_forward(range.clone())
            } else {
                layer.scan_backward(range.clone())
            };
            sources.push(SourceIter::Layer(cursor));
        }
        for segment in segments {
            let entries = segment.reader.entries();
            let lo = entries.partition_point(|(k, _)| range.low.compare(k) == Ordering::Greater);
            let hi = entries.partition_point(|(k, _)| range.high.compare(k) != Ordering::Less);
            sources.push(SourceIter::Segment {
                reader: segment.reader.clone(),
                next: lo,
                end: hi.max(lo),
                forward,
            });
        }

        let heads = sources.iter_mut().map(SourceIter::next).collect();
        Ok(MergeCursor {
            sources,
            heads,
            forward,
            stats,
            done: false,
        })
    }

    pub fn stats(&self) -> &ResolveStats {
        &self.stats
    }

    /// Key the merge would process next, across all sources.
    fn extreme_key(&self) -> Option<Key> {
        let mut best: Option<&Key> = None;
        for head in self.heads.iter().flatten() {
            let better = match best {
                None => true,
                Some(current) => {
                    if self.forward {
                        head.0 < *current
                    } else {
                        head.0 > *current
                    }
                }
            };
            if better {
                best = Some(&head.0);
            }
        }
        best.cloned()
    }
}

impl Iterator for MergeCursor {
    type Item = Result<(Key, MergedValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let key = match self.extreme_key() {
                Some(key) => key,
                None => {
                    self.done = true;
                    return None;
                }
            };

            // Fold every source's update for this key, newest source first;
            // once terminal, older rows are duplicates and are dropped.
            let mut merged = MergedValue::new();
            for idx in 0..self.sources.len() {
                let update = match self.heads[idx].take() {
                    Some((k, update)) if k == key => update,
                    other => {
                        self.heads[idx] = other;
                        continue;
                    }
                };
                if merged.is_terminal() {
                    self.stats.duplicate_rows_observed += 1;
                } else {
                    if update.is_tombstone() {
                        self.stats.tombstones_accumulated += 1;
                    }
                    if let Err(e) = merged.apply(&update) {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
                self.heads[idx] = self.sources[idx].next();
            }

            if is_reserved(&key) {
                continue;
            }
            if merged.is_live() {
                return Some(Ok((key, merged)));
            }
            self.stats.tombstones_skipped += 1;
        }
    }
}
