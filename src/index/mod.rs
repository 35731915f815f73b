pub mod skiplist;

use crate::error::{Error, Result};
use crate::record::{Key, Range, ScanBound, Update};
use skiplist::SkipList;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

/// Key-comparable predicate used as a find/scan boundary.
///
/// `compare` orders the probe relative to a stored key. Exact keys are the
/// common case; boundary probes (prefix limits, scan sentinels) implement the
/// same trait, so find operations are not limited to stored keys.
pub trait KeyProbe {
    fn compare(&self, key: &Key) -> Ordering;
}

impl KeyProbe for Key {
    fn compare(&self, key: &Key) -> Ordering {
        self.cmp(key)
    }
}

impl KeyProbe for ScanBound {
    fn compare(&self, key: &Key) -> Ordering {
        ScanBound::compare(self, key)
    }
}

/// Thread-safe sorted map over record-model keys; the in-memory write buffer
/// ("layer") of the engine.
///
/// A coarse exclusive lock guards the whole structure. Cursors never hold the
/// lock across yields: each step re-seeks from the last yielded key.
#[derive(Clone)]
pub struct OrderedIndex {
    inner: Arc<Mutex<SkipList>>,
}

impl OrderedIndex {
    pub fn new() -> Self {
        OrderedIndex {
            inner: Arc::new(Mutex::new(SkipList::new())),
        }
    }

    /// Strict insert-only write. Callers doing durable structural inserts
    /// rely on the duplicate check.
    pub fn insert(&self, key: Key, value: Update) -> Result<()> {
        let mut list = self.inner.lock().unwrap();
        if list.insert(key, value, false) {
            Ok(())
        } else {
            Err(Error::DuplicateKey)
        }
    }

    /// Unconditional overwrite, the steady-state write path.
    pub fn upsert(&self, key: Key, value: Update) {
        let mut list = self.inner.lock().unwrap();
        list.insert(key, value, true);
    }

    pub fn remove(&self, key: &Key) -> bool {
        self.inner.lock().unwrap().remove(key)
    }

    pub fn get(&self, key: &Key) -> Result<Update> {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// First entry `> probe` (`>= probe` when `inclusive`).
    pub fn find_next(&self, probe: &dyn KeyProbe, inclusive: bool) -> Result<(Key, Update)> {
        self.inner
            .lock()
            .unwrap()
            .seek_forward(probe, inclusive)
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or(Error::NotFound)
    }

    /// Last entry `< probe` (`<= probe` when `inclusive`).
    pub fn find_prev(&self, probe: &dyn KeyProbe, inclusive: bool) -> Result<(Key, Update)> {
        self.inner
            .lock()
            .unwrap()
            .seek_backward(probe, inclusive)
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or(Error::NotFound)
    }

    pub fn scan_forward(&self, range: Range) -> IndexCursor {
        IndexCursor::new(self.clone(), range, Direction::Forward)
    }

    pub fn scan_backward(&self, range: Range) -> IndexCursor {
        IndexCursor::new(self.clone(), range, Direction::Backward)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn first_key(&self) -> Option<Key> {
        self.inner.lock().unwrap().first().map(|(k, _)| k.clone())
    }

    pub fn last_key(&self) -> Option<Key> {
        self.inner.lock().unwrap().last().map(|(k, _)| k.clone())
    }

    /// True when both handles refer to the same underlying structure.
    pub fn ptr_eq(&self, other: &OrderedIndex) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for OrderedIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Lazy, restartable, finite cursor over `[range.low, range.high]`.
///
/// Re-seeks from the last yielded key on every step, so concurrent mutation
/// is safe and the cursor never blocks other threads between yields.
pub struct IndexCursor {
    index: OrderedIndex,
    range: Range,
    direction: Direction,
    last: Option<Key>,
    done: bool,
}

impl IndexCursor {
    fn new(index: OrderedIndex, range: Range, direction: Direction) -> Self {
        IndexCursor {
            index,
            range,
            direction,
            last: None,
            done: false,
        }
    }
}

impl Iterator for IndexCursor {
    type Item = (Key, Update);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let found = match (self.direction, &self.last) {
            (Direction::Forward, None) => self.index.find_next(&self.range.low, true),
            (Direction::Forward, Some(last)) => self.index.find_next(last, false),
            (Direction::Backward, None) => self.index.find_prev(&self.range.high, true),
            (Direction::Backward, Some(last)) => self.index.find_prev(last, false),
        };
        match found {
            Ok((key, value)) => {
                if self.range.contains(&key) {
                    self.last = Some(key.clone());
                    Some((key, value))
                } else {
                    self.done = true;
                    None
                }
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}
