use crate::record::{Key, Update};
use rand::Rng;
use std::cmp::Ordering;

use super::KeyProbe;

/// Maximum tower height. With 1/4 branching this comfortably covers
/// millions of entries.
pub const MAX_HEIGHT: usize = 12;

struct Node {
    key: Key,
    value: Update,
    forward: Vec<Option<usize>>,
}

/// Classic skip list with randomized tower heights, arena-allocated so no
/// unsafe pointer plumbing is needed. Not internally synchronized: the
/// owning [`OrderedIndex`](super::OrderedIndex) serializes access.
pub struct SkipList {
    nodes: Vec<Node>,
    head: Vec<Option<usize>>,
    height: usize,
    len: usize,
}

impl SkipList {
    pub fn new() -> Self {
        SkipList {
            nodes: Vec::new(),
            head: vec![None; MAX_HEIGHT],
            height: 1,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn next_of(&self, node: Option<usize>, level: usize) -> Option<usize> {
        match node {
            None => self.head[level],
            Some(idx) => self.nodes[idx].forward[level],
        }
    }

    /// Walks the list tracking the rightmost node strictly before the probe
    /// at every level. `inclusive` controls whether a key equal to the probe
    /// counts as "before" it.
    fn predecessors(&self, probe: &dyn KeyProbe, inclusive: bool) -> [Option<usize>; MAX_HEIGHT] {
        let mut preds: [Option<usize>; MAX_HEIGHT] = [None; MAX_HEIGHT];
        let mut current: Option<usize> = None;
        for level in (0..self.height).rev() {
            while let Some(next) = self.next_of(current, level) {
                let ord = probe.compare(&self.nodes[next].key);
                let advance = match ord {
                    Ordering::Greater => true,
                    Ordering::Equal => inclusive,
                    Ordering::Less => false,
                };
                if advance {
                    current = Some(next);
                } else {
                    break;
                }
            }
            preds[level] = current;
        }
        preds
    }

    /// First node whose key is `> probe`, or `>= probe` when `inclusive`.
    pub fn seek_forward(&self, probe: &dyn KeyProbe, inclusive: bool) -> Option<(&Key, &Update)> {
        // inclusive seek stops before keys equal to the probe.
        let preds = self.predecessors(probe, !inclusive);
        self.next_of(preds[0], 0)
            .map(|idx| (&self.nodes[idx].key, &self.nodes[idx].value))
    }

    /// Last node whose key is `< probe`, or `<= probe` when `inclusive`.
    pub fn seek_backward(&self, probe: &dyn KeyProbe, inclusive: bool) -> Option<(&Key, &Update)> {
        let preds = self.predecessors(probe, inclusive);
        preds[0].map(|idx| (&self.nodes[idx].key, &self.nodes[idx].value))
    }

    pub fn get(&self, key: &Key) -> Option<&Update> {
        match self.seek_forward(key, true) {
            Some((found, value)) if found == key => Some(value),
            _ => None,
        }
    }

    pub fn first(&self) -> Option<(&Key, &Update)> {
        self.head[0].map(|idx| (&self.nodes[idx].key, &self.nodes[idx].value))
    }

    pub fn last(&self) -> Option<(&Key, &Update)> {
        let mut current: Option<usize> = None;
        for level in (0..self.height).rev() {
            while let Some(next) = self.next_of(current, level) {
                current = Some(next);
            }
        }
        current.map(|idx| (&self.nodes[idx].key, &self.nodes[idx].value))
    }

    /// Inserts the pair. When `overwrite` is false and the key exists the
    /// list is unchanged and `false` is returned; an existing key with
    /// `overwrite` set has its value replaced in place.
    pub fn insert(&mut self, key: Key, value: Update, overwrite: bool) -> bool {
        let preds = self.predecessors(&key, false);
        if let Some(next) = self.next_of(preds[0], 0) {
            if self.nodes[next].key == key {
                if overwrite {
                    self.nodes[next].value = value;
                    return true;
                }
                return false;
            }
        }

        let height = random_height();
        if height > self.height {
            self.height = height;
        }

        let idx = self.nodes.len();
        self.nodes.push(Node {
            key,
            value,
            forward: vec![None; height],
        });
        for level in 0..height {
            let next = self.next_of(preds[level], level);
            self.nodes[idx].forward[level] = next;
            match preds[level] {
                None => self.head[level] = Some(idx),
                Some(pred) => self.nodes[pred].forward[level] = Some(idx),
            }
        }
        self.len += 1;
        true
    }

    /// Unlinks the key from every level. The arena slot is abandoned; slots
    /// are reclaimed wholesale when the layer is flushed and dropped.
    pub fn remove(&mut self, key: &Key) -> bool {
        let preds = self.predecessors(key, false);
        let target = match self.next_of(preds[0], 0) {
            Some(idx) if self.nodes[idx].key == *key => idx,
            _ => return false,
        };

        for level in 0..self.nodes[target].forward.len() {
            let next = self.nodes[target].forward[level];
            match preds[level] {
                None => {
                    if self.head[level] == Some(target) {
                        self.head[level] = next;
                    }
                }
                Some(pred) => {
                    if self.nodes[pred].forward[level] == Some(target) {
                        self.nodes[pred].forward[level] = next;
                    }
                }
            }
        }
        while self.height > 1 && self.head[self.height - 1].is_none() {
            self.height -= 1;
        }
        self.len -= 1;
        true
    }
}

/// Coin-flip tower height with 1/4 branching, capped at MAX_HEIGHT.
fn random_height() -> usize {
    let mut rng = rand::thread_rng();
    let mut height = 1;
    while height < MAX_HEIGHT && rng.gen_ratio(1, 4) {
        height += 1;
    }
    height
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(keys: &[&str]) -> SkipList {
        let mut list = SkipList::new();
        for k in keys {
            assert!(list.insert(Key::text(k), Update::Full(k.as_bytes().to_vec()), false));
        }
        list
    }

    fn collect_keys(list: &SkipList) -> Vec<String> {
        let mut out = Vec::new();
        let mut cursor: Option<Key> = None;
        loop {
            let next = match &cursor {
                None => list.first().map(|(k, _)| k.clone()),
                Some(last) => list.seek_forward(last, false).map(|(k, _)| k.clone()),
            };
            match next {
                Some(key) => {
                    out.push(key.to_string());
                    cursor = Some(key);
                }
                None => return out,
            }
        }
    }

    #[test]
    fn test_sorted_iteration_regardless_of_insert_order() {
        let list = list_of(&["m", "c", "z", "a", "q"]);
        assert_eq!(collect_keys(&list), vec!["a", "c", "m", "q", "z"]);
        assert_eq!(list.len(), 5);
    }

    #[test]
    fn test_strict_insert_rejects_duplicate() {
        let mut list = list_of(&["a"]);
        assert!(!list.insert(Key::text("a"), Update::Tombstone, false));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(&Key::text("a")), Some(&Update::Full(b"a".to_vec())));
    }

    #[test]
    fn test_overwrite_replaces_in_place() {
        let mut list = list_of(&["a"]);
        assert!(list.insert(Key::text("a"), Update::Tombstone, true));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(&Key::text("a")), Some(&Update::Tombstone));
    }

    #[test]
    fn test_remove_unlinks_all_levels() {
        let mut list = list_of(&["a", "b", "c", "d", "e"]);
        assert!(list.remove(&Key::text("c")));
        assert!(!list.remove(&Key::text("c")));
        assert_eq!(collect_keys(&list), vec!["a", "b", "d", "e"]);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_seek_semantics() {
        let list = list_of(&["abc", "def", "ghi"]);

        let (k, _) = list.seek_forward(&Key::text("def"), false).expect("missing");
        assert_eq!(k, &Key::text("ghi"));
        let (k, _) = list.seek_forward(&Key::text("def"), true).expect("missing");
        assert_eq!(k, &Key::text("def"));
        let (k, _) = list.seek_backward(&Key::text("def"), false).expect("missing");
        assert_eq!(k, &Key::text("abc"));
        let (k, _) = list.seek_backward(&Key::text("def"), true).expect("missing");
        assert_eq!(k, &Key::text("def"));

        assert!(list.seek_forward(&Key::text("ghi"), false).is_none());
        assert!(list.seek_backward(&Key::text("abc"), false).is_none());
    }

    #[test]
    fn test_first_and_last() {
        let list = list_of(&["k2", "k1", "k3"]);
        assert_eq!(list.first().map(|(k, _)| k.clone()), Some(Key::text("k1")));
        assert_eq!(list.last().map(|(k, _)| k.clone()), Some(Key::text("k3")));
    }

    #[test]
    fn test_large_insert_stays_sorted() {
        let mut list = SkipList::new();
        for i in (0..500).rev() {
            assert!(list.insert(Key::long(i), Update::Full(vec![]), false));
        }
        assert_eq!(list.len(), 500);
        let mut cursor: Option<Key> = None;
        let mut count = 0;
        let mut last: Option<Key> = None;
        loop {
            let next = match &cursor {
                None => list.first().map(|(k, _)| k.clone()),
                Some(prev) => list.seek_forward(prev, false).map(|(k, _)| k.clone()),
            };
            match next {
                Some(key) => {
                    if let Some(prev) = &last {
                        assert!(prev < &key, "iteration out of order");
                    }
                    last = Some(key.clone());
                    cursor = Some(key);
                    count += 1;
                }
                None => break,
            }
        }
        assert_eq!(count, 500);
    }
}
