use std::sync::atomic::{AtomicI64, Ordering};

/// Injected monotonic counter with explicit lifecycle: every WAL instance and
/// engine owns (or shares) one, rather than reaching for process-global
/// state. Strictly increasing under concurrent callers.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicI64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: i64) -> Self {
        SequenceGenerator {
            next: AtomicI64::new(first),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Raises the floor so future values exceed `seen`. Used after recovery.
    pub fn advance_past(&self, seen: i64) {
        self.next.fetch_max(seen + 1, Ordering::SeqCst);
    }

    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
