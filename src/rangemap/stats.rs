/// Per-call counters for one resolution walk. Diagnostic only; correctness
/// never depends on them, but tests use them to pin down how much of the
/// descriptor tree a query actually touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveStats {
    pub segments_visited: u64,
    pub descriptor_rows_considered: u64,
    pub duplicate_rows_observed: u64,
    pub tombstones_accumulated: u64,
    pub tombstones_skipped: u64,
}

impl ResolveStats {
    pub fn new() -> ResolveStats {
        ResolveStats::default()
    }
}

impl std::fmt::Display for ResolveStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "segments={} descriptors={} duplicates={} tombstones={}+{}",
            self.segments_visited,
            self.descriptor_rows_considered,
            self.duplicate_rows_observed,
            self.tombstones_accumulated,
            self.tombstones_skipped,
        )
    }
}
