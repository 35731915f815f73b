use crate::wal::{WalOptions, DEFAULT_SEGMENT_COUNT, DEFAULT_SEGMENT_SIZE};
use std::time::Duration;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Segments pre-allocated for the write-ahead log.
    pub wal_segment_count: u32,
    /// Size of each log segment in bytes.
    pub wal_segment_size: u32,
    /// Batch concurrent commits into one physical log write.
    pub group_commit: bool,
    /// Bound on a group-commit wait; expiry is fatal.
    pub flush_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            wal_segment_count: DEFAULT_SEGMENT_COUNT,
            wal_segment_size: DEFAULT_SEGMENT_SIZE,
            group_commit: false,
            flush_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    pub(crate) fn wal_options(&self) -> WalOptions {
        WalOptions {
            segment_count: self.wal_segment_count,
            segment_size: self.wal_segment_size,
            group_commit: self.group_commit,
            flush_timeout: self.flush_timeout,
        }
    }
}
