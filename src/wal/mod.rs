//! Durable, segmented write-ahead log.
//!
//! The log lives inside a [`BlockStorage`](crate::storage::BlockStorage):
//! a root block lists the segments, each segment holds checksummed packets
//! of commands, and a reserved end-of-log marker terminates the live data.
//! Recovery replays every command in sequence order and resumes appending
//! exactly where the last flush left off.

mod header;
mod log;
mod packet;
mod recovery;

pub use self::header::{RootBlock, SegmentSlot, MAX_SEGMENT_SLOTS};
pub use self::log::{WalOptions, WriteAheadLog, DEFAULT_SEGMENT_COUNT, DEFAULT_SEGMENT_SIZE};
pub use self::packet::{Command, CMD_CHECKPOINT_DROP, CMD_CHECKPOINT_START};
