pub mod config;
pub mod engine;
pub mod error;
pub mod flock;
pub mod index;
pub mod rangemap;
pub mod record;
pub mod sequence;
pub mod storage;
pub mod wal;

pub use config::EngineConfig;
pub use engine::{Engine, WriteBatch};
pub use error::{Error, Result};
pub use index::OrderedIndex;
pub use record::{Key, KeyPart, MergedValue, Range, ScanBound, Update};
