pub mod key;
pub mod merge;
pub mod update;

pub use key::{Key, KeyPart, Range, ScanBound};
pub use merge::MergedValue;
pub use update::Update;
