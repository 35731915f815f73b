use super::Update;
use crate::error::{Error, Result};

/// Accumulator that folds updates discovered across layers and generations,
/// applied in source-priority order (newest first), so the first terminal
/// update wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergedValue {
    /// No source has provided anything for this key yet.
    NotProvided,
    /// A full value was found. Terminal.
    Full(Vec<u8>),
    /// A tombstone was found. Terminal.
    Deleted,
    /// Reserved for partial updates, which would need older state to finish.
    Incomplete(Vec<u8>),
}

impl MergedValue {
    pub fn new() -> Self {
        MergedValue::NotProvided
    }

    /// Folds one more update in. Once the value is terminal, later (older)
    /// updates are ignored: that is the normal consequence of layered
    /// merging, not an error.
    pub fn apply(&mut self, update: &Update) -> Result<()> {
        if self.is_terminal() {
            tracing::warn!(state = ?self, ?update, "update after terminal merge state ignored");
            return Ok(());
        }
        match update {
            Update::Full(payload) => *self = MergedValue::Full(payload.clone()),
            Update::Tombstone => *self = MergedValue::Deleted,
            Update::Partial(_) => {
                return Err(Error::InvalidState(
                    "partial updates are not implemented".into(),
                ))
            }
            Update::None => {}
        }
        Ok(())
    }

    /// Full or Deleted: no older update can change the outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MergedValue::Full(_) | MergedValue::Deleted)
    }

    /// True when the merge resolved to a live value.
    pub fn is_live(&self) -> bool {
        matches!(self, MergedValue::Full(_))
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            MergedValue::Full(payload) => Some(payload),
            _ => None,
        }
    }
}

impl Default for MergedValue {
    fn default() -> Self {
        MergedValue::new()
    }
}
