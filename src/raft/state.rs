//! The replicated state machine interface.

use super::{Entry, Index};
use crate::error::Result;

/// The replicated state machine driven by the Raft log.
pub trait State: Send {
    /// Index of the last entry applied to the state.
    fn applied_index(&self) -> Index;

    /// Applies a committed entry and returns the command result. Entries
    /// arrive in index order, and implementations must record the applied
    /// index even for no-op entries (`command: None`) and failed commands.
    /// An `Error::Internal` is treated as fatal by the node.
    fn apply(&mut self, entry: Entry) -> Result<Vec<u8>>;

    /// Executes a read-only command against the state.
    fn query(&self, command: Vec<u8>) -> Result<Vec<u8>>;
}
