//! Raft identifiers and node options.

use std::ops::Range;

pub type NodeId = u8;

/// Raft's logical clock. At most one leader is elected per term.
pub type Term = u64;

/// A log entry index. Index 0 is the empty position before the first entry.
pub type Index = u64;

/// Logical time, advanced by `Node::tick`.
pub type Ticks = u8;

/// Node timing options.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// Ticks between leader heartbeats.
    pub heartbeat_interval: Ticks,
    /// Election timeouts are drawn uniformly from this range, so that split
    /// votes are rare.
    pub election_timeout_range: Range<Ticks>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heartbeat_interval: 3,
            election_timeout_range: 10..20,
        }
    }
}
