//! Raft consensus.
//!
//! A cluster of nodes replicates a log of commands, which each node applies
//! to its local `State` once a quorum has stored them. Nodes are driven by
//! the caller: inbound messages go to `Node::step`, time to `Node::tick`,
//! and outbound messages (including client responses) come out of the
//! node's channel.

mod log;
mod message;
mod node;
mod state;
mod types;

pub use self::log::{Entry, Key, Log};
pub use message::{Address, Envelope, Message, Request, RequestId, Response, Status};
pub use node::Node;
pub use state::State;
pub use types::{Index, NodeId, Options, Term, Ticks};
