//! raftdb: the core of a distributed SQL database. A SQL parser, an
//! order-preserving key encoding, key/value storage engines and a Raft
//! consensus node.

pub mod config;
pub mod encoding;
pub mod error;
pub mod raft;
pub mod sql;
pub mod storage;

// re export for convenience.
pub use config::Config;
pub use error::{Error, Result};
