//! Key/value storage engines.

pub mod bitcask;
pub mod engine;
pub mod memory;

pub use bitcask::BitCask;
pub use engine::{Engine, KeyRange, Scan, Status};
pub use memory::Memory;
