//! Key/value storage engine contract.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::Bound;

use crate::encoding::keycode;
use crate::error::Result;

pub type KeyRange = (Bound<Vec<u8>>, Bound<Vec<u8>>);

/// Iterator over key/value pairs in ascending key order.
pub type Scan<'a> = Box<dyn DoubleEndedIterator<Item = Result<(Vec<u8>, Vec<u8>)>> + 'a>;

/// A key/value store. Keys and values are arbitrary byte strings, and keys are
/// ordered lexicographically. Writes are only guaranteed durable after `flush`.
pub trait Engine: Display + Send + Sync {
    /// Deletes a key. Does nothing if it doesn't exist.
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Flushes buffered data to the storage medium.
    fn flush(&mut self) -> Result<()>;

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn scan(&mut self, range: KeyRange) -> Scan<'_>;

    fn scan_prefix(&mut self, prefix: &[u8]) -> Scan<'_> {
        self.scan(keycode::prefix_range(prefix))
    }

    /// Stores a value, replacing any existing value for the key.
    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()>;

    fn status(&self) -> Result<Status>;
}

/// Engine statistics. Sizes are in bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub keys: u64,
    /// Logical size of live keys and values.
    pub size: u64,
    /// On-disk size of live entries, including per-entry metadata.
    pub disk_size: u64,
    pub garbage_disk_size: u64,
    pub total_disk_size: u64,
}

impl Status {
    pub fn garbage_percent(&self) -> f64 {
        if self.total_disk_size == 0 {
            return 0.0;
        }
        self.garbage_disk_size as f64 / self.total_disk_size as f64 * 100.0
    }
}

/// True if no key can fall inside the range. `BTreeMap::range` panics on these.
pub(crate) fn is_empty_range(range: &KeyRange) -> bool {
    match range {
        (Bound::Included(start), Bound::Included(end)) => start > end,
        (Bound::Included(start), Bound::Excluded(end))
        | (Bound::Excluded(start), Bound::Included(end))
        | (Bound::Excluded(start), Bound::Excluded(end)) => start >= end,
        _ => false,
    }
}
