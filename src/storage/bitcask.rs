//! BitCask: a log-structured engine with an in-memory key directory.
//!
//! Every write is appended to a single log file. Entry layout:
//!
//! `key_len (u32 BE) | value_len (i32 BE, -1 for tombstones) | key | value`
//!
//! The key directory maps each live key to the position and length of its
//! latest value, and is rebuilt by scanning the log on open. Overwritten and
//! deleted entries stay in the file as garbage until `compact` rewrites it.

use std::collections::{btree_map, BTreeMap};
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::engine::{is_empty_range, Engine, KeyRange, Scan, Status};
use crate::error::{Error, Result};

const ENTRY_HEADER_LEN: u64 = 8; // key_len (4) + value_len (4)

/// Key -> (value position, value length).
type KeyDir = BTreeMap<Vec<u8>, (u64, u32)>;

pub struct BitCask {
    log: Log,
    keydir: KeyDir,
}

impl BitCask {
    /// Opens or creates the log at `path` and rebuilds the key directory.
    pub fn new(path: PathBuf) -> Result<Self> {
        let mut log = Log::new(path)?;
        let keydir = log.build_keydir()?;
        info!(path = %log.path.display(), keys = keydir.len(), "opened bitcask log");
        Ok(Self { log, keydir })
    }

    /// Like `new`, but compacts on open when the share of garbage exceeds
    /// `garbage_ratio_threshold` (0.0 to 1.0).
    pub fn new_compact(path: PathBuf, garbage_ratio_threshold: f64) -> Result<Self> {
        let mut engine = Self::new(path)?;
        let status = engine.status()?;
        let garbage_ratio = status.garbage_percent() / 100.0;
        if status.garbage_disk_size > 0 && garbage_ratio > garbage_ratio_threshold {
            info!(
                garbage_mb = status.garbage_disk_size as f64 / 1024.0 / 1024.0,
                garbage_percent = status.garbage_percent(),
                "compacting bitcask log"
            );
            engine.compact()?;
            let status = engine.status()?;
            info!(size_mb = status.total_disk_size as f64 / 1024.0 / 1024.0, "compacted bitcask log");
        }
        Ok(engine)
    }

    /// Rewrites the log with only live entries, replacing the old file.
    pub fn compact(&mut self) -> Result<()> {
        let mut tmp_path = self.log.path.clone().into_os_string();
        tmp_path.push(".new");
        let (mut new_log, new_keydir) = self.write_log(PathBuf::from(tmp_path))?;

        std::fs::rename(&new_log.path, &self.log.path)?;
        new_log.path = self.log.path.clone();

        self.log = new_log;
        self.keydir = new_keydir;
        Ok(())
    }

    fn write_log(&mut self, path: PathBuf) -> Result<(Log, KeyDir)> {
        let mut new_keydir = KeyDir::new();
        let mut new_log = Log::new(path)?;
        new_log.file.set_len(0)?;
        for (key, (value_pos, value_len)) in self.keydir.iter() {
            let value = self.log.read_value(*value_pos, *value_len)?;
            let (pos, len) = new_log.write_entry(key, Some(&value))?;
            new_keydir.insert(key.clone(), (pos + len as u64 - *value_len as u64, *value_len));
        }
        new_log.file.sync_all()?;
        Ok((new_log, new_keydir))
    }

    pub fn path(&self) -> &Path {
        &self.log.path
    }
}

impl Display for BitCask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bitcask")
    }
}

impl Engine for BitCask {
    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.log.write_entry(key, None)?;
        self.keydir.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.log.file.sync_all()?;
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.keydir.get(key) {
            Some((value_pos, value_len)) => Ok(Some(self.log.read_value(*value_pos, *value_len)?)),
            None => Ok(None),
        }
    }

    fn scan(&mut self, range: KeyRange) -> Scan<'_> {
        if is_empty_range(&range) {
            return Box::new(std::iter::empty());
        }
        Box::new(ScanIterator {
            inner: self.keydir.range(range),
            log: &mut self.log,
        })
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        let (pos, len) = self.log.write_entry(key, Some(&value))?;
        let value_len = value.len() as u32;
        self.keydir
            .insert(key.to_vec(), (pos + len as u64 - value_len as u64, value_len));
        Ok(())
    }

    fn status(&self) -> Result<Status> {
        let keys = self.keydir.len() as u64;
        let size = self
            .keydir
            .iter()
            .map(|(key, (_, value_len))| key.len() as u64 + *value_len as u64)
            .sum::<u64>();
        let total_disk_size = self.log.file.metadata()?.len();
        let disk_size = size + keys * ENTRY_HEADER_LEN;
        Ok(Status {
            name: self.to_string(),
            keys,
            size,
            disk_size,
            garbage_disk_size: total_disk_size.saturating_sub(disk_size),
            total_disk_size,
        })
    }
}

struct ScanIterator<'a> {
    inner: btree_map::Range<'a, Vec<u8>, (u64, u32)>,
    log: &'a mut Log,
}

impl ScanIterator<'_> {
    fn map_item(&mut self, item: (&Vec<u8>, &(u64, u32))) -> Result<(Vec<u8>, Vec<u8>)> {
        let (key, (value_pos, value_len)) = item;
        Ok((key.clone(), self.log.read_value(*value_pos, *value_len)?))
    }
}

impl Iterator for ScanIterator<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|item| self.map_item(item))
    }
}

impl DoubleEndedIterator for ScanIterator<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.inner.next_back().map(|item| self.map_item(item))
    }
}

/// The append-only log file.
struct Log {
    path: PathBuf,
    file: File,
}

impl Log {
    fn new(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { path, file })
    }

    /// Scans the log to rebuild the key directory. An incomplete entry at the
    /// end (e.g. after a crash mid-write) is truncated away.
    fn build_keydir(&mut self) -> Result<KeyDir> {
        let file_len = self.file.metadata()?.len();
        let mut keydir = KeyDir::new();
        let mut truncate_at = None;
        let mut r = BufReader::new(&mut self.file);
        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            match read_entry(&mut r, pos, file_len) {
                Ok((key, value_pos, Some(value_len))) => {
                    keydir.insert(key, (value_pos, value_len));
                    pos = value_pos + value_len as u64;
                }
                Ok((key, value_pos, None)) => {
                    keydir.remove(&key);
                    pos = value_pos;
                }
                Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                    truncate_at = Some(pos);
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(pos) = truncate_at {
            warn!(offset = pos, path = %self.path.display(), "found incomplete log entry, truncating");
            self.file.set_len(pos)?;
        }
        Ok(keydir)
    }

    fn read_value(&mut self, value_pos: u64, value_len: u32) -> Result<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.seek(SeekFrom::Start(value_pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Appends an entry; `None` writes a tombstone. Returns the entry's
    /// position and length. A failed write is truncated away, so the next
    /// entry starts where this one did.
    fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> Result<(u64, u32)> {
        let (key_len, value_len_or_tombstone, len) = entry_lengths(key.len(), value.map(|v| v.len()))?;

        let pos = self.file.seek(SeekFrom::End(0))?;
        let written = {
            let mut w = BufWriter::with_capacity(len as usize, &mut self.file);
            w.write_all(&key_len.to_be_bytes())
                .and_then(|_| w.write_all(&value_len_or_tombstone.to_be_bytes()))
                .and_then(|_| w.write_all(key))
                .and_then(|_| value.map_or(Ok(()), |v| w.write_all(v)))
                .and_then(|_| w.flush())
        };
        if let Err(err) = written {
            warn!(offset = pos, path = %self.path.display(), %err, "failed log write, truncating");
            self.file.set_len(pos)?;
            return Err(err.into());
        }
        Ok((pos, len))
    }
}

/// Header fields and total length of an entry, or an error if the key or
/// value don't fit the entry format.
fn entry_lengths(key_len: usize, value_len: Option<usize>) -> Result<(u32, i32, u32)> {
    let key_len = u32::try_from(key_len).map_err(|_| Error::Value(format!("key length {key_len} too large")))?;
    let value_len_or_tombstone = match value_len {
        Some(len) => i32::try_from(len).map_err(|_| Error::Value(format!("value length {len} too large")))?,
        None => -1,
    };
    let len = (ENTRY_HEADER_LEN as u32)
        .checked_add(key_len)
        .and_then(|len| len.checked_add(value_len_or_tombstone.max(0) as u32))
        .ok_or_else(|| Error::Value("entry too large".into()))?;
    Ok((key_len, value_len_or_tombstone, len))
}

/// Reads one entry at `pos`. Returns the key, the value position and the
/// value length (None for tombstones). Entries running past `file_len` are
/// reported as `UnexpectedEof`.
fn read_entry<R: Read + Seek>(
    r: &mut BufReader<R>,
    pos: u64,
    file_len: u64,
) -> std::io::Result<(Vec<u8>, u64, Option<u32>)> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let key_len = u32::from_be_bytes(len_buf);
    r.read_exact(&mut len_buf)?;
    let value_len = match i32::from_be_bytes(len_buf) {
        l if l >= 0 => Some(l as u32),
        _ => None,
    };

    let value_pos = pos + ENTRY_HEADER_LEN + key_len as u64;
    let end = value_pos + value_len.unwrap_or(0) as u64;
    if end > file_len {
        return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "entry extends past end of log"));
    }

    let mut key = vec![0; key_len as usize];
    r.read_exact(&mut key)?;
    if let Some(value_len) = value_len {
        r.seek_relative(value_len as i64)?;
    }
    Ok((key, value_pos, value_len))
}
