//! The durable Raft log.
//!
//! Entries, the current term/vote and the commit index live in a storage
//! engine under keycode-encoded keys, with JSON values. The log caches the
//! last entry and the commit position in memory.

use serde::{Deserialize, Serialize};
use std::ops::{Bound, RangeBounds};

use super::{Index, NodeId, Term};
use crate::encoding::keycode;
use crate::error::{Error, Result};
use crate::storage::{self, Engine};

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub index: Index,
    /// The term in which the leader received the entry.
    pub term: Term,
    /// The state machine command. `None` is a no-op appended by new leaders.
    pub command: Option<Vec<u8>>,
}

/// Storage keys. Variant order determines key order.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub enum Key {
    TermVote,
    Entry(Index),
    CommitIndex,
}

impl Key {
    fn encode(&self) -> Result<Vec<u8>> {
        keycode::serialize(self)
    }
}

/// Key prefixes for scans. Must match the `Key` variants.
#[derive(Debug, Serialize)]
enum KeyPrefix {
    #[allow(dead_code)]
    TermVote,
    Entry,
}

impl KeyPrefix {
    fn encode(&self) -> Result<Vec<u8>> {
        keycode::serialize(self)
    }
}

pub struct Log {
    engine: Box<dyn Engine>,
    term: Term,
    vote: Option<NodeId>,
    last_index: Index,
    last_term: Term,
    commit_index: Index,
    commit_term: Term,
    /// Flush the engine after every write.
    fsync: bool,
}

impl Log {
    /// Opens a log stored in the given engine, loading its persisted state.
    pub fn new(mut engine: Box<dyn Engine>, fsync: bool) -> Result<Self> {
        let (term, vote) = match engine.get(&Key::TermVote.encode()?)? {
            Some(value) => serde_json::from_slice(&value)?,
            None => (0, None),
        };
        let (last_index, last_term) = match engine
            .scan_prefix(&KeyPrefix::Entry.encode()?)
            .next_back()
            .transpose()?
        {
            Some((_, value)) => {
                let entry: Entry = serde_json::from_slice(&value)?;
                (entry.index, entry.term)
            }
            None => (0, 0),
        };
        let (commit_index, commit_term) = match engine.get(&Key::CommitIndex.encode()?)? {
            Some(value) => serde_json::from_slice(&value)?,
            None => (0, 0),
        };
        Ok(Self { engine, term, vote, last_index, last_term, commit_index, commit_term, fsync })
    }

    pub fn get_term_vote(&self) -> (Term, Option<NodeId>) {
        (self.term, self.vote)
    }

    pub fn get_last_index(&self) -> (Index, Term) {
        (self.last_index, self.last_term)
    }

    pub fn get_commit_index(&self) -> (Index, Term) {
        (self.commit_index, self.commit_term)
    }

    /// Stores the current term and cast vote. The term can't regress, and a
    /// vote can't change within a term. Always flushed, regardless of fsync,
    /// so a restarted node can't vote twice in a term.
    pub fn set_term_vote(&mut self, term: Term, vote: Option<NodeId>) -> Result<()> {
        if term < self.term {
            return Err(Error::Internal(format!("term regression {} → {}", self.term, term)));
        }
        if term == self.term && self.vote.is_some() && vote != self.vote {
            return Err(Error::Internal(format!(
                "can't change vote in term {} from {:?} to {:?}",
                term, self.vote, vote
            )));
        }
        if term == self.term && vote == self.vote {
            return Ok(());
        }
        self.engine.set(&Key::TermVote.encode()?, serde_json::to_vec(&(term, vote))?)?;
        self.engine.flush()?;
        self.term = term;
        self.vote = vote;
        Ok(())
    }

    /// Appends a command at the current term, returning its index.
    pub fn append(&mut self, command: Option<Vec<u8>>) -> Result<Index> {
        if self.term == 0 {
            return Err(Error::Internal("can't append entry in term 0".into()));
        }
        let entry = Entry { index: self.last_index + 1, term: self.term, command };
        self.engine.set(&Key::Entry(entry.index).encode()?, serde_json::to_vec(&entry)?)?;
        self.maybe_flush()?;
        self.last_index = entry.index;
        self.last_term = entry.term;
        Ok(entry.index)
    }

    /// Commits entries up to and including the given index.
    pub fn commit(&mut self, index: Index) -> Result<Index> {
        if index < self.commit_index {
            return Err(Error::Internal(format!(
                "commit index regression {} → {}",
                self.commit_index, index
            )));
        }
        let entry = self
            .get(index)?
            .ok_or_else(|| Error::Internal(format!("can't commit missing index {index}")))?;
        if index == self.commit_index {
            return Ok(index);
        }
        self.engine
            .set(&Key::CommitIndex.encode()?, serde_json::to_vec(&(entry.index, entry.term))?)?;
        self.maybe_flush()?;
        self.commit_index = entry.index;
        self.commit_term = entry.term;
        Ok(index)
    }

    pub fn get(&mut self, index: Index) -> Result<Option<Entry>> {
        self.engine
            .get(&Key::Entry(index).encode()?)?
            .map(|value| serde_json::from_slice(&value).map_err(Error::from))
            .transpose()
    }

    /// Checks whether the log contains an entry with the given index and
    /// term. Index 0 always matches term 0.
    pub fn has(&mut self, index: Index, term: Term) -> Result<bool> {
        if index == 0 {
            return Ok(term == 0);
        }
        if index > self.last_index {
            return Ok(false);
        }
        if index == self.last_index {
            return Ok(term == self.last_term);
        }
        Ok(self.get(index)?.map(|e| e.term == term).unwrap_or(false))
    }

    /// Iterates over entries in the index range, in order.
    pub fn scan(
        &mut self,
        range: impl RangeBounds<Index>,
    ) -> Result<Box<dyn Iterator<Item = Result<Entry>> + '_>> {
        let from = match range.start_bound() {
            Bound::Included(i) => Bound::Included(Key::Entry(*i).encode()?),
            Bound::Excluded(i) => Bound::Excluded(Key::Entry(*i).encode()?),
            Bound::Unbounded => Bound::Included(Key::Entry(0).encode()?),
        };
        let to = match range.end_bound() {
            Bound::Included(i) => Bound::Included(Key::Entry(*i).encode()?),
            Bound::Excluded(i) => Bound::Excluded(Key::Entry(*i).encode()?),
            Bound::Unbounded => Bound::Included(Key::Entry(Index::MAX).encode()?),
        };
        Ok(Box::new(self.engine.scan((from, to)).map(decode_entry)))
    }

    /// Splices a contiguous run of entries from the leader into the log.
    /// Entries already present with the same term are skipped; at the first
    /// conflicting entry the existing tail is replaced. Returns the index of
    /// the last entry in the log.
    pub fn splice(&mut self, entries: Vec<Entry>) -> Result<Index> {
        let (first, last) = match (entries.first(), entries.last()) {
            (Some(first), Some(last)) => (first.clone(), last.clone()),
            _ => return Ok(self.last_index),
        };
        if first.index == 0 || first.term == 0 {
            return Err(Error::Internal("spliced entries must have index and term > 0".into()));
        }
        if first.index > self.last_index + 1 {
            return Err(Error::Internal(format!(
                "first spliced entry {} must connect to last index {}",
                first.index, self.last_index
            )));
        }
        if last.term > self.term {
            return Err(Error::Internal(format!(
                "spliced entry term {} beyond current term {}",
                last.term, self.term
            )));
        }
        for pair in entries.windows(2) {
            if pair[1].index != pair[0].index + 1 || pair[1].term < pair[0].term {
                return Err(Error::Internal("spliced entries must be contiguous".into()));
            }
        }

        // Skip entries that are already in the log.
        let mut skip = 0;
        {
            let mut existing = self.scan(first.index..=last.index)?;
            for entry in &entries {
                match existing.next().transpose()? {
                    Some(e) if e.term == entry.term => skip += 1,
                    _ => break,
                }
            }
        }
        let entries = &entries[skip..];
        let Some(conflict) = entries.first() else {
            return Ok(self.last_index);
        };
        if conflict.index <= self.commit_index {
            return Err(Error::Internal(format!(
                "spliced entry {} conflicts with commit index {}",
                conflict.index, self.commit_index
            )));
        }

        for entry in entries {
            self.engine.set(&Key::Entry(entry.index).encode()?, serde_json::to_vec(entry)?)?;
        }
        for index in (last.index + 1)..=self.last_index {
            self.engine.delete(&Key::Entry(index).encode()?)?;
        }
        self.maybe_flush()?;
        self.last_index = last.index;
        self.last_term = last.term;
        Ok(self.last_index)
    }

    pub fn status(&self) -> Result<storage::Status> {
        self.engine.status()
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.fsync {
            self.engine.flush()?;
        }
        Ok(())
    }
}

fn decode_entry(item: Result<(Vec<u8>, Vec<u8>)>) -> Result<Entry> {
    let (_, value) = item?;
    Ok(serde_json::from_slice(&value)?)
}
