//! Configuration loading and defaults.

use anyhow::{bail, ensure, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::raft::{NodeId, Options};
use crate::storage::{BitCask, Engine, Memory};

/// Runtime configuration for a raftdb node.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// This node's ID. Default 1.
    pub id: NodeId,

    /// IDs of the other nodes in the cluster. Default empty (single node).
    pub peers: Vec<NodeId>,

    /// Listen address for peers and clients. Default "127.0.0.1:9605".
    pub listen_addr: String,

    /// Data directory for the Raft log. Default "data".
    pub data_dir: String,

    /// Storage engine for the Raft log: "bitcask" or "memory".
    pub storage: String,

    /// Garbage ratio above which the BitCask log is compacted on startup.
    /// Default 0.2.
    pub compact_threshold: f64,

    /// Whether to fsync the Raft log on every write. Default true.
    pub fsync: bool,

    /// Ticks between leader heartbeats. Default 3.
    pub heartbeat_interval: u8,

    /// Election timeout range in ticks, [min, max). Default 10..20.
    pub election_timeout_min: u8,
    pub election_timeout_max: u8,

    /// Log filter used when RUST_LOG is unset. Default "info".
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: 1,
            peers: Vec::new(),
            listen_addr: "127.0.0.1:9605".to_string(),
            data_dir: "data".to_string(),
            storage: "bitcask".to_string(),
            compact_threshold: 0.2,
            fsync: true,
            heartbeat_interval: 3,
            election_timeout_min: 10,
            election_timeout_max: 20,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load config from a TOML file. Empty file returns default config.
    pub fn from_path(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        let c: Config = toml::from_str(&s)?;
        c.validate()?;
        Ok(c)
    }

    /// Use default config. Convenience for tests and minimal setups.
    pub fn default_config() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.id > 0, "id must be positive");
        ensure!(!self.peers.contains(&self.id), "peers must not include the node itself");
        let unique: HashSet<_> = self.peers.iter().collect();
        ensure!(unique.len() == self.peers.len(), "peers must be unique");
        if !matches!(self.storage.as_str(), "bitcask" | "memory") {
            bail!("unknown storage engine {:?}", self.storage);
        }
        ensure!(
            (0.0..=1.0).contains(&self.compact_threshold),
            "compact_threshold must be between 0 and 1"
        );
        ensure!(self.heartbeat_interval > 0, "heartbeat_interval must be positive");
        ensure!(
            self.election_timeout_min < self.election_timeout_max,
            "election_timeout_min must be below election_timeout_max"
        );
        ensure!(
            self.heartbeat_interval < self.election_timeout_min,
            "heartbeat_interval must be below election_timeout_min"
        );
        Ok(())
    }

    pub fn peer_set(&self) -> HashSet<NodeId> {
        self.peers.iter().copied().collect()
    }

    pub fn raft_options(&self) -> Options {
        Options {
            heartbeat_interval: self.heartbeat_interval,
            election_timeout_range: self.election_timeout_min..self.election_timeout_max,
        }
    }

    /// Path of the BitCask file holding the Raft log.
    pub fn raft_log_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("raft")
    }

    /// Opens the configured storage engine for the Raft log.
    pub fn open_storage(&self) -> Result<Box<dyn Engine>> {
        Ok(match self.storage.as_str() {
            "bitcask" => Box::new(BitCask::new_compact(self.raft_log_path(), self.compact_threshold)?),
            "memory" => Box::new(Memory::new()),
            other => bail!("unknown storage engine {other:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn default_config_valid() {
        let c = Config::default();
        c.validate().unwrap();
        assert_eq!(c.storage, "bitcask");
        assert_eq!(c.raft_options(), Options::default());
    }

    #[test]
    fn from_path() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "id = 2\npeers = [1, 3]\nstorage = \"memory\"\nelection_timeout_min = 5").unwrap();
        let c = Config::from_path(f.path()).unwrap();
        assert_eq!(c.id, 2);
        assert_eq!(c.peer_set(), HashSet::from([1, 3]));
        assert_eq!(c.raft_options().election_timeout_range, 5..20);
        assert!(c.fsync);

        let empty = NamedTempFile::new().unwrap();
        assert_eq!(Config::from_path(empty.path()).unwrap().id, 1);
    }

    #[test]
    fn invalid() {
        let cases = [
            "id = 0",
            "peers = [1]",
            "id = 2\npeers = [1, 1]",
            "storage = \"rocks\"",
            "compact_threshold = 1.5",
            "heartbeat_interval = 0",
            "election_timeout_min = 20",
            "heartbeat_interval = 10",
        ];
        for case in cases {
            let mut f = NamedTempFile::new().unwrap();
            write!(f, "{case}").unwrap();
            assert!(Config::from_path(f.path()).is_err(), "{case}");
        }
    }

    #[test]
    fn open_storage() {
        let dir = TempDir::new().unwrap();
        let c = Config { data_dir: dir.path().display().to_string(), ..Config::default() };
        let mut engine = c.open_storage().unwrap();
        engine.set(b"k", b"v".to_vec()).unwrap();
        assert_eq!(engine.to_string(), "bitcask");
        assert!(dir.path().join("raft").exists());

        let c = Config { storage: "memory".to_string(), ..Config::default() };
        assert_eq!(c.open_storage().unwrap().to_string(), "memory");
    }
}
