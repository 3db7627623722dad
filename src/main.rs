//! raftdb node binary.
//! Usage: raftdb [CONFIG_PATH]
//!
//! Opens the node's Raft log, then reads SQL statements from stdin, one per
//! line, and prints their syntax trees as JSON.

use anyhow::Result;
use raftdb::raft::Log;
use raftdb::Config;
use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let config = match env::args().nth(1) {
        Some(path) => Config::from_path(&PathBuf::from(path))?,
        None => Config::default_config(),
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(
        id = config.id,
        peers = ?config.peers,
        listen_addr = %config.listen_addr,
        "raftdb starting"
    );

    let log = Log::new(config.open_storage()?, config.fsync)?;
    let (term, vote) = log.get_term_vote();
    let (last_index, last_term) = log.get_last_index();
    let (commit_index, _) = log.get_commit_index();
    let status = log.status()?;
    tracing::info!(
        term,
        vote = ?vote,
        last_index,
        last_term,
        commit_index,
        storage = %status.name,
        keys = status.keys,
        garbage_percent = status.garbage_percent(),
        "opened raft log"
    );

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match raftdb::sql::parse(&line) {
            Ok(statement) => writeln!(stdout, "{}", serde_json::to_string(&statement)?)?,
            Err(err) => writeln!(stdout, "{err}")?,
        }
    }

    tracing::info!("raftdb exiting");
    Ok(())
}
