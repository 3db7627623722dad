//! Leader role: replicates the log, commits by quorum and serves clients.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use super::{quorum_value, Follower, Node, RawNode, Role};
use crate::error::{Error, Result};
use crate::raft::{Address, Envelope, Index, Message, NodeId, Request, RequestId, Response, Status, Term, Ticks};

/// Replication progress of a peer.
#[derive(Debug)]
struct Progress {
    /// The next index to send.
    next: Index,
    /// The last index known to match the leader's log.
    matched: Index,
}

/// A write waiting for its entry to be applied.
#[derive(Debug)]
struct Write {
    from: Address,
    id: RequestId,
}

/// The leader accepts client writes, replicates them to the followers and
/// applies them once committed.
#[derive(Debug)]
pub struct Leader {
    progress: HashMap<NodeId, Progress>,
    since_heartbeat: Ticks,
    /// Pending writes, by log index.
    writes: HashMap<Index, Write>,
}

impl Leader {
    pub(super) fn new(peers: &HashSet<NodeId>, last_index: Index) -> Self {
        let progress = peers
            .iter()
            .map(|peer| (*peer, Progress { next: last_index + 1, matched: 0 }))
            .collect();
        Self { progress, since_heartbeat: 0, writes: HashMap::new() }
    }
}

impl Role for Leader {}

impl RawNode<Leader> {
    /// Steps down as a leaderless follower in a newer term.
    pub(super) fn into_follower(mut self, term: Term) -> Result<RawNode<Follower>> {
        if term <= self.term {
            return Err(Error::Internal(format!(
                "leader can only step down into a newer term, got {term} in {}",
                self.term
            )));
        }
        info!(term, "discovered new term, stepping down");
        self.term = term;
        self.log.set_term_vote(term, None)?;
        for (index, write) in std::mem::take(&mut self.role.writes) {
            warn!(index, id = ?write.id, "aborting pending write");
            self.abort_request(write.from, write.id)?;
        }
        let election_timeout = self.random_election_timeout();
        Ok(self.into_role(Follower::new(None, None, election_timeout)))
    }

    pub(super) fn step(mut self, msg: Envelope) -> Result<Node> {
        match msg.message {
            Message::Heartbeat { .. } | Message::Append { .. } => {
                return Err(Error::Internal(format!(
                    "saw other leader {:?} in term {}",
                    msg.from, msg.term
                )));
            }

            Message::HeartbeatResponse { last_index, last_term } => {
                let peer = self.peer(&msg.from)?;
                let matches = self.log.has(last_index, last_term)?;
                if matches {
                    // The peer's log matches ours up to its last index, even if
                    // its append responses were lost.
                    let progress = self.progress_mut(peer)?;
                    if last_index > progress.matched {
                        progress.matched = last_index;
                        progress.next = progress.next.max(last_index + 1);
                        self.maybe_commit()?;
                    }
                }
                if !matches || last_index < self.log.get_last_index().0 {
                    self.send_append(peer)?;
                }
            }

            Message::AppendResponse { match_index, reject_index } => {
                let peer = self.peer(&msg.from)?;
                let progress = self.progress_mut(peer)?;
                if reject_index > 0 {
                    if reject_index >= progress.next {
                        debug!(peer, reject_index, "ignoring stale append rejection");
                        return Ok(self.into());
                    }
                    progress.next = reject_index.max(progress.matched + 1);
                    debug!(peer, next = progress.next, "append rejected, backing off");
                    self.send_append(peer)?;
                } else if match_index > progress.matched {
                    progress.matched = match_index;
                    progress.next = progress.next.max(match_index + 1);
                    self.maybe_commit()?;
                }
            }

            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { vote: false })?;
            }

            Message::ClientRequest { id, request } => match request {
                Request::Mutate(command) => {
                    let index = self.log.append(Some(command))?;
                    self.role.writes.insert(index, Write { from: msg.from, id });
                    self.replicate()?;
                    self.maybe_commit()?;
                }
                Request::Query(command) => {
                    let response = self.state.query(command).map(Response::Query);
                    self.send(msg.from, Message::ClientResponse { id, response })?;
                }
                Request::Status => {
                    let response = self.status().map(Response::Status);
                    self.send(msg.from, Message::ClientResponse { id, response })?;
                }
            },

            Message::CampaignResponse { .. } | Message::ClientResponse { .. } => {
                debug!(from = ?msg.from, "ignoring message as leader");
            }
        }
        Ok(self.into())
    }

    pub(super) fn tick(mut self) -> Result<Node> {
        self.role.since_heartbeat = self.role.since_heartbeat.saturating_add(1);
        if self.role.since_heartbeat >= self.opts.heartbeat_interval {
            self.heartbeat()?;
            self.role.since_heartbeat = 0;
        }
        Ok(self.into())
    }

    fn heartbeat(&mut self) -> Result<()> {
        let (commit_index, commit_term) = self.log.get_commit_index();
        self.broadcast(Message::Heartbeat { commit_index, commit_term })
    }

    /// Sends pending entries to every peer that is behind.
    pub(super) fn replicate(&mut self) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let mut peers: Vec<NodeId> = self
            .role
            .progress
            .iter()
            .filter(|(_, p)| p.next <= last_index)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort_unstable();
        for peer in peers {
            self.send_append(peer)?;
        }
        Ok(())
    }

    /// Sends a peer the entries from its next index onwards.
    fn send_append(&mut self, peer: NodeId) -> Result<()> {
        let next = self.progress_mut(peer)?.next;
        let base_index = next - 1;
        let base_term = match base_index {
            0 => 0,
            index => {
                self.log
                    .get(index)?
                    .ok_or_else(|| Error::Internal(format!("missing base entry {index}")))?
                    .term
            }
        };
        let entries = self.log.scan(next..)?.collect::<Result<Vec<_>>>()?;
        debug!(peer, base_index, entries = entries.len(), "replicating entries");
        self.send(Address::Node(peer), Message::Append { base_index, base_term, entries })
    }

    /// Commits the highest index replicated on a quorum, if it's from the
    /// current term, then applies it and answers the writes.
    pub(super) fn maybe_commit(&mut self) -> Result<()> {
        let (last_index, _) = self.log.get_last_index();
        let matched: Vec<Index> = self
            .role
            .progress
            .values()
            .map(|p| p.matched)
            .chain(std::iter::once(last_index))
            .collect();
        let quorum_index = quorum_value(matched);
        let (commit_index, _) = self.log.get_commit_index();
        if quorum_index <= commit_index {
            return Ok(());
        }
        // Entries from earlier terms only commit along with one from this term.
        match self.log.get(quorum_index)? {
            Some(entry) if entry.term == self.term => {}
            _ => return Ok(()),
        }
        self.log.commit(quorum_index)?;
        debug!(index = quorum_index, "committed entries");

        for (index, result) in self.maybe_apply()? {
            if let Some(write) = self.role.writes.remove(&index) {
                let response = result.map(Response::Mutate);
                self.send(write.from, Message::ClientResponse { id: write.id, response })?;
            }
        }
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        let (last_index, _) = self.log.get_last_index();
        let (commit_index, _) = self.log.get_commit_index();
        let mut match_index: BTreeMap<NodeId, Index> =
            self.role.progress.iter().map(|(peer, p)| (*peer, p.matched)).collect();
        match_index.insert(self.id, last_index);
        Ok(Status {
            server: self.id,
            leader: self.id,
            term: self.term,
            last_index,
            commit_index,
            applied_index: self.state.applied_index(),
            match_index,
            storage: self.log.status()?,
        })
    }

    fn peer(&self, from: &Address) -> Result<NodeId> {
        match from {
            Address::Node(id) if self.role.progress.contains_key(id) => Ok(*id),
            from => Err(Error::Internal(format!("unknown peer {from:?}"))),
        }
    }

    fn progress_mut(&mut self, peer: NodeId) -> Result<&mut Progress> {
        self.role
            .progress
            .get_mut(&peer)
            .ok_or_else(|| Error::Internal(format!("unknown peer {peer}")))
    }
}
