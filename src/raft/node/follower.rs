//! Follower role: replicates the leader's log, votes, and forwards client requests.

use std::collections::HashSet;
use tracing::{debug, info, warn};

use super::{Candidate, Node, RawNode, Role};
use crate::error::{Error, Result};
use crate::raft::{Address, Envelope, Message, NodeId, RequestId, Term, Ticks};

/// A follower replicates entries from the leader and votes in elections.
/// Without contact from a leader for an election timeout, it campaigns.
#[derive(Debug)]
pub struct Follower {
    /// The leader in the current term, once known.
    pub(super) leader: Option<NodeId>,
    /// The candidate voted for in the current term.
    voted_for: Option<NodeId>,
    /// Ticks since the last message from the leader, or since casting a vote.
    leader_seen: Ticks,
    election_timeout: Ticks,
    /// Client requests forwarded to the leader, awaiting a response.
    forwarded: HashSet<RequestId>,
}

impl Follower {
    pub(super) fn new(leader: Option<NodeId>, voted_for: Option<NodeId>, election_timeout: Ticks) -> Self {
        Self { leader, voted_for, leader_seen: 0, election_timeout, forwarded: HashSet::new() }
    }
}

impl Role for Follower {}

impl RawNode<Follower> {
    /// Starts an election.
    pub(super) fn into_candidate(mut self) -> Result<RawNode<Candidate>> {
        self.abort_forwarded()?;
        let election_timeout = self.random_election_timeout();
        let mut node = self.into_role(Candidate::new(election_timeout));
        node.campaign()?;
        Ok(node)
    }

    /// Moves to a newer term as a leaderless follower, or records the leader
    /// of the current term.
    pub(super) fn into_follower(mut self, term: Term, leader: Option<NodeId>) -> Result<RawNode<Follower>> {
        if term < self.term {
            return Err(Error::Internal(format!("term regression {} → {}", self.term, term)));
        }
        if term == self.term {
            match (self.role.leader, leader) {
                (_, None) => return Ok(self),
                (None, Some(leader)) => {
                    info!(term, leader, "following leader");
                    self.role.leader = Some(leader);
                    self.role.leader_seen = 0;
                    return Ok(self);
                }
                (Some(current), Some(leader)) if current == leader => return Ok(self),
                (Some(current), Some(leader)) => {
                    return Err(Error::Internal(format!(
                        "saw leader {leader} in term {term}, but already following {current}"
                    )))
                }
            }
        }

        match leader {
            Some(leader) => info!(term, leader, "discovered new term, following leader"),
            None => info!(term, "discovered new term, following no leader"),
        }
        self.term = term;
        self.log.set_term_vote(term, None)?;
        self.abort_forwarded()?;
        self.role = Follower::new(leader, None, self.random_election_timeout());
        Ok(self)
    }

    pub(super) fn step(mut self, msg: Envelope) -> Result<Node> {
        match msg.message {
            Message::Heartbeat { commit_index, commit_term } => {
                let from = self.sender_node(&msg.from)?;
                self = self.into_follower(msg.term, Some(from))?;
                self.role.leader_seen = 0;

                if commit_index > self.log.get_commit_index().0 && self.log.has(commit_index, commit_term)? {
                    self.log.commit(commit_index)?;
                    self.maybe_apply()?;
                }
                let (last_index, last_term) = self.log.get_last_index();
                self.send(msg.from, Message::HeartbeatResponse { last_index, last_term })?;
            }

            Message::Append { base_index, base_term, entries } => {
                let from = self.sender_node(&msg.from)?;
                self = self.into_follower(msg.term, Some(from))?;
                self.role.leader_seen = 0;

                if !self.log.has(base_index, base_term)? {
                    debug!(base_index, base_term, "rejecting append with missing base");
                    self.send(msg.from, Message::AppendResponse { match_index: 0, reject_index: base_index })?;
                } else {
                    let match_index = entries.last().map(|e| e.index).unwrap_or(base_index);
                    self.log.splice(entries)?;
                    self.send(msg.from, Message::AppendResponse { match_index, reject_index: 0 })?;
                }
            }

            Message::Campaign { last_index, last_term } => {
                let from = self.sender_node(&msg.from)?;
                if self.role.leader.is_some() {
                    debug!(from, "ignoring campaign while following a leader");
                    return Ok(self.into());
                }
                let vote = match self.role.voted_for {
                    Some(voted_for) if voted_for != from => false,
                    _ => (last_term, last_index) >= {
                        let (our_index, our_term) = self.log.get_last_index();
                        (our_term, our_index)
                    },
                };
                if vote {
                    info!(term = self.term, candidate = from, "voting for candidate");
                    self.log.set_term_vote(self.term, Some(from))?;
                    self.role.voted_for = Some(from);
                    self.role.leader_seen = 0;
                }
                self.send(msg.from, Message::CampaignResponse { vote })?;
            }

            Message::ClientRequest { id, request } => match (msg.from, self.role.leader) {
                (Address::Client, Some(leader)) => {
                    self.role.forwarded.insert(id.clone());
                    self.send(Address::Node(leader), Message::ClientRequest { id, request })?;
                }
                (Address::Client, None) => {
                    self.queue_request(Envelope {
                        message: Message::ClientRequest { id, request },
                        ..msg
                    })?;
                }
                (from, _) => self.abort_request(from, id)?,
            },

            Message::ClientResponse { id, response } => {
                if self.role.forwarded.remove(&id) {
                    self.send(Address::Client, Message::ClientResponse { id, response })?;
                } else {
                    debug!(?id, "dropping response for unknown request");
                }
            }

            // Stale responses from an earlier term in which this node
            // campaigned or led.
            Message::CampaignResponse { .. }
            | Message::HeartbeatResponse { .. }
            | Message::AppendResponse { .. } => {
                debug!(from = ?msg.from, "ignoring stale response");
            }
        }
        Ok(self.into())
    }

    pub(super) fn tick(mut self) -> Result<Node> {
        self.role.leader_seen = self.role.leader_seen.saturating_add(1);
        if self.role.leader_seen >= self.role.election_timeout {
            info!(term = self.term, leader = ?self.role.leader, "election timeout, campaigning");
            return Ok(self.into_candidate()?.into());
        }
        Ok(self.into())
    }

    /// Answers forwarded requests with an abort. The leader they were sent
    /// to may never respond.
    fn abort_forwarded(&mut self) -> Result<()> {
        for id in std::mem::take(&mut self.role.forwarded) {
            warn!(?id, "aborting forwarded request");
            self.abort_request(Address::Client, id)?;
        }
        Ok(())
    }

    fn sender_node(&self, from: &Address) -> Result<NodeId> {
        match from {
            Address::Node(id) => Ok(*id),
            from => Err(Error::Internal(format!("unexpected sender {from:?}"))),
        }
    }
}
