//! Candidate role: campaigns for leadership.

use std::collections::HashSet;
use tracing::{debug, info};

use super::{Follower, Leader, Node, RawNode, Role};
use crate::error::{Error, Result};
use crate::raft::{Address, Envelope, Message, NodeId, Term, Ticks};

/// A candidate campaigns for leadership in a new term. It wins with votes
/// from a quorum, follows a leader that emerges in its term, or starts over
/// in a new term when the election times out.
#[derive(Debug)]
pub struct Candidate {
    votes: HashSet<NodeId>,
    election_duration: Ticks,
    election_timeout: Ticks,
}

impl Candidate {
    pub(super) fn new(election_timeout: Ticks) -> Self {
        Self { votes: HashSet::new(), election_duration: 0, election_timeout }
    }
}

impl Role for Candidate {}

impl RawNode<Candidate> {
    /// Starts a new term and asks the peers for votes.
    pub(super) fn campaign(&mut self) -> Result<()> {
        let term = self.term + 1;
        info!(term, "starting election");
        self.role = Candidate::new(self.random_election_timeout());
        self.role.votes.insert(self.id);
        self.term = term;
        self.log.set_term_vote(term, Some(self.id))?;

        let (last_index, last_term) = self.log.get_last_index();
        self.broadcast(Message::Campaign { last_index, last_term })
    }

    pub(super) fn into_leader(self) -> Result<RawNode<Leader>> {
        info!(term = self.term, votes = self.role.votes.len(), "won election, becoming leader");
        let (last_index, _) = self.log.get_last_index();
        let leader = Leader::new(&self.peers, last_index);
        let mut node = self.into_role(leader);

        // A no-op entry in the new term lets earlier entries commit.
        node.log.append(None)?;
        node.replicate()?;
        node.maybe_commit()?;
        Ok(node)
    }

    /// Follows the leader of this term, or becomes a leaderless follower in
    /// a newer term.
    pub(super) fn into_follower(mut self, term: Term, leader: Option<NodeId>) -> Result<RawNode<Follower>> {
        if term < self.term {
            return Err(Error::Internal(format!("term regression {} → {}", self.term, term)));
        }
        let election_timeout = self.random_election_timeout();
        match leader {
            Some(leader) if term == self.term => {
                info!(term, leader, "lost election, following leader");
                let voted_for = Some(self.id);
                Ok(self.into_role(Follower::new(Some(leader), voted_for, election_timeout)))
            }
            Some(_) => Err(Error::Internal("can't follow a leader in another term".into())),
            None if term == self.term => {
                Err(Error::Internal("can't become leaderless follower in current term".into()))
            }
            None => {
                info!(term, "discovered new term, following no leader");
                self.term = term;
                self.log.set_term_vote(term, None)?;
                Ok(self.into_role(Follower::new(None, None, election_timeout)))
            }
        }
    }

    pub(super) fn step(mut self, msg: Envelope) -> Result<Node> {
        match msg.message {
            // A leader was elected in this term.
            Message::Heartbeat { .. } | Message::Append { .. } => {
                let Address::Node(from) = msg.from else {
                    return Err(Error::Internal(format!("unexpected sender {:?}", msg.from)));
                };
                return self.into_follower(msg.term, Some(from))?.step(msg);
            }

            Message::CampaignResponse { vote: true } => {
                if let Address::Node(from) = msg.from {
                    self.role.votes.insert(from);
                }
                if self.role.votes.len() >= self.quorum_size() {
                    return Ok(self.into_leader()?.into());
                }
            }

            Message::CampaignResponse { vote: false } => {}

            // Another candidate in this term; this node voted for itself.
            Message::Campaign { .. } => {
                self.send(msg.from, Message::CampaignResponse { vote: false })?;
            }

            Message::ClientRequest { id, request } => match msg.from {
                Address::Client => {
                    self.queue_request(Envelope {
                        message: Message::ClientRequest { id, request },
                        ..msg
                    })?;
                }
                from => self.abort_request(from, id)?,
            },

            Message::HeartbeatResponse { .. }
            | Message::AppendResponse { .. }
            | Message::ClientResponse { .. } => {
                debug!(from = ?msg.from, "ignoring message as candidate");
            }
        }
        Ok(self.into())
    }

    pub(super) fn tick(mut self) -> Result<Node> {
        self.role.election_duration = self.role.election_duration.saturating_add(1);
        if self.role.election_duration >= self.role.election_timeout {
            self.campaign()?;
        }
        Ok(self.into())
    }
}
