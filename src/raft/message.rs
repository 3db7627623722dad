//! Messages exchanged between Raft nodes and clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Entry, Index, NodeId, Term};
use crate::error::Result;
use crate::storage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    /// All peers in the cluster, excluding the sender.
    Broadcast,
    Node(NodeId),
    /// The local client of a node.
    Client,
}

/// A message routed between nodes, or between a node and its client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sender's current term. 0 for client messages.
    pub term: Term,
    pub from: Address,
    pub to: Address,
    pub message: Message,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Leaders assert their leadership and propagate the commit index. The
    /// commit term lets followers check that they hold the committed entry.
    Heartbeat { commit_index: Index, commit_term: Term },

    /// Followers report their last entry, so lagging logs can be caught up.
    HeartbeatResponse { last_index: Index, last_term: Term },

    /// Candidates ask for votes, presenting their last entry.
    Campaign { last_index: Index, last_term: Term },

    CampaignResponse { vote: bool },

    /// Leaders replicate entries following the base entry, which the
    /// follower must already have.
    Append { base_index: Index, base_term: Term, entries: Vec<Entry> },

    /// Either `match_index` is the last entry now known to match the leader,
    /// or `reject_index` is a rejected base index. The other one is 0.
    AppendResponse { match_index: Index, reject_index: Index },

    ClientRequest { id: RequestId, request: Request },

    ClientResponse { id: RequestId, response: Result<Response> },
}

/// Client-chosen request identifier.
pub type RequestId = Vec<u8>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// A state machine command, replicated through the log.
    Mutate(Vec<u8>),
    /// A read-only command, executed by the leader.
    Query(Vec<u8>),
    Status,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Mutate(Vec<u8>),
    Query(Vec<u8>),
    Status(Status),
}

/// Cluster status, as seen by the leader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub server: NodeId,
    pub leader: NodeId,
    pub term: Term,
    pub last_index: Index,
    pub commit_index: Index,
    pub applied_index: Index,
    /// Last matching index per node, including the leader itself.
    pub match_index: BTreeMap<NodeId, Index>,
    pub storage: storage::Status,
}
