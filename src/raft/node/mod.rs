//! The Raft node state machine.
//!
//! A node is a `RawNode<R>` in one of three roles. Role transitions consume
//! the node and return it in the new role, so role-specific state can only
//! be touched while in that role. All I/O goes through the outbound message
//! channel; the caller delivers inbound messages via `step` and drives time
//! via `tick`.

mod candidate;
mod follower;
mod leader;

pub use candidate::Candidate;
pub use follower::Follower;
pub use leader::Leader;

use rand::Rng;
use std::collections::{HashSet, VecDeque};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::{Address, Envelope, Index, Log, Message, NodeId, Options, State, Term, Ticks};
use crate::error::{Error, Result};

/// Maximum number of client requests queued while there is no leader.
/// Further requests are aborted.
const MAX_QUEUED_REQUESTS: usize = 256;

/// A Raft node in its current role.
pub enum Node {
    Candidate(RawNode<Candidate>),
    Follower(RawNode<Follower>),
    Leader(RawNode<Leader>),
}

impl Node {
    /// Starts a node as a leaderless follower in its persisted term. A
    /// single-node cluster elects itself right away.
    pub fn new(
        id: NodeId,
        peers: HashSet<NodeId>,
        log: Log,
        state: Box<dyn State>,
        node_tx: UnboundedSender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let node = RawNode::new(id, peers, log, state, node_tx, opts)?;
        if node.peers.is_empty() {
            return Ok(node.into_candidate()?.into_leader()?.into());
        }
        Ok(node.into())
    }

    pub fn id(&self) -> NodeId {
        match self {
            Node::Candidate(n) => n.id,
            Node::Follower(n) => n.id,
            Node::Leader(n) => n.id,
        }
    }

    pub fn term(&self) -> Term {
        match self {
            Node::Candidate(n) => n.term,
            Node::Follower(n) => n.term,
            Node::Leader(n) => n.term,
        }
    }

    /// The leader known to this node in its current term, if any.
    pub fn leader(&self) -> Option<NodeId> {
        match self {
            Node::Candidate(_) => None,
            Node::Follower(n) => n.role.leader,
            Node::Leader(n) => Some(n.id),
        }
    }

    /// Processes an inbound message.
    pub fn step(self, msg: Envelope) -> Result<Self> {
        self.step_message(msg)?.drain_queued()
    }

    /// Advances logical time by one tick.
    pub fn tick(self) -> Result<Self> {
        let node = match self {
            Node::Candidate(n) => n.tick()?,
            Node::Follower(n) => n.tick()?,
            Node::Leader(n) => n.tick()?,
        };
        node.drain_queued()
    }

    fn step_message(self, msg: Envelope) -> Result<Self> {
        if !self.accepts(&msg) {
            return Ok(self);
        }
        // A newer term makes any node a leaderless follower in that term.
        let node = match self {
            node if msg.term <= node.term() || !matches!(msg.from, Address::Node(_)) => node,
            Node::Candidate(n) => n.into_follower(msg.term, None)?.into(),
            Node::Follower(n) => n.into_follower(msg.term, None)?.into(),
            Node::Leader(n) => n.into_follower(msg.term)?.into(),
        };
        match node {
            Node::Candidate(n) => n.step(msg),
            Node::Follower(n) => n.step(msg),
            Node::Leader(n) => n.step(msg),
        }
    }

    fn accepts(&self, msg: &Envelope) -> bool {
        match msg.to {
            Address::Broadcast => {}
            Address::Node(id) if id == self.id() => {}
            to => {
                debug!(?to, "dropping message for another recipient");
                return false;
            }
        }
        match msg.from {
            Address::Node(from) if from == self.id() => {
                debug!("dropping message from self");
                false
            }
            Address::Node(from) if msg.term < self.term() => {
                debug!(from, term = msg.term, "dropping message from past term");
                false
            }
            Address::Client if !matches!(msg.message, Message::ClientRequest { .. }) => {
                debug!("dropping non-request message from client");
                false
            }
            Address::Broadcast => false,
            _ => true,
        }
    }

    /// Re-steps client requests queued while the node had no leader, once it
    /// has one.
    fn drain_queued(mut self) -> Result<Self> {
        let queued = match &mut self {
            Node::Leader(n) => std::mem::take(&mut n.queued),
            Node::Follower(n) if n.role.leader.is_some() => std::mem::take(&mut n.queued),
            _ => return Ok(self),
        };
        let mut node = self;
        for msg in queued {
            node = node.step_message(msg)?;
        }
        Ok(node)
    }
}

impl From<RawNode<Candidate>> for Node {
    fn from(n: RawNode<Candidate>) -> Self {
        Node::Candidate(n)
    }
}

impl From<RawNode<Follower>> for Node {
    fn from(n: RawNode<Follower>) -> Self {
        Node::Follower(n)
    }
}

impl From<RawNode<Leader>> for Node {
    fn from(n: RawNode<Leader>) -> Self {
        Node::Leader(n)
    }
}

/// Role-specific node state.
pub trait Role {}

/// A node in role `R`, with the state shared by all roles.
pub struct RawNode<R: Role = Follower> {
    id: NodeId,
    peers: HashSet<NodeId>,
    term: Term,
    log: Log,
    state: Box<dyn State>,
    node_tx: UnboundedSender<Envelope>,
    opts: Options,
    /// Client requests waiting for a leader.
    queued: VecDeque<Envelope>,
    role: R,
}

impl<R: Role> RawNode<R> {
    fn into_role<T: Role>(self, role: T) -> RawNode<T> {
        RawNode {
            id: self.id,
            peers: self.peers,
            term: self.term,
            log: self.log,
            state: self.state,
            node_tx: self.node_tx,
            opts: self.opts,
            queued: self.queued,
            role,
        }
    }

    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    fn quorum_size(&self) -> usize {
        quorum_size(self.cluster_size())
    }

    fn random_election_timeout(&self) -> Ticks {
        let range = self.opts.election_timeout_range.clone();
        if range.is_empty() {
            return range.start;
        }
        rand::thread_rng().gen_range(range)
    }

    fn send(&self, to: Address, message: Message) -> Result<()> {
        let msg = Envelope { term: self.term, from: Address::Node(self.id), to, message };
        debug!(?msg, "sending message");
        self.node_tx.send(msg).map_err(|err| Error::Internal(err.to_string()))
    }

    fn broadcast(&self, message: Message) -> Result<()> {
        if self.peers.is_empty() {
            return Ok(());
        }
        self.send(Address::Broadcast, message)
    }

    /// Applies committed entries that haven't been applied yet, returning
    /// the result for each index.
    fn maybe_apply(&mut self) -> Result<Vec<(Index, Result<Vec<u8>>)>> {
        let applied_index = self.state.applied_index();
        let (commit_index, _) = self.log.get_commit_index();
        if applied_index >= commit_index {
            return Ok(Vec::new());
        }
        let entries = self
            .log
            .scan(applied_index + 1..=commit_index)?
            .collect::<Result<Vec<_>>>()?;
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let index = entry.index;
            debug!(index, "applying entry");
            match self.state.apply(entry) {
                Err(err @ Error::Internal(_)) => return Err(err),
                result => results.push((index, result)),
            }
        }
        Ok(results)
    }

    /// Queues a client request until a leader is known. Aborts it instead
    /// when the queue is full.
    fn queue_request(&mut self, msg: Envelope) -> Result<()> {
        if self.queued.len() < MAX_QUEUED_REQUESTS {
            debug!("no leader, queueing client request");
            self.queued.push_back(msg);
            return Ok(());
        }
        match msg.message {
            Message::ClientRequest { id, .. } => {
                warn!(?id, queued = self.queued.len(), "request queue full, aborting request");
                self.abort_request(msg.from, id)
            }
            message => Err(Error::Internal(format!("can't queue {message:?}"))),
        }
    }

    /// Answers a client request that can't be served by this node.
    fn abort_request(&self, to: Address, id: Vec<u8>) -> Result<()> {
        self.send(to, Message::ClientResponse { id, response: Err(Error::Abort) })
    }
}

impl RawNode<Follower> {
    fn new(
        id: NodeId,
        peers: HashSet<NodeId>,
        log: Log,
        state: Box<dyn State>,
        node_tx: UnboundedSender<Envelope>,
        opts: Options,
    ) -> Result<Self> {
        let (term, vote) = log.get_term_vote();
        let mut node = RawNode {
            id,
            peers,
            term,
            log,
            state,
            node_tx,
            opts,
            queued: VecDeque::new(),
            role: Follower::new(None, vote, 0),
        };
        node.role = Follower::new(None, vote, node.random_election_timeout());
        node.maybe_apply()?;
        Ok(node)
    }
}

fn quorum_size(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// The highest value held by a quorum, e.g. the quorum match index.
fn quorum_value<T: Ord + Copy>(mut values: Vec<T>) -> T {
    let quorum = quorum_size(values.len());
    values.sort_unstable_by(|a, b| b.cmp(a));
    values[quorum - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{Entry, Request, Response, Status};
    use crate::storage::Memory;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    /// Records applied commands. Queries return the number of commands.
    struct TestState {
        applied_index: Index,
        commands: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl State for TestState {
        fn applied_index(&self) -> Index {
            self.applied_index
        }

        fn apply(&mut self, entry: Entry) -> Result<Vec<u8>> {
            self.applied_index = entry.index;
            match entry.command {
                Some(command) => {
                    self.commands.lock().unwrap().push(command.clone());
                    Ok(command)
                }
                None => Ok(Vec::new()),
            }
        }

        fn query(&self, _command: Vec<u8>) -> Result<Vec<u8>> {
            Ok(vec![self.commands.lock().unwrap().len() as u8])
        }
    }

    /// An in-process cluster with manual message delivery.
    struct Cluster {
        nodes: BTreeMap<NodeId, Node>,
        rxs: BTreeMap<NodeId, UnboundedReceiver<Envelope>>,
        applied: BTreeMap<NodeId, Arc<Mutex<Vec<Vec<u8>>>>>,
        /// Messages delivered to clients, by node.
        client: BTreeMap<NodeId, Vec<Message>>,
    }

    impl Cluster {
        /// Node 1 times out after 2 ticks, the others effectively never.
        fn new(size: NodeId) -> Self {
            let mut cluster = Cluster {
                nodes: BTreeMap::new(),
                rxs: BTreeMap::new(),
                applied: BTreeMap::new(),
                client: BTreeMap::new(),
            };
            for id in 1..=size {
                let peers = (1..=size).filter(|p| *p != id).collect();
                let opts = Options {
                    heartbeat_interval: 1,
                    election_timeout_range: if id == 1 { 2..3 } else { 50..51 },
                };
                let commands = Arc::new(Mutex::new(Vec::new()));
                let state = TestState { applied_index: 0, commands: commands.clone() };
                let log = Log::new(Box::new(Memory::new()), false).unwrap();
                let (tx, rx) = mpsc::unbounded_channel();
                let node = Node::new(id, peers, log, Box::new(state), tx, opts).unwrap();
                cluster.nodes.insert(id, node);
                cluster.rxs.insert(id, rx);
                cluster.applied.insert(id, commands);
                cluster.client.insert(id, Vec::new());
            }
            cluster
        }

        fn step(&mut self, id: NodeId, msg: Envelope) {
            let node = self.nodes.remove(&id).unwrap();
            self.nodes.insert(id, node.step(msg).unwrap());
        }

        fn tick(&mut self, id: NodeId) {
            let node = self.nodes.remove(&id).unwrap();
            self.nodes.insert(id, node.tick().unwrap());
        }

        /// Takes all outbound messages from a node.
        fn outbox(&mut self, id: NodeId) -> Vec<Envelope> {
            let rx = self.rxs.get_mut(&id).unwrap();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        }

        /// Delivers messages until the cluster is quiet, dropping any for
        /// nodes in `partitioned`.
        fn deliver_except(&mut self, partitioned: &[NodeId]) {
            loop {
                let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
                let mut delivered = false;
                for from in ids {
                    for msg in self.outbox(from) {
                        delivered = true;
                        let to: Vec<NodeId> = match msg.to {
                            Address::Broadcast => {
                                self.nodes.keys().copied().filter(|id| *id != from).collect()
                            }
                            Address::Node(id) => vec![id],
                            Address::Client => {
                                self.client.get_mut(&from).unwrap().push(msg.message);
                                continue;
                            }
                        };
                        for id in to {
                            if partitioned.contains(&id) || partitioned.contains(&from) {
                                continue;
                            }
                            self.step(id, msg.clone());
                        }
                    }
                }
                if !delivered {
                    return;
                }
            }
        }

        fn deliver(&mut self) {
            self.deliver_except(&[])
        }

        fn elect_node_1(&mut self) {
            self.tick(1);
            self.tick(1);
            self.deliver();
        }

        fn request(&mut self, id: NodeId, request_id: &[u8], request: Request) {
            let msg = Envelope {
                term: 0,
                from: Address::Client,
                to: Address::Node(id),
                message: Message::ClientRequest { id: request_id.to_vec(), request },
            };
            self.step(id, msg);
        }

        fn client_responses(&mut self, id: NodeId) -> Vec<(Vec<u8>, Result<Response>)> {
            self.client
                .get_mut(&id)
                .unwrap()
                .drain(..)
                .filter_map(|m| match m {
                    Message::ClientResponse { id, response } => Some((id, response)),
                    _ => None,
                })
                .collect()
        }

        fn commands(&self, id: NodeId) -> Vec<Vec<u8>> {
            self.applied[&id].lock().unwrap().clone()
        }
    }

    #[test]
    fn quorum() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
        assert_eq!(quorum_value(vec![1, 5, 3]), 3);
        assert_eq!(quorum_value(vec![2, 2, 9, 9, 1]), 2);
        assert_eq!(quorum_value(vec![7]), 7);
    }

    #[test]
    fn single_node_leads_and_commits() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let state = TestState { applied_index: 0, commands: commands.clone() };
        let log = Log::new(Box::new(Memory::new()), true).unwrap();
        let node = Node::new(1, HashSet::new(), log, Box::new(state), tx, Options::default()).unwrap();
        assert!(matches!(node, Node::Leader(_)));
        assert_eq!(node.term(), 1);
        assert_eq!(node.leader(), Some(1));

        let node = node
            .step(Envelope {
                term: 0,
                from: Address::Client,
                to: Address::Node(1),
                message: Message::ClientRequest {
                    id: b"w".to_vec(),
                    request: Request::Mutate(b"cmd".to_vec()),
                },
            })
            .unwrap();
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.to, Address::Client);
        assert_eq!(
            msg.message,
            Message::ClientResponse { id: b"w".to_vec(), response: Ok(Response::Mutate(b"cmd".to_vec())) }
        );
        assert_eq!(*commands.lock().unwrap(), vec![b"cmd".to_vec()]);

        // Ticks only produce heartbeats, which have no recipients.
        let node = node.tick().unwrap().tick().unwrap().tick().unwrap();
        assert!(rx.try_recv().is_err());
        assert!(matches!(node, Node::Leader(_)));
    }

    #[test]
    fn election() {
        let mut c = Cluster::new(3);
        c.tick(1);
        assert!(matches!(c.nodes[&1], Node::Follower(_)));
        c.tick(1);
        assert!(matches!(c.nodes[&1], Node::Candidate(_)));
        assert_eq!(c.nodes[&1].term(), 1);

        c.deliver();
        assert!(matches!(c.nodes[&1], Node::Leader(_)));
        for id in 1..=3 {
            assert_eq!(c.nodes[&id].term(), 1);
            assert_eq!(c.nodes[&id].leader(), Some(1));
        }
    }

    #[test]
    fn replication_and_commit() {
        let mut c = Cluster::new(3);
        c.elect_node_1();

        c.request(1, b"a", Request::Mutate(b"x".to_vec()));
        c.request(1, b"b", Request::Mutate(b"y".to_vec()));
        c.deliver();
        assert_eq!(
            c.client_responses(1),
            vec![
                (b"a".to_vec(), Ok(Response::Mutate(b"x".to_vec()))),
                (b"b".to_vec(), Ok(Response::Mutate(b"y".to_vec()))),
            ]
        );
        assert_eq!(c.commands(1), vec![b"x".to_vec(), b"y".to_vec()]);

        // Followers learn the commit index from the next heartbeat.
        c.tick(1);
        c.deliver();
        for id in 2..=3 {
            assert_eq!(c.commands(id), vec![b"x".to_vec(), b"y".to_vec()]);
        }

        c.request(1, b"s", Request::Status);
        c.request(1, b"q", Request::Query(vec![]));
        c.deliver();
        let responses = c.client_responses(1);
        match &responses[0] {
            (id, Ok(Response::Status(Status { leader, term, commit_index, match_index, .. }))) => {
                assert_eq!(id, b"s");
                assert_eq!((*leader, *term, *commit_index), (1, 1, 3));
                assert_eq!(match_index.values().copied().collect::<Vec<_>>(), vec![3, 3, 3]);
            }
            other => panic!("unexpected response {other:?}"),
        }
        assert_eq!(responses[1], (b"q".to_vec(), Ok(Response::Query(vec![2]))));
    }

    #[test]
    fn follower_forwards_requests() {
        let mut c = Cluster::new(3);
        c.elect_node_1();

        c.request(2, b"f", Request::Mutate(b"z".to_vec()));
        c.deliver();
        assert_eq!(c.client_responses(2), vec![(b"f".to_vec(), Ok(Response::Mutate(b"z".to_vec())))]);
        assert!(c.client_responses(1).is_empty());
    }

    #[test]
    fn leaderless_requests_are_queued() {
        let mut c = Cluster::new(3);
        c.request(3, b"early", Request::Mutate(b"e".to_vec()));
        assert!(c.outbox(3).is_empty());

        // Node 3 forwards the request once the new leader's first append
        // reaches it.
        c.elect_node_1();
        assert_eq!(c.client_responses(3), vec![(b"early".to_vec(), Ok(Response::Mutate(b"e".to_vec())))]);
    }

    #[test]
    fn step_down_aborts_pending_writes() {
        let mut c = Cluster::new(3);
        c.elect_node_1();

        // Replication is lost, so the write stays uncommitted.
        c.request(1, b"w", Request::Mutate(b"lost".to_vec()));
        c.outbox(1);

        c.step(
            1,
            Envelope {
                term: 5,
                from: Address::Node(3),
                to: Address::Node(1),
                message: Message::Heartbeat { commit_index: 0, commit_term: 0 },
            },
        );
        assert!(matches!(c.nodes[&1], Node::Follower(_)));
        assert_eq!(c.nodes[&1].term(), 5);
        assert_eq!(c.nodes[&1].leader(), Some(3));
        let aborted = c
            .outbox(1)
            .into_iter()
            .filter(|m| m.to == Address::Client)
            .map(|m| m.message)
            .collect::<Vec<_>>();
        assert_eq!(aborted, vec![Message::ClientResponse { id: b"w".to_vec(), response: Err(Error::Abort) }]);
    }

    #[test]
    fn forwarded_requests_abort_on_term_change() {
        let mut c = Cluster::new(3);
        c.elect_node_1();

        c.request(2, b"f", Request::Mutate(b"z".to_vec()));
        c.outbox(2);
        c.step(
            2,
            Envelope {
                term: 2,
                from: Address::Node(3),
                to: Address::Node(2),
                message: Message::Campaign { last_index: 1, last_term: 1 },
            },
        );
        let msgs = c.outbox(2);
        assert!(msgs.contains(&Envelope {
            term: 2,
            from: Address::Node(2),
            to: Address::Client,
            message: Message::ClientResponse { id: b"f".to_vec(), response: Err(Error::Abort) },
        }));
        assert!(msgs.contains(&Envelope {
            term: 2,
            from: Address::Node(2),
            to: Address::Node(3),
            message: Message::CampaignResponse { vote: true },
        }));
    }

    #[test]
    fn votes_once_per_term_for_up_to_date_logs() {
        let mut c = Cluster::new(3);
        c.elect_node_1();
        c.outbox(2);

        let campaign = |from: NodeId, term: Term, last_index: Index, last_term: Term| Envelope {
            term,
            from: Address::Node(from),
            to: Address::Node(2),
            message: Message::Campaign { last_index, last_term },
        };
        let vote = |c: &mut Cluster| {
            c.outbox(2)
                .into_iter()
                .find_map(|m| match m.message {
                    Message::CampaignResponse { vote } => Some(vote),
                    _ => None,
                })
                .unwrap()
        };

        // Node 2 holds the no-op entry at index 1, term 1.
        c.step(2, campaign(3, 2, 0, 0));
        assert!(!vote(&mut c));
        c.step(2, campaign(3, 3, 1, 1));
        assert!(vote(&mut c));
        c.step(2, campaign(1, 3, 1, 1));
        assert!(!vote(&mut c));
        // Asking again is idempotent.
        c.step(2, campaign(3, 3, 1, 1));
        assert!(vote(&mut c));
    }

    #[test]
    fn rejected_append_backs_off() {
        let mut c = Cluster::new(3);
        c.elect_node_1();
        // Node 3 misses two writes.
        c.request(1, b"a", Request::Mutate(b"a".to_vec()));
        c.request(1, b"b", Request::Mutate(b"b".to_vec()));
        c.deliver_except(&[3]);
        assert_eq!(c.client_responses(1).len(), 2);

        // An append based on an index node 3 lacks is rejected.
        c.step(
            3,
            Envelope {
                term: 1,
                from: Address::Node(1),
                to: Address::Node(3),
                message: Message::Append { base_index: 3, base_term: 1, entries: vec![] },
            },
        );
        let reply = c.outbox(3).pop().unwrap();
        assert_eq!(reply.message, Message::AppendResponse { match_index: 0, reject_index: 3 });

        // Heartbeats let the leader catch node 3 up.
        c.tick(1);
        c.deliver();
        c.tick(1);
        c.deliver();
        assert_eq!(c.commands(3), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn candidate_restarts_campaign_on_timeout() {
        let mut c = Cluster::new(3);
        c.elect_node_1();
        c.tick(1);
        c.deliver();

        // Node 1 is partitioned; node 2 eventually campaigns but loses its
        // votes, then retries with a new term.
        c.outbox(1);
        for _ in 0..50 {
            c.tick(2);
        }
        assert!(matches!(c.nodes[&2], Node::Candidate(_)));
        assert_eq!(c.nodes[&2].term(), 2);
        c.outbox(2);
        for _ in 0..50 {
            c.tick(2);
        }
        assert_eq!(c.nodes[&2].term(), 3);

        c.deliver_except(&[1]);
        assert!(matches!(c.nodes[&2], Node::Leader(_)));
        assert_eq!(c.nodes[&3].leader(), Some(2));
    }

    #[test]
    fn heartbeats_commit_when_append_responses_are_lost() {
        let mut c = Cluster::new(3);
        c.elect_node_1();

        // Followers store the entry, but their append responses are lost.
        c.request(1, b"w", Request::Mutate(b"x".to_vec()));
        for msg in c.outbox(1) {
            let Address::Node(to) = msg.to else {
                panic!("unexpected recipient {:?}", msg.to);
            };
            c.step(to, msg);
        }
        for id in 2..=3 {
            assert_eq!(c.outbox(id).len(), 1);
        }
        assert!(c.client_responses(1).is_empty());

        // Heartbeat responses show the followers' logs match.
        c.tick(1);
        c.deliver();
        assert_eq!(c.client_responses(1), vec![(b"w".to_vec(), Ok(Response::Mutate(b"x".to_vec())))]);
        c.tick(1);
        c.deliver();
        for id in 1..=3 {
            assert_eq!(c.commands(id), vec![b"x".to_vec()]);
        }
    }

    #[test]
    fn drops_misaddressed_messages() {
        let mut c = Cluster::new(3);
        c.elect_node_1();
        c.outbox(2);

        c.step(
            2,
            Envelope {
                term: 5,
                from: Address::Node(3),
                to: Address::Node(1),
                message: Message::Heartbeat { commit_index: 0, commit_term: 0 },
            },
        );
        assert!(c.outbox(2).is_empty());
        assert_eq!(c.nodes[&2].term(), 1);
        assert_eq!(c.nodes[&2].leader(), Some(1));
    }

    #[test]
    fn drops_messages_from_past_terms() {
        let mut c = Cluster::new(3);
        c.elect_node_1();
        c.outbox(2);

        // Stepping it as a heartbeat would be a term regression.
        c.step(
            2,
            Envelope {
                term: 0,
                from: Address::Node(1),
                to: Address::Node(2),
                message: Message::Heartbeat { commit_index: 0, commit_term: 0 },
            },
        );
        assert!(c.outbox(2).is_empty());
        assert_eq!(c.nodes[&2].term(), 1);
        assert_eq!(c.nodes[&2].leader(), Some(1));
    }

    #[test]
    fn second_leader_in_term_is_internal_error() {
        let mut c = Cluster::new(3);
        c.elect_node_1();

        let node = c.nodes.remove(&2).unwrap();
        let result = node.step(Envelope {
            term: 1,
            from: Address::Node(3),
            to: Address::Node(2),
            message: Message::Heartbeat { commit_index: 0, commit_term: 0 },
        });
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn candidate_follows_leader_of_its_term() {
        // Heartbeat from the winner.
        let mut c = Cluster::new(3);
        c.tick(1);
        c.tick(1);
        assert!(matches!(c.nodes[&1], Node::Candidate(_)));
        c.outbox(1);
        c.step(
            1,
            Envelope {
                term: 1,
                from: Address::Node(2),
                to: Address::Node(1),
                message: Message::Heartbeat { commit_index: 0, commit_term: 0 },
            },
        );
        assert!(matches!(c.nodes[&1], Node::Follower(_)));
        assert_eq!(c.nodes[&1].term(), 1);
        assert_eq!(c.nodes[&1].leader(), Some(2));
        assert_eq!(
            c.outbox(1).pop().map(|m| m.message),
            Some(Message::HeartbeatResponse { last_index: 0, last_term: 0 })
        );

        // Append from the winner.
        let mut c = Cluster::new(3);
        c.tick(1);
        c.tick(1);
        c.outbox(1);
        c.step(
            1,
            Envelope {
                term: 1,
                from: Address::Node(3),
                to: Address::Node(1),
                message: Message::Append {
                    base_index: 0,
                    base_term: 0,
                    entries: vec![Entry { index: 1, term: 1, command: None }],
                },
            },
        );
        assert!(matches!(c.nodes[&1], Node::Follower(_)));
        assert_eq!(c.nodes[&1].leader(), Some(3));
        assert_eq!(
            c.outbox(1).pop().map(|m| m.message),
            Some(Message::AppendResponse { match_index: 1, reject_index: 0 })
        );
    }

    #[test]
    fn full_request_queue_aborts_requests() {
        let mut c = Cluster::new(3);
        for i in 0..MAX_QUEUED_REQUESTS {
            c.request(3, &i.to_be_bytes(), Request::Status);
        }
        assert!(c.outbox(3).is_empty());

        c.request(3, b"over", Request::Status);
        let msgs = c.outbox(3);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].to, Address::Client);
        assert_eq!(msgs[0].message, Message::ClientResponse { id: b"over".to_vec(), response: Err(Error::Abort) });
    }
}
