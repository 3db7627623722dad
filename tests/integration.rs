//! Integration tests for raftdb.

use pretty_assertions::assert_eq;
use raftdb::raft::{Address, Entry, Envelope, Index, Log, Message, Node, NodeId, Options, Request, Response, State};
use raftdb::sql::ast::{Expression, Literal, Operator, Statement};
use raftdb::storage::{BitCask, Engine, Memory};
use raftdb::{Config, Error};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_test::{assert_err, assert_ok};

/// A key/value state machine. Commands are `key=value`; queries read a key.
#[derive(Default)]
struct KvState {
    applied_index: Index,
    data: BTreeMap<String, String>,
}

impl State for KvState {
    fn applied_index(&self) -> Index {
        self.applied_index
    }

    fn apply(&mut self, entry: Entry) -> raftdb::Result<Vec<u8>> {
        self.applied_index = entry.index;
        let Some(command) = entry.command else {
            return Ok(Vec::new());
        };
        let command = String::from_utf8(command)?;
        let (key, value) = command
            .split_once('=')
            .ok_or_else(|| Error::Value(format!("invalid command {command}")))?;
        self.data.insert(key.to_string(), value.to_string());
        Ok(value.as_bytes().to_vec())
    }

    fn query(&self, command: Vec<u8>) -> raftdb::Result<Vec<u8>> {
        let key = String::from_utf8(command)?;
        Ok(self.data.get(&key).cloned().unwrap_or_default().into_bytes())
    }
}

fn mutate(id: &str, command: &str) -> Envelope {
    client_request(1, id, Request::Mutate(command.as_bytes().to_vec()))
}

fn client_request(to: NodeId, id: &str, request: Request) -> Envelope {
    Envelope {
        term: 0,
        from: Address::Client,
        to: Address::Node(to),
        message: Message::ClientRequest { id: id.as_bytes().to_vec(), request },
    }
}

#[test]
fn config_default_is_valid() {
    let c = Config::default_config();
    assert_ok!(c.validate());
    assert_eq!(c.listen_addr, "127.0.0.1:9605");
    assert!(c.fsync);
}

#[test]
fn config_from_file() {
    let f = NamedTempFile::new().unwrap();
    std::fs::write(f.path(), "id = 3\npeers = [1, 2]\nheartbeat_interval = 2\n").unwrap();
    let c = Config::from_path(f.path()).unwrap();
    assert_eq!(c.peer_set(), HashSet::from([1, 2]));
    assert_eq!(
        c.raft_options(),
        Options { heartbeat_interval: 2, election_timeout_range: 10..20 }
    );

    std::fs::write(f.path(), "storage = 7").unwrap();
    assert!(Config::from_path(f.path()).is_err());
}

#[test]
fn parse_statements() {
    let statement = raftdb::sql::parse("SELECT a + 2 * b AS c FROM t WHERE NOT x;").unwrap();
    let Statement::Select { select, r#where, .. } = statement else {
        panic!("expected select");
    };
    assert_eq!(
        select,
        vec![(
            Operator::Add(
                Box::new(Expression::Field(None, "a".into())),
                Box::new(
                    Operator::Multiply(
                        Box::new(Literal::Integer(2).into()),
                        Box::new(Expression::Field(None, "b".into())),
                    )
                    .into()
                ),
            )
            .into(),
            Some("c".to_string())
        )]
    );
    assert_eq!(
        r#where,
        Some(Operator::Not(Box::new(Expression::Field(None, "x".into()))).into())
    );

    assert!(matches!(raftdb::sql::parse("SELECT 1 2"), Err(Error::Parse(_))));
    assert!(matches!(raftdb::sql::parse("SELECT 'open"), Err(Error::Parse(_))));
}

#[test]
fn parsed_statements_serialize_to_json() {
    let statement = raftdb::sql::parse("DROP TABLE IF EXISTS movies").unwrap();
    let json = serde_json::to_value(&statement).unwrap();
    assert_eq!(
        json,
        serde_json::json!({ "DropTable": { "name": "movies", "if_exists": true } })
    );
}

#[test]
fn bitcask_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    {
        let mut engine = BitCask::new(path.clone()).unwrap();
        for i in 0..100u32 {
            engine.set(&i.to_be_bytes(), vec![(i % 7) as u8; 10]).unwrap();
        }
        for i in (0..100u32).step_by(2) {
            engine.delete(&i.to_be_bytes()).unwrap();
        }
        engine.flush().unwrap();
    }

    let mut engine = BitCask::new_compact(path, 0.1).unwrap();
    let status = engine.status().unwrap();
    assert_eq!(status.keys, 50);
    assert_eq!(status.garbage_disk_size, 0);
    let keys: Vec<u32> = engine
        .scan_prefix(&[])
        .map(|r| u32::from_be_bytes(r.unwrap().0.try_into().unwrap()))
        .collect();
    assert_eq!(keys, (1..100).step_by(2).collect::<Vec<u32>>());
}

/// A cluster with BitCask-backed logs, delivering messages synchronously.
struct Cluster {
    dir: TempDir,
    nodes: BTreeMap<NodeId, Node>,
    rxs: BTreeMap<NodeId, UnboundedReceiver<Envelope>>,
    responses: Vec<(NodeId, Message)>,
}

impl Cluster {
    fn new(size: NodeId) -> Self {
        let mut cluster = Cluster {
            dir: TempDir::new().unwrap(),
            nodes: BTreeMap::new(),
            rxs: BTreeMap::new(),
            responses: Vec::new(),
        };
        for id in 1..=size {
            cluster.start(id, size);
        }
        cluster
    }

    fn start(&mut self, id: NodeId, size: NodeId) {
        let peers = (1..=size).filter(|p| *p != id).collect();
        let opts = Options {
            heartbeat_interval: 1,
            election_timeout_range: if id == 1 { 3..4 } else { 100..101 },
        };
        let log = open_log(&self.dir.path().join(format!("node{id}")));
        let (tx, rx) = mpsc::unbounded_channel();
        let node = Node::new(id, peers, log, Box::new(KvState::default()), tx, opts).unwrap();
        self.nodes.insert(id, node);
        self.rxs.insert(id, rx);
    }

    fn step(&mut self, id: NodeId, msg: Envelope) {
        let node = self.nodes.remove(&id).unwrap();
        self.nodes.insert(id, node.step(msg).unwrap());
    }

    fn tick(&mut self, id: NodeId) {
        let node = self.nodes.remove(&id).unwrap();
        self.nodes.insert(id, node.tick().unwrap());
    }

    fn deliver(&mut self) {
        loop {
            let mut msgs = Vec::new();
            for (id, rx) in self.rxs.iter_mut() {
                while let Ok(msg) = rx.try_recv() {
                    msgs.push((*id, msg));
                }
            }
            if msgs.is_empty() {
                return;
            }
            for (from, msg) in msgs {
                match msg.to {
                    Address::Client => self.responses.push((from, msg.message)),
                    Address::Node(to) => self.step(to, msg),
                    Address::Broadcast => {
                        let peers: Vec<NodeId> =
                            self.nodes.keys().copied().filter(|id| *id != from).collect();
                        for to in peers {
                            self.step(to, msg.clone());
                        }
                    }
                }
            }
        }
    }

    fn run(&mut self, leader: NodeId, ticks: usize) {
        for _ in 0..ticks {
            self.tick(leader);
            self.deliver();
        }
    }
}

fn open_log(path: &Path) -> Log {
    let engine = BitCask::new(path.to_path_buf()).unwrap();
    Log::new(Box::new(engine), true).unwrap()
}

#[test]
fn cluster_replicates_and_restarts() {
    let mut c = Cluster::new(3);
    c.run(1, 3);
    assert!(matches!(c.nodes[&1], Node::Leader(_)));

    c.step(1, mutate("w1", "a=1"));
    c.step(2, client_request(2, "w2", Request::Mutate(b"b=2".to_vec())));
    c.step(1, mutate("bad", "nonsense"));
    c.run(1, 2);

    let responses = c.responses.drain(..).collect::<Vec<_>>();
    assert_eq!(responses.len(), 3);
    assert!(responses.contains(&(
        1,
        Message::ClientResponse { id: b"w1".to_vec(), response: Ok(Response::Mutate(b"1".to_vec())) }
    )));
    assert!(responses.contains(&(
        2,
        Message::ClientResponse { id: b"w2".to_vec(), response: Ok(Response::Mutate(b"2".to_vec())) }
    )));
    assert!(responses.iter().any(|(_, m)| matches!(
        m,
        Message::ClientResponse { id, response: Err(Error::Value(_)) } if id == b"bad"
    )));

    // Restart node 2 from its log; it rejoins the same term and catches up
    // its state machine from committed entries.
    let term = c.nodes[&1].term();
    c.nodes.remove(&2);
    c.rxs.remove(&2);
    c.start(2, 3);
    assert_eq!(c.nodes[&2].term(), term);
    c.run(1, 2);

    c.step(2, client_request(2, "q", Request::Query(b"a".to_vec())));
    c.run(1, 1);
    assert_eq!(
        c.responses,
        vec![(2, Message::ClientResponse { id: b"q".to_vec(), response: Ok(Response::Query(b"1".to_vec())) })]
    );
}

#[test]
fn log_persists_term_vote_and_entries() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("raft");
    {
        let mut log = open_log(&path);
        log.set_term_vote(4, Some(2)).unwrap();
        log.append(Some(b"x".to_vec())).unwrap();
        log.append(None).unwrap();
        log.commit(1).unwrap();
    }
    let mut log = open_log(&path);
    assert_eq!(log.get_term_vote(), (4, Some(2)));
    assert_eq!(log.get_last_index(), (2, 4));
    assert_eq!(log.get_commit_index(), (1, 4));
    assert_eq!(
        log.get(1).unwrap(),
        Some(Entry { index: 1, term: 4, command: Some(b"x".to_vec()) })
    );
    assert_err!(log.set_term_vote(3, None));
}

#[tokio::test]
async fn single_node_serves_clients_in_background() {
    let (node_tx, mut node_rx) = mpsc::unbounded_channel();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<Envelope>();
    let log = Log::new(Box::new(Memory::new()), false).unwrap();
    let node = Node::new(1, HashSet::new(), log, Box::new(KvState::default()), node_tx, Options::default())
        .unwrap();

    let handle = tokio::spawn(async move {
        let mut node = node;
        let mut ticker = tokio::time::interval(Duration::from_millis(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => node = node.tick()?,
                msg = client_rx.recv() => match msg {
                    Some(msg) => node = node.step(msg)?,
                    None => return Ok::<_, Error>(node.term()),
                },
            }
        }
    });

    client_tx.send(mutate("w", "k=v")).unwrap();
    client_tx.send(client_request(1, "r", Request::Query(b"k".to_vec()))).unwrap();
    client_tx.send(client_request(1, "s", Request::Status)).unwrap();

    let mut responses = Vec::new();
    while responses.len() < 3 {
        let msg = node_rx.recv().await.unwrap();
        assert_eq!(msg.to, Address::Client);
        responses.push(msg.message);
    }
    assert_eq!(
        responses[0],
        Message::ClientResponse { id: b"w".to_vec(), response: Ok(Response::Mutate(b"v".to_vec())) }
    );
    assert_eq!(
        responses[1],
        Message::ClientResponse { id: b"r".to_vec(), response: Ok(Response::Query(b"v".to_vec())) }
    );
    match &responses[2] {
        Message::ClientResponse { response: Ok(Response::Status(status)), .. } => {
            assert_eq!(status.leader, 1);
            assert_eq!(status.commit_index, 2);
            assert_eq!(status.applied_index, 2);
            assert_eq!(status.storage.name, "memory");
        }
        other => panic!("unexpected response {other:?}"),
    }

    drop(client_tx);
    let term = assert_ok!(handle.await.unwrap());
    assert_eq!(term, 1);
}
