//! Shared scaffolding for spinning up small synod clusters in-process.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use synod::{Config, Log, Membership, ReplicaId};

/// A node the test owns: its `Log` plus enough bookkeeping to drop and
/// reopen it against the same storage directory and address.
pub struct Node {
    pub id: ReplicaId,
    pub addr: String,
    pub path: PathBuf,
    peers: BTreeMap<ReplicaId, String>,
    pub log: Log,
}

/// The default timeout most test calls use; generous because everything
/// here runs over loopback TCP on one machine.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Reserves a loopback port by binding and immediately releasing it.
/// Good enough for a single-process test run where nothing else is
/// racing to grab the same port.
fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local_addr");
    drop(listener);
    addr.to_string()
}

/// Starts `count` replicas wired into one static membership, each with
/// its own storage directory and TCP listener. Returns them in
/// replica-id order, lowest id first. The directories outlive the
/// returned `Node`s (never cleaned up) so a test can drop and reopen a
/// `Log` against the same path to simulate a restart.
pub fn cluster(count: u64) -> Vec<Node> {
    let ids: Vec<ReplicaId> = (1..=count).map(ReplicaId::new).collect();
    let addrs: Vec<String> = (0..count).map(|_| free_addr()).collect();

    let mut nodes = Vec::with_capacity(count as usize);
    for (index, &id) in ids.iter().enumerate() {
        let path = tempfile::tempdir().expect("tempdir").into_path();
        let mut peers = BTreeMap::new();
        for (peer_index, &peer_id) in ids.iter().enumerate() {
            if peer_id != id {
                peers.insert(peer_id, addrs[peer_index].clone());
            }
        }
        let log = open(id, &addrs[index], &path, &peers);
        nodes.push(Node {
            id,
            addr: addrs[index].clone(),
            path,
            peers,
            log,
        });
    }
    // Give every listener's accept loop and catch-up thread a moment to
    // come up before the test starts dialing peers.
    std::thread::sleep(Duration::from_millis(100));
    nodes
}

/// A single-member cluster; no peers ever get dialed.
pub fn solo() -> Node {
    let mut nodes = cluster(1);
    nodes.remove(0)
}

fn open(id: ReplicaId, addr: &str, path: &PathBuf, peers: &BTreeMap<ReplicaId, String>) -> Log {
    let config = Config {
        quorum: peers.len() as u32 + 1,
        path: path.clone(),
        self_id: id,
        listen: addr.to_string(),
        membership: Membership::Static(peers.clone()),
    };
    Log::open(config).expect("log opens")
}

impl Node {
    /// Drops this node's `Log` (joining its actor and catch-up threads)
    /// and reopens a fresh one against the same directory and address,
    /// simulating a process restart with an intact durable log.
    pub fn restart(&mut self) {
        let reopened = open(self.id, &self.addr, &self.path, &self.peers);
        self.log = reopened;
        std::thread::sleep(Duration::from_millis(100));
    }

    /// Drops this node's `Log` without reopening it, simulating a crash
    /// or network partition of one member. Returns the identity needed
    /// to bring it back with [revive].
    pub fn kill(self) -> Cold {
        let cold = Cold {
            id: self.id,
            addr: self.addr,
            path: self.path,
            peers: self.peers,
        };
        drop(self.log);
        cold
    }
}

/// The identity of a [Node] whose `Log` has already been dropped.
pub struct Cold {
    id: ReplicaId,
    addr: String,
    path: PathBuf,
    peers: BTreeMap<ReplicaId, String>,
}

/// Reopens a killed node's `Log` against its original directory and
/// address, simulating the member rejoining the cluster.
pub fn revive(cold: Cold) -> Node {
    let log = open(cold.id, &cold.addr, &cold.path, &cold.peers);
    std::thread::sleep(Duration::from_millis(100));
    Node {
        id: cold.id,
        addr: cold.addr,
        path: cold.path,
        peers: cold.peers,
        log,
    }
}
