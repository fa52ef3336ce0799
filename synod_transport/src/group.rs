//! Peer membership and bounded-fan-out broadcast.

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use biometrics::Counter;

use rpc_pb::Client;

use synod_pb::ReplicaId;

use crate::wire::TcpClient;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static BROADCAST: Counter = Counter::new("synod.transport.group.broadcast");
static BROADCAST_QUORUM_MET: Counter = Counter::new("synod.transport.group.broadcast.quorum_met");
static BROADCAST_TIMED_OUT: Counter = Counter::new("synod.transport.group.broadcast.timed_out");

pub(crate) fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&BROADCAST);
    collector.register_counter(&BROADCAST_QUORUM_MET);
    collector.register_counter(&BROADCAST_TIMED_OUT);
}

/// A fixed mapping from [ReplicaId] to a connected client.  `Group`
/// owns no membership-change logic; a new `Group` is built whenever the
/// coordination layer reports a new view.
#[derive(Clone)]
pub struct Group {
    members: BTreeMap<ReplicaId, Arc<TcpClient>>,
}

impl Group {
    pub fn new(members: BTreeMap<ReplicaId, Arc<TcpClient>>) -> Self {
        Self { members }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// A majority of `size()`, the minimum count needed to accept a
    /// ballot or commit a write.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn members(&self) -> impl Iterator<Item = (&ReplicaId, &Arc<TcpClient>)> {
        self.members.iter()
    }

    pub fn get(&self, id: ReplicaId) -> Option<Arc<TcpClient>> {
        self.members.get(&id).cloned()
    }

    /// Calls `f` against every member concurrently (one thread per
    /// peer, bounded by the group size) and returns every reply that
    /// arrived before `timeout`, tagged with its replica.
    ///
    /// Does not itself decide whether a quorum was reached; callers
    /// compare the returned length against [Group::quorum_size].
    pub fn broadcast<F, T>(&self, timeout: Duration, f: F) -> Vec<(ReplicaId, T)>
    where
        F: Fn(&TcpClient) -> Option<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        BROADCAST.click();
        let f = Arc::new(f);
        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::with_capacity(self.members.len());
        for (&id, client) in self.members.iter() {
            let client = Arc::clone(client);
            let f = Arc::clone(&f);
            let tx = tx.clone();
            handles.push(std::thread::spawn(move || {
                if let Some(reply) = f(&client) {
                    let _ = tx.send((id, reply));
                }
            }));
        }
        drop(tx);

        let deadline = std::time::Instant::now() + timeout;
        let mut replies = Vec::with_capacity(self.members.len());
        while let Ok(remaining) = deadline
            .checked_duration_since(std::time::Instant::now())
            .ok_or(())
        {
            match rx.recv_timeout(remaining) {
                Ok(reply) => replies.push(reply),
                Err(mpsc::RecvTimeoutError::Timeout) => break,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if replies.len() >= self.quorum_size() {
                break;
            }
        }
        if replies.len() >= self.quorum_size() {
            BROADCAST_QUORUM_MET.click();
        } else {
            BROADCAST_TIMED_OUT.click();
        }
        // Detached: slow peers finish writing to a channel nobody reads
        // anymore, which is fine since the channel and clients are Arc'd.
        for handle in handles {
            drop(handle);
        }
        replies
    }

    /// Ensures every RPC call in this module goes through the generic
    /// `rpc_pb::Client` trait, not a concrete `TcpClient` method, so a
    /// test double can be substituted.
    pub fn as_dyn_client(client: &Arc<TcpClient>) -> Arc<dyn Client + Send + Sync> {
        client.clone()
    }
}
