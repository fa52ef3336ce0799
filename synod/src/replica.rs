//! The `Replica` actor: a dedicated thread owning one [FileLog] and
//! answering the Paxos-per-slot protocol.
//!
//! Every RPC the wire layer receives is translated into a
//! [ReplicaMessage] and sent down the mailbox; the actor thread is the
//! only thread that ever touches the backing [FileLog], which is what
//! lets `FileLog` skip its own internal locking.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};

use biometrics::Counter;

use indicio::{clue, INFO};

use sync42::background::BackgroundThread;

use synod_pb::{
    Accepted, Ballot, Entry, EntryKind, LearnedReply, LearnedRequest, PromiseReply,
    PromiseRequest, RecoverReply, RecoverRequest, ReplicaId, ReplicaService, SlotRecord,
    WriteReply, WriteRequest,
};

use synod_storage::FileLog;

use crate::LOGGING;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static PROMISE: Counter = Counter::new("synod.replica.promise");
static PROMISE_NACKED: Counter = Counter::new("synod.replica.promise.nacked");
static WRITE: Counter = Counter::new("synod.replica.write");
static WRITE_NACKED: Counter = Counter::new("synod.replica.write.nacked");
static LEARNED: Counter = Counter::new("synod.replica.learned");
static RECOVER: Counter = Counter::new("synod.replica.recover");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&PROMISE);
    collector.register_counter(&PROMISE_NACKED);
    collector.register_counter(&WRITE);
    collector.register_counter(&WRITE_NACKED);
    collector.register_counter(&LEARNED);
    collector.register_counter(&RECOVER);
}

///////////////////////////////////////// CatchupSignal //////////////////////////////////////////

/// Shared between the `Replica` actor and its catch-up thread.  The
/// actor bumps `hint` and notifies whenever it observes a position
/// beyond its own `end` in an incoming request; the catch-up thread
/// wakes, recovers up to `hint`, and goes back to sleep.
#[derive(Clone)]
pub struct CatchupSignal {
    hint: Arc<(Mutex<u64>, Condvar)>,
}

impl CatchupSignal {
    fn new() -> Self {
        Self {
            hint: Arc::new((Mutex::new(0), Condvar::new())),
        }
    }

    fn observe(&self, position: u64) {
        let (lock, cvar) = &*self.hint;
        let mut hint = lock.lock().unwrap();
        if position > *hint {
            *hint = position;
            cvar.notify_one();
        }
    }

    /// Block until either `hint` exceeds `known_end` or `timeout`
    /// elapses; returns the hint value observed on wake.
    pub fn wait(&self, known_end: u64, timeout: std::time::Duration) -> u64 {
        let (lock, cvar) = &*self.hint;
        let guard = lock.lock().unwrap();
        let (guard, _) = cvar
            .wait_timeout_while(guard, timeout, |hint| *hint <= known_end)
            .unwrap();
        *guard
    }
}

//////////////////////////////////////////// ReplicaMessage ////////////////////////////////////////

enum ReplicaMessage {
    Promise(PromiseRequest, mpsc::Sender<Result<PromiseReply, synod_pb::Error>>),
    Write(WriteRequest, mpsc::Sender<Result<WriteReply, synod_pb::Error>>),
    Learned(LearnedRequest, mpsc::Sender<Result<LearnedReply, synod_pb::Error>>),
    Recover(RecoverRequest, mpsc::Sender<Result<RecoverReply, synod_pb::Error>>),
}

//////////////////////////////////////////// ReplicaHandle /////////////////////////////////////////

/// A cheap, `Clone`-able reference to a running `Replica` actor.  This
/// is what gets bound into a `synod_pb::ReplicaServer` and what the
/// local `Coordinator`/catch-up thread call directly without going
/// over the network.
#[derive(Clone)]
pub struct ReplicaHandle {
    mailbox: mpsc::Sender<ReplicaMessage>,
    caught_up: Arc<AtomicBool>,
    catchup_signal: CatchupSignal,
    self_id: ReplicaId,
}

impl ReplicaHandle {
    pub fn self_id(&self) -> ReplicaId {
        self.self_id
    }

    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    pub fn mark_caught_up(&self) {
        self.caught_up.store(true, Ordering::Release);
    }

    pub fn catchup_signal(&self) -> CatchupSignal {
        self.catchup_signal.clone()
    }

    fn dispatch<Resp: 'static>(
        &self,
        build: impl FnOnce(mpsc::Sender<Result<Resp, synod_pb::Error>>) -> ReplicaMessage,
    ) -> Result<Resp, synod_pb::Error> {
        let (tx, rx) = mpsc::channel();
        let message = build(tx);
        if self.mailbox.send(message).is_err() {
            return Err(actor_unavailable());
        }
        rx.recv().unwrap_or_else(|_| Err(actor_unavailable()))
    }
}

fn actor_unavailable() -> synod_pb::Error {
    synod_pb::Error::RpcError {
        core: zerror_core::ErrorCore::default(),
        what: rpc_pb::Error::TransportFailure {
            core: zerror_core::ErrorCore::default(),
            what: "replica actor thread is not running".to_string(),
        },
    }
}

impl ReplicaService for ReplicaHandle {
    fn promise(
        &self,
        _ctx: &rpc_pb::Context,
        req: PromiseRequest,
    ) -> Result<PromiseReply, synod_pb::Error> {
        self.catchup_signal.observe(req.ending_slot);
        self.dispatch(|tx| ReplicaMessage::Promise(req, tx))
    }

    fn write(
        &self,
        _ctx: &rpc_pb::Context,
        req: WriteRequest,
    ) -> Result<WriteReply, synod_pb::Error> {
        self.catchup_signal.observe(req.position.value);
        self.dispatch(|tx| ReplicaMessage::Write(req, tx))
    }

    fn learned(
        &self,
        _ctx: &rpc_pb::Context,
        req: LearnedRequest,
    ) -> Result<LearnedReply, synod_pb::Error> {
        self.catchup_signal.observe(req.position.value);
        self.dispatch(|tx| ReplicaMessage::Learned(req, tx))
    }

    fn recover(
        &self,
        _ctx: &rpc_pb::Context,
        req: RecoverRequest,
    ) -> Result<RecoverReply, synod_pb::Error> {
        self.dispatch(|tx| ReplicaMessage::Recover(req, tx))
    }
}

//////////////////////////////////////////// Replica ///////////////////////////////////////////////

/// Owns the backing `FileLog` and runs the actor loop.  Dropping the
/// `Replica` joins its thread (via [BackgroundThread]); the paired
/// [ReplicaHandle] can be cloned freely and outlives no particular
/// call.
pub struct Replica {
    _thread: BackgroundThread,
}

impl Replica {
    /// Opens `path`, starts the actor thread, and returns the handle
    /// callers use to reach it (locally or via `ReplicaServer::bind`).
    pub fn spawn(self_id: ReplicaId, path: std::path::PathBuf) -> std::io::Result<(Self, ReplicaHandle)> {
        let log = FileLog::open(&path).map_err(|err| {
            std::io::Error::new(std::io::ErrorKind::Other, err.to_string())
        })?;
        let (tx, rx) = mpsc::channel::<ReplicaMessage>();
        let handle = ReplicaHandle {
            mailbox: tx,
            // A freshly opened replica is assumed caught up until the
            // catch-up task observes otherwise; this lets a sole founding
            // member (or one restarted with an intact log) serve requests
            // immediately instead of waiting on a peer that may not exist.
            caught_up: Arc::new(AtomicBool::new(true)),
            catchup_signal: CatchupSignal::new(),
            self_id,
        };
        let caught_up = Arc::clone(&handle.caught_up);
        let thread = BackgroundThread::spawn(move |done| {
            run_actor_loop(log, rx, done, self_id, caught_up);
        });
        Ok((Self { _thread: thread }, handle))
    }
}

fn run_actor_loop(
    mut log: FileLog,
    rx: mpsc::Receiver<ReplicaMessage>,
    done: Arc<AtomicBool>,
    self_id: ReplicaId,
    caught_up: Arc<AtomicBool>,
) {
    while !done.load(Ordering::Relaxed) {
        let message = match rx.recv_timeout(std::time::Duration::from_millis(100)) {
            Ok(message) => message,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        };
        let is_caught_up = caught_up.load(Ordering::Acquire);
        match message {
            ReplicaMessage::Promise(req, reply) => {
                let _ = reply.send(handle_promise(&mut log, req, is_caught_up));
            }
            ReplicaMessage::Write(req, reply) => {
                let _ = reply.send(handle_write(&mut log, req, self_id, is_caught_up));
            }
            ReplicaMessage::Learned(req, reply) => {
                let _ = reply.send(handle_learned(&mut log, req));
            }
            ReplicaMessage::Recover(req, reply) => {
                let _ = reply.send(handle_recover(&mut log, req));
            }
        }
    }
}

fn handle_promise(
    log: &mut FileLog,
    req: PromiseRequest,
    is_caught_up: bool,
) -> Result<PromiseReply, synod_pb::Error> {
    PROMISE.click();
    if !is_caught_up {
        return Ok(PromiseReply::CatchingUp);
    }
    let snap = log.snapshot();
    if req.ballot < snap.promised {
        PROMISE_NACKED.click();
        return Ok(PromiseReply::Nack {
            higher: snap.promised,
        });
    }
    if let Err(err) = log.persist_metadata(req.ballot) {
        return Err(storage_err_to_rpc(err));
    }
    let mut records = Vec::new();
    for slot in req.starting_slot..=req.ending_slot {
        if let Some(accepted) = log.slot(synod_pb::Position::new(slot)) {
            records.push(SlotRecord {
                position: synod_pb::Position::new(slot),
                accepted,
            });
        }
    }
    clue!(LOGGING, INFO, {
        replica_promise: {
            ballot: req.ballot.to_string(),
            slots_returned: records.len(),
        },
    });
    Ok(PromiseReply::Promised { records })
}

fn handle_write(
    log: &mut FileLog,
    req: WriteRequest,
    self_id: ReplicaId,
    is_caught_up: bool,
) -> Result<WriteReply, synod_pb::Error> {
    WRITE.click();
    if !is_caught_up {
        return Ok(WriteReply::CatchingUp);
    }
    let snap = log.snapshot();
    if req.ballot < snap.promised {
        WRITE_NACKED.click();
        return Ok(WriteReply::Nack {
            higher: snap.promised,
        });
    }
    let _ = self_id;
    if let Err(err) = log.write(req.position, req.ballot, req.kind, false) {
        return Err(storage_err_to_rpc(err));
    }
    Ok(WriteReply::WriteOk {
        position: req.position,
    })
}

fn handle_learned(log: &mut FileLog, req: LearnedRequest) -> Result<LearnedReply, synod_pb::Error> {
    LEARNED.click();
    let ballot = log
        .slot(req.position)
        .map(|accepted| accepted.ballot)
        .unwrap_or(Ballot::BOTTOM);
    if let Err(err) = log.write(req.position, ballot, req.kind.clone(), true) {
        return Err(storage_err_to_rpc(err));
    }
    if let EntryKind::Truncate { to } = req.kind {
        if let Err(err) = log.truncate_prefix(to) {
            return Err(storage_err_to_rpc(err));
        }
    }
    Ok(LearnedReply {})
}

fn handle_recover(log: &FileLog, req: RecoverRequest) -> Result<RecoverReply, synod_pb::Error> {
    RECOVER.click();
    match log.read(req.from, req.to) {
        Ok(entries) => {
            let snap = log.snapshot();
            let records = entries
                .into_iter()
                .map(|entry: Entry| SlotRecord {
                    position: entry.position,
                    accepted: Accepted {
                        ballot: log.slot(entry.position).map(|a| a.ballot).unwrap_or_default(),
                        kind: entry.kind,
                        learned: true,
                    },
                })
                .collect();
            Ok(RecoverReply::Ok {
                entries: records,
                begin: snap.begin,
                end: snap.end,
            })
        }
        Err(synod_storage::Error::Truncated { begin, .. }) => Ok(RecoverReply::Truncated { begin }),
        Err(synod_storage::Error::NotYetLearned { end, .. }) => {
            let snap = log.snapshot();
            Ok(RecoverReply::Ok {
                entries: Vec::new(),
                begin: snap.begin,
                end,
            })
        }
        Err(err) => Err(storage_err_to_rpc(err)),
    }
}

fn storage_err_to_rpc(err: synod_storage::Error) -> synod_pb::Error {
    synod_pb::Error::RpcError {
        core: zerror_core::ErrorCore::default(),
        what: rpc_pb::Error::from(std::io::Error::new(
            std::io::ErrorKind::Other,
            err.to_string(),
        )),
    }
}
