//! The background task that brings a lagging replica up to date.
//!
//! Runs on its own OS thread (not a third actor mailbox) so that the
//! I/O it performs against a peer never blocks the `Replica` actor's
//! handling of `Promise`/`Write`/`Learned`. It drives the same
//! [ReplicaHandle] its owner uses, parked on a [CatchupSignal] the
//! `Replica` actor raises whenever it observes a peer-reported position
//! beyond its own `end`.

use std::sync::Arc;
use std::time::Duration;

use biometrics::Counter;

use buffertk::Unpackable;

use indicio::{clue, INFO};

use rpc_pb::Context;

use sync42::background::BackgroundThread;

use synod_pb::{Position, RecoverReply, RecoverRequest, ReplicaId, ReplicaService};

use synod_transport::Group;

use crate::replica::ReplicaHandle;
use crate::LOGGING;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static BATCHES_PULLED: Counter = Counter::new("synod.catchup.batches_pulled");
static ENTRIES_INSTALLED: Counter = Counter::new("synod.catchup.entries_installed");
static CAUGHT_UP: Counter = Counter::new("synod.catchup.caught_up");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&BATCHES_PULLED);
    collector.register_counter(&ENTRIES_INSTALLED);
    collector.register_counter(&CAUGHT_UP);
}

/// Positions pulled per `Recover` round trip.
const BATCH: u64 = 256;
/// Fallback polling interval when no signal has fired; keeps a replica
/// with no peer traffic from stalling forever behind a quorum that
/// isn't sending it anything.
const FALLBACK_TICK: Duration = Duration::from_millis(250);

/// Owns the catch-up thread for one local replica. Dropping this joins
/// the thread, same lifecycle discipline as [crate::replica::Replica].
pub struct CatchupTask {
    _thread: BackgroundThread,
}

impl CatchupTask {
    pub fn spawn(local: ReplicaHandle, group: Group, self_id: ReplicaId) -> Self {
        let signal = local.catchup_signal();
        let thread = BackgroundThread::spawn(move |done| {
            run(local, group, self_id, signal, done);
        });
        Self { _thread: thread }
    }
}

fn run(
    local: ReplicaHandle,
    group: Group,
    self_id: ReplicaId,
    signal: crate::replica::CatchupSignal,
    done: Arc<std::sync::atomic::AtomicBool>,
) {
    let _ = self_id;
    while !done.load(std::sync::atomic::Ordering::Relaxed) {
        let local_end = local_end(&local);
        let hint = signal.wait(local_end, FALLBACK_TICK);
        if done.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        if group.size() == 0 {
            // No peers to catch up from; a sole member is caught up by
            // definition once it has replayed its own durable log.
            local.mark_caught_up();
            continue;
        }
        pull_one_batch(&local, &group, hint);
    }
}

fn local_end(local: &ReplicaHandle) -> u64 {
    match local.recover(
        &Context::default(),
        RecoverRequest {
            from: Position::BEFORE_BEGINNING,
            to: Position::BEFORE_BEGINNING,
        },
    ) {
        Ok(RecoverReply::Ok { end, .. }) => end.value,
        Ok(RecoverReply::Truncated { begin }) => begin.value,
        Err(_) => 0,
    }
}

/// Pulls `[local_end+1, local_end+BATCH]` from any one peer and installs
/// every entry the peer itself reports as learned. Per I2, a peer never
/// reports a position learned unless every future quorum must agree on
/// its value, so no separate confirmation round is needed.
fn pull_one_batch(local: &ReplicaHandle, group: &Group, hint: u64) {
    let _ = hint;
    let start = local_end(local) + 1;
    let end = start + BATCH - 1;
    let request = RecoverRequest {
        from: Position::new(start),
        to: Position::new(end),
    };
    let results = group.broadcast(Duration::from_secs(5), move |client| {
        let body = buffertk::stack_pack(request.clone()).to_vec();
        let status = rpc_pb::Client::call(
            client,
            &Context::default(),
            "ReplicaService",
            "recover",
            &body,
        );
        let body = status.ok()?.ok()?;
        let (reply, _) = RecoverReply::unpack(&body).ok()?;
        Some(reply)
    });
    BATCHES_PULLED.click();

    let mut quorum_end = 0u64;
    for (_, reply) in &results {
        if let RecoverReply::Ok { end, .. } = reply {
            quorum_end = quorum_end.max(end.value);
        }
    }

    for (peer, reply) in results {
        let RecoverReply::Ok { entries, .. } = reply else {
            continue;
        };
        for record in entries {
            if !record.accepted.learned {
                continue;
            }
            let result = local.learned(
                &Context::default(),
                synod_pb::LearnedRequest {
                    position: record.position,
                    kind: record.accepted.kind,
                },
            );
            if result.is_ok() {
                ENTRIES_INSTALLED.click();
            } else {
                clue!(LOGGING, INFO, {
                    catchup_install_failed: { peer: peer.to_string() },
                });
            }
        }
    }

    if local_end(local) >= quorum_end {
        local.mark_caught_up();
        CAUGHT_UP.click();
    }
}
