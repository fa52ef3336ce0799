//! The write-side state machine: elects a ballot, fills any gaps left
//! by a previous coordinator, and serializes client appends/truncates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use biometrics::Counter;

use indicio::{clue, INFO, WARNING};

use buffertk::Unpackable;

use rpc_pb::Context;

use synod_pb::{
    Accepted, Ballot, EntryKind, LearnedRequest, Position, PromiseReply, PromiseRequest,
    ReplicaId, ReplicaService, WriteReply, WriteRequest,
};

use synod_transport::Group;

use crate::replica::ReplicaHandle;
use crate::LOGGING;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static ELECTIONS: Counter = Counter::new("synod.coordinator.elections");
static ELECTIONS_FAILED: Counter = Counter::new("synod.coordinator.elections.failed");
static QUORUM_MET: Counter = Counter::new("synod.coordinator.quorum_met");
static QUORUM_MISSED: Counter = Counter::new("synod.coordinator.quorum_missed");
static GAPS_FILLED: Counter = Counter::new("synod.coordinator.gaps_filled");
static APPENDS: Counter = Counter::new("synod.coordinator.appends");
static TRUNCATES: Counter = Counter::new("synod.coordinator.truncates");
static CATCHING_UP_ABSTENTIONS: Counter = Counter::new("synod.coordinator.catching_up_abstentions");
static INVALIDATED: Counter = Counter::new("synod.coordinator.invalidated");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&ELECTIONS);
    collector.register_counter(&ELECTIONS_FAILED);
    collector.register_counter(&QUORUM_MET);
    collector.register_counter(&QUORUM_MISSED);
    collector.register_counter(&GAPS_FILLED);
    collector.register_counter(&APPENDS);
    collector.register_counter(&TRUNCATES);
    collector.register_counter(&CATCHING_UP_ABSTENTIONS);
    collector.register_counter(&INVALIDATED);
}

const ELECTION_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ELECTION_BACKOFF_CAP: Duration = Duration::from_millis(200);
const ELECTION_SLACK: u64 = 16;

/// A proposer's view of one slot gathered during the prepare phase: the
/// highest-ballot accepted record any quorum member reported, if any.
#[derive(Clone)]
struct GapSlot {
    position: Position,
    accepted: Option<Accepted>,
}

/// A coordinator instance is good for exactly one successful election;
/// once `invalid` is set, every subsequent call returns `CoordinatorLost`
/// and the caller must build a new one.
pub struct Coordinator {
    self_id: ReplicaId,
    local: ReplicaHandle,
    group: Group,
    retries: u32,
    ballot: Mutex<Ballot>,
    next_position: AtomicU64,
    invalid: std::sync::atomic::AtomicBool,
    serve_lock: Mutex<()>,
}

impl Coordinator {
    pub fn self_id(&self) -> ReplicaId {
        self.self_id
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_valid(&self) -> bool {
        !self.invalid.load(Ordering::Acquire)
    }

    /// Elects this coordinator: persists a fresh ballot locally,
    /// broadcasts `Promise`, collects a quorum, and fills any gaps the
    /// quorum revealed. Returns an elected, ready-to-serve `Coordinator`
    /// or `CoordinatorLost` if election could not complete within
    /// `retries` attempts.
    pub fn elect(
        self_id: ReplicaId,
        local: ReplicaHandle,
        group: Group,
        retries: u32,
        timeout: Duration,
    ) -> Result<Self, crate::Error> {
        let mut proposal_number = local_highest_proposal_number(&local)?;
        let mut backoff = ELECTION_BACKOFF_BASE;
        for attempt in 0..=retries {
            let ballot = Ballot::new(proposal_number + 1, self_id);
            ELECTIONS.click();
            match try_elect(self_id, &local, &group, ballot, timeout) {
                Ok(gaps) => {
                    let coordinator = Self {
                        self_id,
                        local: local.clone(),
                        group,
                        retries,
                        ballot: Mutex::new(ballot),
                        next_position: AtomicU64::new(0),
                        invalid: std::sync::atomic::AtomicBool::new(false),
                        serve_lock: Mutex::new(()),
                    };
                    coordinator.fill_gaps(gaps, timeout)?;
                    return Ok(coordinator);
                }
                Err(ElectError::HigherBallot(higher)) => {
                    ELECTIONS_FAILED.click();
                    proposal_number = proposal_number.max(higher.proposal_number);
                    clue!(LOGGING, INFO, {
                        coordinator_election_nacked: {
                            attempt: attempt,
                            higher: higher.to_string(),
                        },
                    });
                }
                Err(ElectError::NoQuorum) => {
                    ELECTIONS_FAILED.click();
                    clue!(LOGGING, WARNING, {
                        coordinator_election_no_quorum: { attempt: attempt },
                    });
                }
            }
            if attempt < retries {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(ELECTION_BACKOFF_CAP);
            }
        }
        Err(crate::Error::CoordinatorLost {
            core: Default::default(),
            higher: Ballot::new(proposal_number, self_id),
        })
    }

    fn check_valid(&self) -> Result<(), crate::Error> {
        if self.invalid.load(Ordering::Acquire) {
            let ballot = *self.ballot.lock().unwrap();
            return Err(crate::Error::CoordinatorLost {
                core: Default::default(),
                higher: ballot,
            });
        }
        Ok(())
    }

    fn invalidate(&self) {
        INVALIDATED.click();
        self.invalid.store(true, Ordering::Release);
    }

    /// Re-proposes the quorum's highest-accepted value for each gap slot
    /// (or `Nop` where nothing was ever accepted), driving each to
    /// `Learned` before the coordinator starts serving new writes.
    fn fill_gaps(&self, gaps: Vec<GapSlot>, timeout: Duration) -> Result<(), crate::Error> {
        let mut highest = 0u64;
        for gap in &gaps {
            highest = highest.max(gap.position.value);
            if gap.accepted.as_ref().map_or(false, |a| a.learned) {
                continue;
            }
            let kind = gap
                .accepted
                .as_ref()
                .map(|a| a.kind.clone())
                .unwrap_or(EntryKind::Nop);
            self.drive_to_learned(gap.position, kind, timeout)?;
            GAPS_FILLED.click();
        }
        self.next_position.store(highest, Ordering::Release);
        Ok(())
    }

    /// Assigns the next position and drives `kind` to learned across a
    /// quorum. Returns `Ok(Some(position))` once learned, `Ok(None)` if
    /// the round timed out (outcome indeterminate), or invalidates and
    /// returns `Err` on a definitive Nack or transport failure.
    fn propose(&self, kind: EntryKind, timeout: Duration) -> Result<Option<Position>, crate::Error> {
        self.check_valid()?;
        let _serve = self.serve_lock.lock().unwrap();
        self.check_valid()?;
        let position = Position::new(self.next_position.fetch_add(1, Ordering::AcqRel) + 1);
        match self.drive_to_learned(position, kind, timeout) {
            Ok(()) => Ok(Some(position)),
            Err(DriveError::Timeout) => Ok(None),
            Err(DriveError::HigherBallot) => {
                self.invalidate();
                let ballot = *self.ballot.lock().unwrap();
                Err(crate::Error::CoordinatorLost {
                    core: Default::default(),
                    higher: ballot,
                })
            }
            Err(DriveError::Failed) => {
                self.invalidate();
                Err(crate::Error::CoordinatorLost {
                    core: Default::default(),
                    higher: *self.ballot.lock().unwrap(),
                })
            }
        }
    }

    /// Client entry point: append `payload` as the next position.
    pub fn append(&self, payload: Vec<u8>, timeout: Duration) -> Result<Option<Position>, crate::Error> {
        APPENDS.click();
        self.propose(EntryKind::Append { payload }, timeout)
    }

    /// Client entry point: truncate the prefix below `to`.
    pub fn truncate(&self, to: Position, timeout: Duration) -> Result<Option<Position>, crate::Error> {
        self.check_valid()?;
        let current_end = self.next_position.load(Ordering::Acquire);
        if to.value > current_end {
            return Err(crate::Error::InvalidPosition {
                core: Default::default(),
                requested: to,
            });
        }
        TRUNCATES.click();
        self.propose(EntryKind::Truncate { to }, timeout)
    }

    /// Writes `kind` at `position` under this coordinator's ballot to a
    /// quorum, then broadcasts `Learned`. The local replica is always
    /// included directly through `self.local`, never over the network.
    fn drive_to_learned(
        &self,
        position: Position,
        kind: EntryKind,
        timeout: Duration,
    ) -> Result<(), DriveError> {
        let ballot = *self.ballot.lock().unwrap();
        let local_reply = self.local.write(
            &Context::default(),
            WriteRequest {
                ballot,
                position,
                kind: kind.clone(),
            },
        );
        let mut accepts = match local_reply {
            Ok(WriteReply::WriteOk { .. }) => 1,
            Ok(WriteReply::Nack { higher }) => return Err(higher_or_timeout(higher, ballot)),
            Ok(WriteReply::CatchingUp) => 0,
            Err(_) => 0,
        };

        let kind_for_peers = kind.clone();
        let results = self.group.broadcast(timeout, move |client| {
            let request = WriteRequest {
                ballot,
                position,
                kind: kind_for_peers.clone(),
            };
            let body = buffertk::stack_pack(request).to_vec();
            let status = rpc_pb::Client::call(
                client,
                &Context::default(),
                "ReplicaService",
                "write",
                &body,
            );
            decode_write_reply(status)
        });

        let mut highest_nack: Option<Ballot> = None;
        for (_, reply) in &results {
            match reply {
                WriteReply::WriteOk { .. } => accepts += 1,
                WriteReply::Nack { higher } => {
                    highest_nack = Some(highest_nack.map_or(*higher, |h| h.max(*higher)));
                }
                WriteReply::CatchingUp => {
                    CATCHING_UP_ABSTENTIONS.click();
                }
            }
        }
        if let Some(higher) = highest_nack {
            if higher > ballot {
                return Err(DriveError::HigherBallot);
            }
        }
        if accepts < self.group.quorum_size() {
            QUORUM_MISSED.click();
            return Err(DriveError::Timeout);
        }
        QUORUM_MET.click();

        let _ = self.local.learned(
            &Context::default(),
            LearnedRequest {
                position,
                kind: kind.clone(),
            },
        );
        let kind_for_learn = kind.clone();
        let _ = self.group.broadcast(timeout, move |client| {
            let request = LearnedRequest {
                position,
                kind: kind_for_learn.clone(),
            };
            let body = buffertk::stack_pack(request).to_vec();
            rpc_pb::Client::call(
                client,
                &Context::default(),
                "ReplicaService",
                "learned",
                &body,
            )
            .ok()
        });
        clue!(LOGGING, INFO, {
            coordinator_learned: {
                position: position.to_string(),
                ballot: ballot.to_string(),
            },
        });
        Ok(())
    }
}

fn higher_or_timeout(higher: Ballot, ours: Ballot) -> DriveError {
    if higher > ours {
        DriveError::HigherBallot
    } else {
        DriveError::Failed
    }
}

enum DriveError {
    Timeout,
    HigherBallot,
    Failed,
}

fn decode_write_reply(status: rpc_pb::Status) -> Option<WriteReply> {
    let body = status.ok()?.ok()?;
    let (reply, _) = WriteReply::unpack(&body).ok()?;
    Some(reply)
}

fn decode_promise_reply(status: rpc_pb::Status) -> Option<PromiseReply> {
    let body = status.ok()?.ok()?;
    let (reply, _) = PromiseReply::unpack(&body).ok()?;
    Some(reply)
}

enum ElectError {
    HigherBallot(Ballot),
    NoQuorum,
}

/// Runs the prepare phase at `ballot`: persists it locally, broadcasts
/// `Promise` across `[1, local_end + ELECTION_SLACK]`, and collects
/// quorum. Returns the merged per-slot gap view on success.
fn try_elect(
    self_id: ReplicaId,
    local: &ReplicaHandle,
    group: &Group,
    ballot: Ballot,
    timeout: Duration,
) -> Result<Vec<GapSlot>, ElectError> {
    let _ = self_id;
    let ending_slot = local_end_estimate(local) + ELECTION_SLACK;
    let request = PromiseRequest {
        ballot,
        starting_slot: 1,
        ending_slot,
    };
    let local_reply = local
        .promise(&Context::default(), request.clone())
        .ok();
    let mut gaps: std::collections::BTreeMap<u64, GapSlot> = std::collections::BTreeMap::new();
    let mut accepts = 0usize;
    let mut highest_nack: Option<Ballot> = None;

    if let Some(reply) = local_reply {
        merge_promise_reply(reply, &mut accepts, &mut highest_nack, &mut gaps);
    }

    let request_for_peers = request.clone();
    let results = group.broadcast(timeout, move |client| {
        let body = buffertk::stack_pack(request_for_peers.clone()).to_vec();
        let status = rpc_pb::Client::call(
            client,
            &Context::default(),
            "ReplicaService",
            "promise",
            &body,
        );
        decode_promise_reply(status)
    });
    for (_, reply) in results {
        merge_promise_reply(reply, &mut accepts, &mut highest_nack, &mut gaps);
    }

    if let Some(higher) = highest_nack {
        if higher > ballot {
            return Err(ElectError::HigherBallot(higher));
        }
    }
    if accepts < group.quorum_size() {
        return Err(ElectError::NoQuorum);
    }
    Ok(gaps.into_values().collect())
}

fn merge_promise_reply(
    reply: PromiseReply,
    accepts: &mut usize,
    highest_nack: &mut Option<Ballot>,
    gaps: &mut std::collections::BTreeMap<u64, GapSlot>,
) {
    match reply {
        PromiseReply::Promised { records } => {
            *accepts += 1;
            for record in records {
                let slot = gaps.entry(record.position.value).or_insert(GapSlot {
                    position: record.position,
                    accepted: None,
                });
                let supersedes = slot
                    .accepted
                    .as_ref()
                    .map(|existing| record.accepted.ballot > existing.ballot)
                    .unwrap_or(true);
                if supersedes && record.accepted.ballot != Ballot::BOTTOM {
                    slot.accepted = Some(record.accepted);
                }
            }
        }
        PromiseReply::Nack { higher } => {
            *highest_nack = Some(highest_nack.map_or(higher, |h| h.max(higher)));
        }
        PromiseReply::CatchingUp => {
            CATCHING_UP_ABSTENTIONS.click();
        }
    }
}

fn local_end_estimate(local: &ReplicaHandle) -> u64 {
    // A zero-range recover only ever reports `begin`/`end`; entries are
    // discarded.
    local
        .recover(
            &Context::default(),
            synod_pb::RecoverRequest {
                from: Position::BEFORE_BEGINNING,
                to: Position::BEFORE_BEGINNING,
            },
        )
        .ok()
        .map(|reply| match reply {
            synod_pb::RecoverReply::Ok { end, .. } => end.value,
            synod_pb::RecoverReply::Truncated { begin } => begin.value,
        })
        .unwrap_or(0)
}

fn local_highest_proposal_number(local: &ReplicaHandle) -> Result<u64, crate::Error> {
    // `Promise` at the bottom ballot never succeeds, but every replica
    // replies with whatever it has already promised, which is the
    // highest proposal number this process has ever used.
    let reply = local.promise(
        &Context::default(),
        PromiseRequest {
            ballot: Ballot::BOTTOM,
            starting_slot: 1,
            ending_slot: 1,
        },
    )?;
    Ok(match reply {
        PromiseReply::Nack { higher } => higher.proposal_number,
        PromiseReply::Promised { .. } => 0,
        PromiseReply::CatchingUp => 0,
    })
}
