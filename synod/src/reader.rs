//! The client-facing range-read handle.

use std::time::Duration;

use biometrics::Counter;

use buffertk::Unpackable;

use rpc_pb::Context;

use synod_pb::{Position, Record, RecoverReply, RecoverRequest, ReplicaService};

use synod_transport::Group;

use crate::replica::ReplicaHandle;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static READS: Counter = Counter::new("synod.reader.reads");
static READS_TRUNCATED: Counter = Counter::new("synod.reader.reads.truncated");
static READS_TIMED_OUT: Counter = Counter::new("synod.reader.reads.timed_out");

pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&READS);
    collector.register_counter(&READS_TRUNCATED);
    collector.register_counter(&READS_TIMED_OUT);
}

/// A quorum-consulting range reader. `Reader` holds no coordinator and
/// never blocks a write; it only ever asks replicas what they already
/// have learned.
pub struct Reader {
    local: ReplicaHandle,
    group: Group,
}

impl Reader {
    pub fn new(local: ReplicaHandle, group: Group) -> Self {
        Self { local, group }
    }

    /// The local replica's best estimate of the lowest readable
    /// position; may lag the cluster's true value.
    pub fn beginning(&self) -> Position {
        self.local_snapshot().0
    }

    /// The local replica's best estimate of the highest learned
    /// position; may lag the cluster's true value.
    pub fn ending(&self) -> Position {
        self.local_snapshot().1
    }

    fn local_snapshot(&self) -> (Position, Position) {
        match self.local.recover(
            &Context::default(),
            RecoverRequest {
                from: Position::BEFORE_BEGINNING,
                to: Position::BEFORE_BEGINNING,
            },
        ) {
            Ok(RecoverReply::Ok { begin, end, .. }) => (begin, end),
            Ok(RecoverReply::Truncated { begin }) => (begin, begin),
            Err(_) => (Position::BEFORE_BEGINNING, Position::BEFORE_BEGINNING),
        }
    }

    /// Reads all learned `Append` entries in `[from, to]`. Returns the
    /// first reply (local or remote) whose `[begin, end]` fully covers
    /// the request; `Truncated` if any quorum member has already
    /// advanced its `begin` past `from`; `Timeout` if no replica covers
    /// `to` before the deadline.
    pub fn read(
        &self,
        from: Position,
        to: Position,
        timeout: Duration,
    ) -> Result<Vec<Record>, crate::Error> {
        READS.click();
        let request = RecoverRequest { from, to };
        if let Ok(reply) = self.local.recover(&Context::default(), request.clone()) {
            if let Some(records) = self.accept_if_covers(&reply, from, to)? {
                return Ok(records);
            }
        }

        let results = self.group.broadcast(timeout, move |client| {
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

        let mut highest_begin = Position::BEFORE_BEGINNING;
        for (_, reply) in &results {
            if let RecoverReply::Truncated { begin } = reply {
                highest_begin = highest_begin.max(*begin);
            }
            if let Some(records) = self.accept_if_covers(reply, from, to)? {
                return Ok(records);
            }
        }
        if from.value > 0 && from.value < highest_begin.value {
            READS_TRUNCATED.click();
            return Err(crate::Error::Truncated {
                core: Default::default(),
                begin: highest_begin,
            });
        }
        READS_TIMED_OUT.click();
        Err(crate::Error::Timeout {
            core: Default::default(),
        })
    }

    /// Returns `Ok(Some(records))` if `reply` covers `[from, to]`,
    /// `Err(Truncated)` if it reports a prefix that has already
    /// consumed `from`, or `Ok(None)` if it simply doesn't cover the
    /// range yet.
    fn accept_if_covers(
        &self,
        reply: &RecoverReply,
        from: Position,
        to: Position,
    ) -> Result<Option<Vec<Record>>, crate::Error> {
        match reply {
            RecoverReply::Truncated { begin } if from.value > 0 && from.value < begin.value => {
                READS_TRUNCATED.click();
                Err(crate::Error::Truncated {
                    core: Default::default(),
                    begin: *begin,
                })
            }
            RecoverReply::Truncated { .. } => Ok(None),
            RecoverReply::Ok { entries, begin, end } => {
                if (from.value == 0 || from.value >= begin.value) && to.value <= end.value {
                    let records = entries
                        .iter()
                        .cloned()
                        .filter_map(|record| {
                            synod_pb::Entry {
                                position: record.position,
                                kind: record.accepted.kind,
                            }
                            .into_record()
                        })
                        .collect();
                    Ok(Some(records))
                } else {
                    Ok(None)
                }
            }
        }
    }
}
