//! The client-facing append/truncate handle.
//!
//! A `Writer` lazily elects and caches a [Coordinator]; once a
//! coordinator is permanently invalidated (a Nack it cannot supersede,
//! a timeout, or an I/O error) the next call transparently elects a
//! fresh one rather than forcing the caller to build a new `Writer`.

use std::sync::Mutex;
use std::time::Duration;

use synod_pb::{Position, ReplicaId};

use synod_transport::Group;

use crate::coordinator::Coordinator;
use crate::replica::ReplicaHandle;

/// Default retry budget for re-election, matching the `retries=3`
/// default named for the `Writer` constructor.
pub const DEFAULT_RETRIES: u32 = 3;

pub struct Writer {
    self_id: ReplicaId,
    local: ReplicaHandle,
    group: Group,
    retries: u32,
    coordinator: Mutex<Option<Coordinator>>,
}

impl Writer {
    pub fn new(self_id: ReplicaId, local: ReplicaHandle, group: Group, retries: u32) -> Self {
        Self {
            self_id,
            local,
            group,
            retries,
            coordinator: Mutex::new(None),
        }
    }

    /// Appends `payload` as the next position.
    pub fn append(&self, payload: Vec<u8>, timeout: Duration) -> Result<Option<Position>, crate::Error> {
        self.with_coordinator(timeout, |coordinator| coordinator.append(payload.clone(), timeout))
    }

    /// Truncates the prefix below `to`.
    pub fn truncate(&self, to: Position, timeout: Duration) -> Result<Option<Position>, crate::Error> {
        self.with_coordinator(timeout, |coordinator| coordinator.truncate(to, timeout))
    }

    fn with_coordinator<T>(
        &self,
        timeout: Duration,
        op: impl Fn(&Coordinator) -> Result<T, crate::Error>,
    ) -> Result<T, crate::Error> {
        let mut guard = self.coordinator.lock().unwrap();
        if guard.as_ref().map(|c| !c.is_valid()).unwrap_or(true) {
            let elected = Coordinator::elect(
                self.self_id,
                self.local.clone(),
                self.group.clone(),
                self.retries,
                timeout,
            )?;
            *guard = Some(elected);
        }
        let coordinator = guard.as_ref().expect("just populated above");
        let result = op(coordinator);
        if matches!(result, Err(crate::Error::CoordinatorLost { .. })) {
            *guard = None;
        }
        result
    }
}
