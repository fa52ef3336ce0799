//! Wire types and RPC service definitions for the synod replicated log.
//!
//! This crate holds no behavior beyond trivial constructors and
//! accessors.  Storage, replication, and coordination logic live in
//! `synod_storage`, `synod_transport`, and `synod`.

use prototk_derive::Message;

use rpc_pb::service;

use zerror_core::ErrorCore;

///////////////////////////////////////////// Error //////////////////////////////////////////////

/// Errors that can occur while encoding, decoding, or transporting a
/// synod wire message.  API-level errors (Truncated, CoordinatorLost,
/// ...) live in the `synod` crate, which wraps this error.
#[derive(Clone, Message, zerror_derive::Z)]
pub enum Error {
    #[prototk(884736, message)]
    Success {
        #[prototk(1, message)]
        core: ErrorCore,
    },
    #[prototk(884737, message)]
    SerializationError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: prototk::Error,
    },
    #[prototk(884738, message)]
    RpcError {
        #[prototk(1, message)]
        core: ErrorCore,
        #[prototk(2, message)]
        what: rpc_pb::Error,
    },
}

impl Default for Error {
    fn default() -> Self {
        Self::Success {
            core: ErrorCore::default(),
        }
    }
}

impl From<prototk::Error> for Error {
    fn from(what: prototk::Error) -> Self {
        Self::SerializationError {
            core: ErrorCore::default(),
            what,
        }
    }
}

impl From<rpc_pb::Error> for Error {
    fn from(what: rpc_pb::Error) -> Self {
        Self::RpcError {
            core: ErrorCore::default(),
            what,
        }
    }
}

//////////////////////////////////////////// ReplicaId ///////////////////////////////////////////

/// The durable, process-wide identity of one replica.  Ballots are
/// ordered by `(proposal_number, proposer)`, so every replica must use a
/// distinct `ReplicaId` for the ordering in I5 to hold.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct ReplicaId {
    #[prototk(1, uint64)]
    pub value: u64,
}

impl ReplicaId {
    pub const BOTTOM: ReplicaId = ReplicaId { value: 0 };
    pub const TOP: ReplicaId = ReplicaId { value: u64::MAX };

    pub const fn new(value: u64) -> Self {
        Self { value }
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "replica:{}", self.value)
    }
}

///////////////////////////////////////////// Position ///////////////////////////////////////////

/// An opaque, monotonically increasing slot index.  Position 0 is
/// reserved as the "before beginning" marker; real entries start at 1.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct Position {
    #[prototk(1, uint64)]
    pub value: u64,
}

impl Position {
    pub const BEFORE_BEGINNING: Position = Position { value: 0 };

    pub const fn new(value: u64) -> Self {
        Self { value }
    }

    pub fn next(self) -> Position {
        Position::new(self.value + 1)
    }

    /// The 8-byte big-endian identity used for external persistence and
    /// the public `Log::position`/`Position::identity` round trip.
    pub fn identity(&self) -> [u8; 8] {
        self.value.to_be_bytes()
    }

    pub fn from_identity(bytes: [u8; 8]) -> Position {
        Position::new(u64::from_be_bytes(bytes))
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

////////////////////////////////////////////// Ballot /////////////////////////////////////////////

/// A ballot is never created concurrently by two replicas with the same
/// `(proposal_number, proposer)` pair.  Ballots order lexicographically
/// by `(proposal_number, proposer)`; a proposer whose ballot has been
/// superseded picks a higher `proposal_number` to supersede in turn.
#[derive(Clone, Copy, Debug, Eq, Hash, Message, Ord, PartialEq, PartialOrd)]
pub struct Ballot {
    #[prototk(1, uint64)]
    pub proposal_number: u64,
    #[prototk(2, message)]
    pub proposer: ReplicaId,
}

impl Ballot {
    pub const BOTTOM: Ballot = Ballot {
        proposal_number: 0,
        proposer: ReplicaId::BOTTOM,
    };
    pub const TOP: Ballot = Ballot {
        proposal_number: u64::MAX,
        proposer: ReplicaId::TOP,
    };

    pub const fn new(proposal_number: u64, proposer: ReplicaId) -> Self {
        Self {
            proposal_number,
            proposer,
        }
    }

    /// The next ballot this proposer may propose that is guaranteed to
    /// supersede `self`.
    pub fn next_for(self, proposer: ReplicaId) -> Ballot {
        Ballot::new(self.proposal_number + 1, proposer)
    }
}

impl Default for Ballot {
    fn default() -> Self {
        Self::BOTTOM
    }
}

impl std::fmt::Display for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ballot({}, {})", self.proposal_number, self.proposer)
    }
}

//////////////////////////////////////////// EntryKind ////////////////////////////////////////////

/// The logical content of one slot.  `Nop` and `Truncate` are protocol
/// artifacts; only `Append` payloads are ever returned to a reader.
#[derive(Clone, Debug, Default, Eq, Message, PartialEq)]
pub enum EntryKind {
    #[prototk(1, message)]
    #[default]
    Nop,
    #[prototk(2, message)]
    Append {
        #[prototk(1, bytes)]
        payload: Vec<u8>,
    },
    #[prototk(3, message)]
    Truncate {
        #[prototk(1, message)]
        to: Position,
    },
}

impl EntryKind {
    pub fn is_user_visible(&self) -> bool {
        matches!(self, EntryKind::Append { .. })
    }

    pub fn tag(&self) -> u8 {
        match self {
            EntryKind::Append { .. } => 1,
            EntryKind::Truncate { .. } => 2,
            EntryKind::Nop => 3,
        }
    }
}

///////////////////////////////////////////// Accepted ////////////////////////////////////////////

/// What one replica has tentatively or durably accepted for a slot.
#[derive(Clone, Debug, Default, Message, PartialEq)]
pub struct Accepted {
    #[prototk(1, message)]
    pub ballot: Ballot,
    #[prototk(2, message)]
    pub kind: EntryKind,
    #[prototk(3, Bool)]
    pub learned: bool,
}

////////////////////////////////////////////// Entry //////////////////////////////////////////////

/// One slot's durable record as used internally by storage and
/// recovery: a position paired with whichever kind was learned there.
/// Never exposed to readers directly — see [Record] for the
/// user-visible, `Append`-only view.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub position: Position,
    pub kind: EntryKind,
}

/// A user-visible `(Position, bytes)` pair.  Readers only ever see
/// `Record`s drawn from learned `Append` entries; `Nop` and `Truncate`
/// are protocol artifacts and never materialize as a `Record`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub position: Position,
    pub payload: Vec<u8>,
}

impl Entry {
    /// Project this entry down to a user-visible record, if it carries
    /// an `Append` payload.
    pub fn into_record(self) -> Option<Record> {
        match self.kind {
            EntryKind::Append { payload } => Some(Record {
                position: self.position,
                payload,
            }),
            EntryKind::Nop | EntryKind::Truncate { .. } => None,
        }
    }
}

///////////////////////////////////////////// SlotRecord //////////////////////////////////////////

/// A single slot's record as carried over the wire, e.g. in a
/// `Promised` or `RecoverReply::Ok` reply.
#[derive(Clone, Debug, Default, Message, PartialEq)]
pub struct SlotRecord {
    #[prototk(1, message)]
    pub position: Position,
    #[prototk(2, message)]
    pub accepted: Accepted,
}

////////////////////////////////////////// Promise / Promised /////////////////////////////////////

/// Rallies support for `ballot` across `[starting_slot, ending_slot]`.
#[derive(Clone, Debug, Default, Message)]
pub struct PromiseRequest {
    #[prototk(1, message)]
    pub ballot: Ballot,
    #[prototk(2, uint64)]
    pub starting_slot: u64,
    #[prototk(3, uint64)]
    pub ending_slot: u64,
}

#[derive(Clone, Debug, Message)]
pub enum PromiseReply {
    #[prototk(1, message)]
    Promised {
        #[prototk(1, message)]
        records: Vec<SlotRecord>,
    },
    #[prototk(2, message)]
    Nack {
        #[prototk(1, message)]
        higher: Ballot,
    },
    #[prototk(3, message)]
    CatchingUp,
}

impl Default for PromiseReply {
    fn default() -> Self {
        PromiseReply::Promised {
            records: Vec::default(),
        }
    }
}

///////////////////////////////////////////// Write / WriteOk /////////////////////////////////////

/// Tentatively accepts `kind` for `position` under `ballot`.
#[derive(Clone, Debug, Default, Message)]
pub struct WriteRequest {
    #[prototk(1, message)]
    pub ballot: Ballot,
    #[prototk(2, message)]
    pub position: Position,
    #[prototk(3, message)]
    pub kind: EntryKind,
}

#[derive(Clone, Debug, Message)]
pub enum WriteReply {
    #[prototk(1, message)]
    WriteOk {
        #[prototk(1, message)]
        position: Position,
    },
    #[prototk(2, message)]
    Nack {
        #[prototk(1, message)]
        higher: Ballot,
    },
    #[prototk(3, message)]
    CatchingUp,
}

impl Default for WriteReply {
    fn default() -> Self {
        WriteReply::WriteOk {
            position: Position::default(),
        }
    }
}

///////////////////////////////////////////// Learned / Ack ///////////////////////////////////////

/// Marks `position` learned with `kind`.  Idempotent: replaying the same
/// `(position, kind)` leaves replica state unchanged.
#[derive(Clone, Debug, Default, Message)]
pub struct LearnedRequest {
    #[prototk(1, message)]
    pub position: Position,
    #[prototk(2, message)]
    pub kind: EntryKind,
}

#[derive(Clone, Debug, Default, Message)]
pub struct LearnedReply {}

////////////////////////////////////////// Recover / RecoverReply /////////////////////////////////

/// Asks a peer for learned entries in `[from, to]`.
#[derive(Clone, Debug, Default, Message)]
pub struct RecoverRequest {
    #[prototk(1, message)]
    pub from: Position,
    #[prototk(2, message)]
    pub to: Position,
}

#[derive(Clone, Debug, Message)]
pub enum RecoverReply {
    #[prototk(1, message)]
    Ok {
        #[prototk(1, message)]
        entries: Vec<SlotRecord>,
        #[prototk(2, message)]
        begin: Position,
        #[prototk(3, message)]
        end: Position,
    },
    /// `from` is strictly below the replica's `begin`.  Per the design
    /// note in the spec, a replica refuses outright rather than
    /// returning a partial range silently missing its prefix.
    #[prototk(2, message)]
    Truncated {
        #[prototk(1, message)]
        begin: Position,
    },
}

impl Default for RecoverReply {
    fn default() -> Self {
        RecoverReply::Ok {
            entries: Vec::default(),
            begin: Position::default(),
            end: Position::default(),
        }
    }
}

///////////////////////////////////////////// ReplicaService //////////////////////////////////////

service! {
    name = ReplicaService;
    server = ReplicaServer;
    client = ReplicaClient;
    error = Error;

    rpc promise(PromiseRequest) -> PromiseReply;
    rpc write(WriteRequest) -> WriteReply;
    rpc learned(LearnedRequest) -> LearnedReply;
    rpc recover(RecoverRequest) -> RecoverReply;
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_identity_round_trips() {
        for value in [0u64, 1, 2, 42, u64::MAX, u64::MAX - 1] {
            let p = Position::new(value);
            assert_eq!(p, Position::from_identity(p.identity()));
        }
    }

    #[test]
    fn position_identity_is_big_endian() {
        let p = Position::new(1);
        assert_eq!([0, 0, 0, 0, 0, 0, 0, 1], p.identity());
    }

    #[test]
    fn ballot_ordering_is_lexicographic() {
        let a = Ballot::new(1, ReplicaId::new(9));
        let b = Ballot::new(2, ReplicaId::new(1));
        let c = Ballot::new(2, ReplicaId::new(2));
        assert!(a < b);
        assert!(b < c);
        assert!(Ballot::BOTTOM < a);
        assert!(c < Ballot::TOP);
    }

    #[test]
    fn ballot_next_for_supersedes() {
        let b = Ballot::new(5, ReplicaId::new(1));
        let next = b.next_for(ReplicaId::new(2));
        assert!(b < next);
    }

    #[test]
    fn entry_kind_user_visibility() {
        assert!(EntryKind::Append { payload: vec![1] }.is_user_visible());
        assert!(!EntryKind::Nop.is_user_visible());
        assert!(!EntryKind::Truncate {
            to: Position::new(1)
        }
        .is_user_visible());
    }
}
