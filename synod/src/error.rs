//! The public error type returned across `Log`/`Reader`/`Writer`.

use synod_pb::{Ballot, Position};

use zerror_core::ErrorCore;

/// Every failure mode named in the API surface.  `StorageCorruption` is
/// never constructed by normal control flow — a corrupt record aborts
/// the process from `synod_storage` directly — but the variant exists
/// so callers matching exhaustively have something to name.
#[derive(zerror_derive::Z)]
pub enum Error {
    Truncated { core: ErrorCore, begin: Position },
    NotYetLearned { core: ErrorCore, end: Position },
    InvalidPosition { core: ErrorCore, requested: Position },
    Timeout { core: ErrorCore },
    CoordinatorLost { core: ErrorCore, higher: Ballot },
    StorageCorruption { core: ErrorCore },
    PeerUnavailable { core: ErrorCore, peer: synod_pb::ReplicaId },
    UnsupportedRegistry { core: ErrorCore, requested: String },
}

impl std::error::Error for Error {}

impl From<synod_storage::Error> for Error {
    fn from(err: synod_storage::Error) -> Self {
        match err {
            synod_storage::Error::Truncated { core, begin } => Error::Truncated { core, begin },
            synod_storage::Error::NotYetLearned { core, end } => {
                Error::NotYetLearned { core, end }
            }
            synod_storage::Error::Io { core, .. } => Error::StorageCorruption { core },
        }
    }
}

impl From<synod_transport::RegistryError> for Error {
    fn from(err: synod_transport::RegistryError) -> Self {
        match err {
            synod_transport::RegistryError::UnsupportedRegistry { core, value } => {
                Error::UnsupportedRegistry {
                    core,
                    requested: value,
                }
            }
        }
    }
}

impl From<synod_pb::Error> for Error {
    fn from(err: synod_pb::Error) -> Self {
        Error::PeerUnavailable {
            core: err.core().clone(),
            peer: synod_pb::ReplicaId::BOTTOM,
        }
    }
}
