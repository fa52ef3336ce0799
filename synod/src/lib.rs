//! synod: a replicated, crash-safe, append-only log built on
//! single-decree-per-slot Paxos.
//!
//! A [Log] owns one [replica::Replica] actor and a
//! [synod_transport::Group] of peers. Clients read through a
//! [reader::Reader] and write through a [writer::Writer], which
//! transparently elects and re-elects a [coordinator::Coordinator]
//! as needed.

pub mod catchup;
pub mod coordinator;
pub mod error;
pub mod log;
pub mod reader;
pub mod replica;
pub mod writer;

pub use error::Error;
pub use log::{AuthToken, Config, Log, Membership};
pub use reader::Reader;
pub use synod_pb::{Ballot, Entry, EntryKind, Position, Record, ReplicaId};
pub use writer::Writer;

use biometrics::Collector;

/// Register every submodule's biometrics, including the crates this one
/// depends on, so embedding processes get one call that wires up the
/// whole stack.
pub fn register_biometrics(collector: &Collector) {
    synod_storage::register_biometrics(collector);
    synod_transport::register_biometrics(collector);
    replica::register_biometrics(collector);
    coordinator::register_biometrics(collector);
    reader::register_biometrics(collector);
    catchup::register_biometrics(collector);
}

//////////////////////////////////////////// indicio /////////////////////////////////////////////

/// The indicio collector this crate logs through.
pub static LOGGING: indicio::Collector = indicio::Collector::new();
