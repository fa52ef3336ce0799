//! TCP transport, peer group, and coordination-registry glue for synod.
//!
//! Everything in this crate is about getting bytes to and from peers;
//! no Paxos logic lives here.  The replica/coordinator actors in
//! `synod` depend on [wire::TcpClient] through the generic
//! `rpc_pb::Client` trait, so tests can substitute an in-process
//! double without touching this crate.

pub mod coordination;
pub mod group;
pub mod wire;

pub use coordination::{Membership, RegistryError};
pub use group::Group;
pub use wire::{TcpClient, TcpServer};

use biometrics::Collector;

/// Register this crate's biometrics with `collector`.
pub fn register_biometrics(collector: &Collector) {
    group::register_biometrics(collector);
    wire::register_biometrics(collector);
}

//////////////////////////////////////////// indicio /////////////////////////////////////////////

/// The indicio collector this crate logs through.  `synod` shares it so
/// that transport and consensus events interleave in one trace.
pub static LOGGING: indicio::Collector = indicio::Collector::new();
