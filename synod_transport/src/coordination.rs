//! Membership resolution: a static peer list, or (in tests only) a
//! coordination-service stand-in gated by environment variables.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use indicio::{clue, WARNING};

use synod_pb::ReplicaId;

use zerror_core::ErrorCore;

use crate::wire::TcpClient;
use crate::LOGGING;

const ENV_REGISTRY: &str = "SYNOD_REGISTRY";
const ENV_REGISTRY_STRICT: &str = "SYNOD_REGISTRY_STRICT";

/// How many times an empty view is retried before it is accepted as the
/// resolved membership, and how long to wait between attempts.
const EMPTY_VIEW_RETRIES: u32 = 3;
const EMPTY_VIEW_RETRY_DELAY: Duration = Duration::from_millis(20);

///////////////////////////////////////////// RegistryError //////////////////////////////////////

#[derive(zerror_derive::Z)]
pub enum RegistryError {
    UnsupportedRegistry { core: ErrorCore, value: String },
}

impl std::error::Error for RegistryError {}

/////////////////////////////////////////////// Membership ///////////////////////////////////////

/// How a `Group`'s members are discovered.
pub enum Membership {
    /// A fixed, closed set of peers known at startup.
    Static(BTreeMap<ReplicaId, String>),
    /// Resolved through an external coordination service.  Outside of
    /// `SYNOD_REGISTRY=in_memory` test mode, this currently has nothing
    /// to resolve against and behaves like an empty `Static` set.
    CoordinationService,
}

impl Membership {
    /// Resolve this membership into connected clients, honoring the
    /// `SYNOD_REGISTRY`/`SYNOD_REGISTRY_STRICT` environment variables
    /// documented for the coordination-service path.
    pub fn resolve(&self) -> Result<BTreeMap<ReplicaId, Arc<TcpClient>>, RegistryError> {
        match self {
            Membership::Static(peers) => Ok(connect_all(peers)),
            Membership::CoordinationService => resolve_coordination_service(),
        }
    }
}

fn connect_all(peers: &BTreeMap<ReplicaId, String>) -> BTreeMap<ReplicaId, Arc<TcpClient>> {
    peers
        .iter()
        .map(|(&id, addr)| (id, Arc::new(TcpClient::new(addr.clone()))))
        .collect()
}

fn resolve_coordination_service() -> Result<BTreeMap<ReplicaId, Arc<TcpClient>>, RegistryError> {
    let strict = std::env::var(ENV_REGISTRY_STRICT)
        .map(|v| v == "true")
        .unwrap_or(false);
    let registry = std::env::var(ENV_REGISTRY).unwrap_or_default();
    if registry == "in_memory" {
        return Ok(poll_in_memory_registry());
    }
    if strict {
        return Err(RegistryError::UnsupportedRegistry {
            core: ErrorCore::default(),
            value: registry,
        });
    }
    clue!(LOGGING, WARNING, {
        coordination_registry_unavailable: {
            fallback: "static membership",
            requested: registry,
        },
    });
    Ok(BTreeMap::new())
}

/// Polls the in-memory registry stand-in up to `EMPTY_VIEW_RETRIES`
/// times before accepting an empty view, per the policy of treating a
/// momentarily empty membership as transient rather than redrawing
/// quorum to zero on the first look.
///
/// This stand-in has no external process behind it, so every poll is
/// empty and these retries only spend a bounded amount of time before
/// giving up; a real coordination-service client would have a chance
/// to observe a populated view on a later attempt. Re-resolving on an
/// already-running `Log` after a later membership change (spec.md's
/// change-notification stream) is not implemented — `Group` is built
/// once at `Log::open` and is not refreshed; wiring an actual
/// coordination-service client is explicitly out of scope.
fn poll_in_memory_registry() -> BTreeMap<ReplicaId, Arc<TcpClient>> {
    for attempt in 0..EMPTY_VIEW_RETRIES {
        let view = BTreeMap::new();
        if !view.is_empty() {
            return view;
        }
        if attempt + 1 < EMPTY_VIEW_RETRIES {
            std::thread::sleep(EMPTY_VIEW_RETRY_DELAY);
        }
    }
    clue!(LOGGING, WARNING, {
        coordination_registry_empty_after_retries: {
            registry: "in_memory",
            attempts: EMPTY_VIEW_RETRIES,
        },
    });
    BTreeMap::new()
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_membership_connects_without_dialing() {
        let mut peers = BTreeMap::new();
        peers.insert(ReplicaId::new(1), "127.0.0.1:0".to_string());
        let membership = Membership::Static(peers);
        let resolved = membership.resolve().unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn strict_registry_without_in_memory_is_an_error() {
        std::env::set_var(ENV_REGISTRY, "zookeeper");
        std::env::set_var(ENV_REGISTRY_STRICT, "true");
        let result = Membership::CoordinationService.resolve();
        std::env::remove_var(ENV_REGISTRY);
        std::env::remove_var(ENV_REGISTRY_STRICT);
        assert!(matches!(
            result,
            Err(RegistryError::UnsupportedRegistry { .. })
        ));
    }

    #[test]
    fn in_memory_registry_reports_empty_view() {
        std::env::set_var(ENV_REGISTRY, "in_memory");
        let resolved = Membership::CoordinationService.resolve().unwrap();
        std::env::remove_var(ENV_REGISTRY);
        assert!(resolved.is_empty());
    }
}
