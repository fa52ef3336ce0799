//! The public `Log` handle: constructs a `Replica`, resolves group
//! membership, binds the wire server, and hands out `Reader`/`Writer`
//! values. Exposes no other surface.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use indicio::{clue, ERROR, INFO};

use synod_pb::{Position, ReplicaId, ReplicaServer};

use synod_transport::{Group, TcpServer};

use crate::catchup::CatchupTask;
use crate::reader::Reader;
use crate::replica::{Replica, ReplicaHandle};
use crate::writer::{Writer, DEFAULT_RETRIES};

/// An opaque credential forwarded to a coordination service; never
/// inspected by this crate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthToken(pub String);

/// How a `Log`'s peer group is discovered. `Static` additionally carries
/// each peer's connect string, since the wire transport needs an
/// address the original `Set<PID>` form left to an external resolver.
pub enum Membership {
    Static(BTreeMap<ReplicaId, String>),
    CoordinationService {
        url: String,
        znode: String,
        timeout: Duration,
        auth: Option<AuthToken>,
    },
}

pub struct Config {
    pub quorum: u32,
    pub path: PathBuf,
    pub self_id: ReplicaId,
    pub listen: String,
    pub membership: Membership,
}

/// A handle to one replicated log, owned exclusively by one process.
/// Dropping a `Log` joins its `Replica` actor and catch-up threads.
pub struct Log {
    self_id: ReplicaId,
    local: ReplicaHandle,
    group: Group,
    _replica: Replica,
    _catchup: CatchupTask,
}

impl Log {
    pub fn open(config: Config) -> Result<Self, crate::Error> {
        let (replica, local) = Replica::spawn(config.self_id, config.path).map_err(|err| {
            clue!(crate::LOGGING, ERROR, {
                log_open_storage_failed: { what: err.to_string() },
            });
            crate::Error::StorageCorruption {
                core: zerror_core::ErrorCore::default(),
            }
        })?;

        let server = ReplicaServer::bind(local.clone());
        let listener = TcpServer::bind(&config.listen).map_err(|err| {
            clue!(crate::LOGGING, ERROR, {
                log_open_listen_failed: { what: err.to_string() },
            });
            crate::Error::PeerUnavailable {
                core: zerror_core::ErrorCore::default(),
                peer: config.self_id,
            }
        })?;
        std::thread::spawn(move || {
            let _ = listener.serve(Arc::new(server));
        });

        let group = resolve_group(&config.membership)?;
        let observed_size = group.size() as u32 + 1;
        if observed_size != config.quorum {
            clue!(crate::LOGGING, INFO, {
                log_open_quorum_mismatch: {
                    configured: config.quorum,
                    observed: observed_size,
                },
            });
        }

        let catchup = CatchupTask::spawn(local.clone(), group.clone(), config.self_id);

        Ok(Self {
            self_id: config.self_id,
            local,
            group,
            _replica: replica,
            _catchup: catchup,
        })
    }

    pub fn reader(&self) -> Reader {
        Reader::new(self.local.clone(), self.group.clone())
    }

    pub fn writer(&self, retries: u32) -> Writer {
        Writer::new(self.self_id, self.local.clone(), self.group.clone(), retries)
    }

    pub fn writer_with_default_retries(&self) -> Writer {
        self.writer(DEFAULT_RETRIES)
    }

    pub fn position(identity: [u8; 8]) -> Position {
        Position::from_identity(identity)
    }
}

fn resolve_group(membership: &Membership) -> Result<Group, crate::Error> {
    let resolved = match membership {
        Membership::Static(peers) => {
            synod_transport::Membership::Static(peers.clone()).resolve()?
        }
        Membership::CoordinationService { .. } => {
            synod_transport::Membership::CoordinationService.resolve()?
        }
    };
    Ok(Group::new(resolved))
}
