//! Per-connection protocol state machine.
//!
//! A session starts in `AwaitingCredentials`. Once the kernel-supplied
//! credentials have been received it is `Authenticated` and processes
//! commands until the connection goes away, at which point
//! [`Session::release`] withdraws everything it committed.
//!
//! Registrations are two-phase: `SVC` only stages an entry in the pending
//! batch; `REG` commits the whole batch atomically under a tag.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use svcreg_core::{PeerIdentity, RegistrationEntry, Tag};
use svcreg_protocol::{ProtocolVersion, Request, Response};

use crate::registry::{ConnectionId, EntryKey, Owner, Registry};

/// Authentication progress of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthState {
    AwaitingCredentials,
    Authenticated(PeerIdentity),
}

/// What the dispatcher must do after a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Queue this response line.
    Reply(Response),
    /// Hand the daemon over to this peer; no textual reply is sent.
    Reexec(ProtocolVersion),
}

/// Protocol state for one connection.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    daemon_uid: u32,
    auth: AuthState,
    pending: Vec<RegistrationEntry>,
    committed: BTreeMap<Tag, Vec<EntryKey>>,
    released: bool,
}

impl Session {
    /// Creates a session for a freshly accepted connection.
    ///
    /// `daemon_uid` is the uid a peer needs to be allowed `REEXEC`.
    pub fn new(id: ConnectionId, daemon_uid: u32) -> Self {
        Self {
            id,
            daemon_uid,
            auth: AuthState::AwaitingCredentials,
            pending: Vec::new(),
            committed: BTreeMap::new(),
            released: false,
        }
    }

    /// Rebuilds a session carried over by a handoff.
    pub fn restore(
        id: ConnectionId,
        daemon_uid: u32,
        auth: AuthState,
        pending: Vec<RegistrationEntry>,
        committed: BTreeMap<Tag, Vec<EntryKey>>,
    ) -> Self {
        Self {
            id,
            daemon_uid,
            auth,
            pending,
            committed,
            released: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn pending(&self) -> &[RegistrationEntry] {
        &self.pending
    }

    pub fn committed(&self) -> &BTreeMap<Tag, Vec<EntryKey>> {
        &self.committed
    }

    pub fn peer(&self) -> Option<&PeerIdentity> {
        match &self.auth {
            AuthState::Authenticated(peer) => Some(peer),
            AuthState::AwaitingCredentials => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.peer().is_some()
    }

    /// Records the peer identity obtained from the credential handshake.
    pub fn authenticate(&mut self, peer: PeerIdentity) {
        debug!(
            connection = %self.id,
            uid = peer.uid,
            pid = peer.pid,
            executable = %peer.executable,
            "Peer authenticated"
        );
        self.auth = AuthState::Authenticated(peer);
    }

    /// Executes one parsed request.
    pub fn handle_request(&mut self, request: Request, registry: &Registry) -> Action {
        let Some(peer) = self.peer().cloned() else {
            return Action::Reply(Response::PermissionDenied);
        };

        match request {
            Request::Svc {
                flags,
                service,
                endpoint,
            } => {
                let executable = if flags.record_executable {
                    peer.executable.clone()
                } else {
                    String::new()
                };
                self.pending.push(RegistrationEntry {
                    service,
                    user: peer.uid,
                    pid: peer.pid,
                    executable,
                    endpoint,
                    exclusive: flags.exclusive,
                });
                Action::Reply(Response::Ok)
            }

            Request::Reg { tag } => {
                let batch = std::mem::take(&mut self.pending);
                let size = batch.len();
                let owner = Owner::new(self.id, tag.clone());
                match registry.insert_batch(batch, &owner) {
                    Some(keys) => {
                        debug!(connection = %self.id, tag = %tag, entries = size, "Batch registered");
                        if !keys.is_empty() {
                            self.committed.entry(tag).or_default().extend(keys);
                        }
                        Action::Reply(Response::Registered)
                    }
                    None => Action::Reply(Response::RegistrationFailed),
                }
            }

            Request::Dereg {
                tag,
                service,
                endpoint,
            } => {
                if let Some(handles) = self.committed.get_mut(&tag) {
                    if let Some(removed) = registry.remove(handles, &service, &endpoint) {
                        handles.retain(|key| key != &removed);
                        debug!(connection = %self.id, tag = %tag, service = %service, "Entry deregistered");
                    }
                    if handles.is_empty() {
                        self.committed.remove(&tag);
                    }
                }
                Action::Reply(Response::Ok)
            }

            Request::Drop { tag } => {
                if let Some(handles) = self.committed.remove(&tag) {
                    let removed = registry.remove_all(&handles);
                    debug!(connection = %self.id, tag = %tag, removed, "Tag dropped");
                }
                Action::Reply(Response::Ok)
            }

            Request::Reexec { version } => {
                if peer.uid != self.daemon_uid {
                    debug!(connection = %self.id, uid = peer.uid, "REEXEC from unprivileged peer");
                    return Action::Reply(Response::PermissionDenied);
                }
                if let Err(e) = ProtocolVersion::CURRENT.check_handoff(&version) {
                    debug!(connection = %self.id, error = %e, "REEXEC with unsupported version");
                    return Action::Reply(Response::UnsupportedVersion);
                }
                Action::Reexec(version)
            }
        }
    }

    /// Withdraws every committed entry and discards the pending batch.
    ///
    /// Runs its effect exactly once; later calls return 0.
    pub fn release(&mut self, registry: &Registry) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        self.pending.clear();

        let handles: Vec<EntryKey> = std::mem::take(&mut self.committed)
            .into_values()
            .flatten()
            .collect();
        registry.remove_all(&handles)
    }
}
