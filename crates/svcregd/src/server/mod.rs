//! Event dispatcher for the registration socket.
//!
//! One task owns the registration listener and every client connection.
//! It waits on all of their readiness at once, handles whatever became
//! ready, and goes back to waiting. Commands never await while the
//! registry is locked, and nothing is spawned per connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  DaemonServer::run (one task)                │
//! │                                                              │
//! │  select! { biased;                                           │
//! │     cancelled  ──────────────▶ release all, unlink, Stopped  │
//! │     poll_events ─┐                                           │
//! │  }               │                                           │
//! │                  ▼                                           │
//! │   UnixListener ── Accepted ──▶ Connection::accepted          │
//! │   Connection   ── Readable ──▶ on_readable ──▶ Session ──▶ Registry
//! │   Connection   ── Writable ──▶ flush                         │
//! │                                                              │
//! │   REEXEC ──▶ hand_off: stop listing, quiesce, send_state     │
//! └──────────────────────────────────────────────────────────────┘
//!
//!   ListingService (own task) ── shared quiesce ──▶ Registry::list
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A failing connection is torn down and logged; the server keeps going
//! - A failing handoff drops only the requester and resumes serving

mod connection;
mod credentials;
mod line;
mod listener;
mod session;

pub use connection::{Connection, ConnectionError};
pub use credentials::{enable_passcred, recv_credentials, PeerCredentials};
pub use line::{DecodeError, LineBuffer};
pub use listener::{adopt_listener, bind_listener, remove_socket_file, ListenerRole};
pub use session::{Action, AuthState, Session};

use std::collections::BTreeMap;
use std::io;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use svcreg_protocol::ProtocolVersion;

use crate::config::DaemonConfig;
use crate::handoff::{
    send_state, take_over, ConnectionRecord, ConnectionTransfer, HandoffError, InheritedConnection,
    InheritedState, Snapshot,
};
use crate::identity::IdentityResolver;
use crate::listing::{ListingFacade, ListingService};
use crate::registry::{ConnectionId, Quiesce, Registry};

/// How [`DaemonServer::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// Cancelled; connections released and socket files removed
    Stopped,
    /// State handed to a successor; the process should exit without
    /// touching the socket files
    HandedOff,
}

/// Readiness observed in one wakeup.
#[derive(Debug)]
enum Event {
    Accepted(UnixStream),
    AcceptFailed(io::Error),
    Readable(ConnectionId),
    Writable(ConnectionId),
    Failed(ConnectionId, io::Error),
}

/// The registry daemon's server.
pub struct DaemonServer {
    socket_path: PathBuf,
    listing_path: Option<PathBuf>,
    registration: UnixListener,
    listing: Option<ListingService>,
    connections: BTreeMap<ConnectionId, Connection>,
    next_connection: u64,
    daemon_uid: u32,
    registry: Arc<Registry>,
    quiesce: Arc<Quiesce>,
    resolver: Arc<dyn IdentityResolver>,
    cancel_token: CancellationToken,
}

impl DaemonServer {
    /// Binds fresh sockets as configured.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(
        config: &DaemonConfig,
        registry: Arc<Registry>,
        resolver: Arc<dyn IdentityResolver>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let registration = bind_listener(
            &config.socket_path,
            config.socket_mode,
            ListenerRole::Registration,
        )?;

        let mut server = Self {
            socket_path: config.socket_path.clone(),
            listing_path: None,
            registration,
            listing: None,
            connections: BTreeMap::new(),
            next_connection: 1,
            daemon_uid: nix::unistd::getuid().as_raw(),
            registry,
            quiesce: Arc::new(Quiesce::new()),
            resolver,
            cancel_token,
        };

        if let Some(path) = &config.listing_socket_path {
            let listener = bind_listener(path, config.socket_mode, ListenerRole::Listing)?;
            server.start_listing(listener, path.clone());
        }
        Ok(server)
    }

    /// Takes over the daemon answering on the registration socket, or binds
    /// fresh sockets when there is none.
    ///
    /// A running daemon that refuses the handoff, or whose stream turns out
    /// unusable, is left alone and this server starts empty on fresh
    /// sockets. Only a failure to adopt a state that was fully received is
    /// an error, since the predecessor has already exited by then.
    pub async fn launch(
        config: &DaemonConfig,
        registry: Arc<Registry>,
        resolver: Arc<dyn IdentityResolver>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        if config.takeover && config.socket_path.exists() {
            let path = config.socket_path.clone();
            let received = tokio::task::spawn_blocking(move || take_over(&path))
                .await
                .map_err(io::Error::other)?;

            match received {
                Ok(state) => {
                    info!(
                        version = %state.version,
                        connections = state.connections.len(),
                        entries = state.records.len(),
                        "Took over running daemon"
                    );
                    return Self::from_inherited(state, config, registry, resolver, cancel_token);
                }
                Err(e) => {
                    warn!(
                        socket = %config.socket_path.display(),
                        error = %e,
                        "Takeover failed, binding fresh sockets"
                    );
                }
            }
        }
        Self::bind(config, registry, resolver, cancel_token)
    }

    /// Rebuilds a server from a predecessor's state.
    ///
    /// `registry` should be empty; the inherited entries are restored into
    /// it. Must be called from within a Tokio runtime.
    pub fn from_inherited(
        inherited: InheritedState,
        config: &DaemonConfig,
        registry: Arc<Registry>,
        resolver: Arc<dyn IdentityResolver>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let InheritedState {
            listeners,
            records,
            connections,
            next_connection,
            ..
        } = inherited;

        let mut registration = None;
        let mut listing = None;
        for (role, listener) in listeners {
            let adopted = adopt_listener(listener, role)?;
            match role {
                ListenerRole::Registration => registration = Some(adopted),
                ListenerRole::Listing => listing = Some(adopted),
            }
        }
        let (registration, socket_path) = registration
            .ok_or(HandoffError::MissingListener(ListenerRole::Registration))?;

        registry.restore(records);

        let mut server = Self {
            socket_path: socket_path.unwrap_or_else(|| config.socket_path.clone()),
            listing_path: None,
            registration,
            listing: None,
            connections: BTreeMap::new(),
            next_connection: next_connection.max(1),
            daemon_uid: nix::unistd::getuid().as_raw(),
            registry,
            quiesce: Arc::new(Quiesce::new()),
            resolver,
            cancel_token,
        };

        for inherited in connections {
            let connection = server.restore_connection(inherited)?;
            server.connections.insert(connection.id(), connection);
        }

        match (listing, &config.listing_socket_path) {
            (Some((listener, path)), configured) => {
                let path = path.or_else(|| configured.clone()).unwrap_or_default();
                server.start_listing(listener, path);
            }
            (None, Some(path)) => {
                let listener = bind_listener(path, config.socket_mode, ListenerRole::Listing)?;
                server.start_listing(listener, path.clone());
            }
            (None, None) => {}
        }

        info!(
            connections = server.connections.len(),
            entries = server.registry.len(),
            next_connection = server.next_connection,
            "Resumed from handoff"
        );
        Ok(server)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn listing_socket_path(&self) -> Option<&Path> {
        self.listing_path.as_deref()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Read-only registry access for in-process consumers.
    pub fn facade(&self) -> ListingFacade {
        ListingFacade::new(Arc::clone(&self.registry), Arc::clone(&self.quiesce))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Serves until cancelled or handed off.
    pub async fn run(mut self) -> Result<ServerExit, ServerError> {
        info!(
            socket = %self.socket_path.display(),
            connections = self.connections.len(),
            "Daemon server running"
        );

        loop {
            let events = tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                events = std::future::poll_fn(|cx| self.poll_events(cx)) => events,
            };

            let Some((id, version)) = self.dispatch(events).await else {
                continue;
            };

            match self.hand_off(id, version).await {
                Ok(()) => return Ok(ServerExit::HandedOff),
                Err(e) => {
                    warn!(connection = %id, error = %e, "Handoff failed, continuing to serve");
                }
            }
        }

        self.shutdown().await;
        Ok(ServerExit::Stopped)
    }

    // ------------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------------

    fn poll_events(&self, cx: &mut Context<'_>) -> Poll<Vec<Event>> {
        let mut events = Vec::new();

        match self.registration.poll_accept(cx) {
            Poll::Ready(Ok((stream, _addr))) => events.push(Event::Accepted(stream)),
            Poll::Ready(Err(e)) => events.push(Event::AcceptFailed(e)),
            Poll::Pending => {}
        }

        for (id, connection) in &self.connections {
            match connection.poll_read_ready(cx) {
                Poll::Ready(Ok(())) => events.push(Event::Readable(*id)),
                Poll::Ready(Err(e)) => {
                    events.push(Event::Failed(*id, e));
                    continue;
                }
                Poll::Pending => {}
            }
            if connection.wants_write() {
                match connection.poll_write_ready(cx) {
                    Poll::Ready(Ok(())) => events.push(Event::Writable(*id)),
                    Poll::Ready(Err(e)) => events.push(Event::Failed(*id, e)),
                    Poll::Pending => {}
                }
            }
        }

        if events.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(events)
        }
    }

    /// Handles one batch of events under the shared quiesce lock.
    ///
    /// Returns the connection that asked for a handoff, if any. Once one
    /// has, no further commands run in this batch.
    async fn dispatch(&mut self, events: Vec<Event>) -> Option<(ConnectionId, ProtocolVersion)> {
        let quiesce = Arc::clone(&self.quiesce);
        let _shared = quiesce.shared().await;

        let mut reexec = None;
        for event in events {
            match event {
                Event::Accepted(stream) => self.accept(stream),
                Event::AcceptFailed(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
                Event::Failed(id, e) => self.close(id, &ConnectionError::Io(e)),
                Event::Readable(id) if reexec.is_none() => {
                    if let Some(version) = self.on_readable(id) {
                        reexec = Some((id, version));
                    }
                }
                Event::Writable(id) if reexec.is_none() => self.on_writable(id),
                Event::Readable(_) | Event::Writable(_) => {}
            }
        }
        reexec
    }

    fn accept(&mut self, stream: UnixStream) {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;

        match Connection::accepted(stream, id, self.daemon_uid) {
            Ok(connection) => {
                self.connections.insert(id, connection);
                debug!(connection = %id, active = self.connections.len(), "Accepted connection");
            }
            Err(e) => {
                warn!(connection = %id, error = %e, "Failed to set up connection");
            }
        }
    }

    fn on_readable(&mut self, id: ConnectionId) -> Option<ProtocolVersion> {
        let result = match self.connections.get_mut(&id) {
            Some(connection) => connection.on_readable(&self.registry, self.resolver.as_ref()),
            None => return None,
        };
        match result {
            Ok(reexec) => reexec,
            Err(e) => {
                self.close(id, &e);
                None
            }
        }
    }

    fn on_writable(&mut self, id: ConnectionId) {
        let result = match self.connections.get_mut(&id) {
            Some(connection) => connection.flush(),
            None => return,
        };
        if let Err(e) = result {
            self.close(id, &e);
        }
    }

    /// Tears a connection down and withdraws everything it registered.
    fn close(&mut self, id: ConnectionId, reason: &ConnectionError) {
        let Some(mut connection) = self.connections.remove(&id) else {
            return;
        };
        let released = connection.release(&self.registry);
        match reason {
            ConnectionError::Closed => {
                debug!(connection = %id, released, "Connection closed");
            }
            other => {
                warn!(connection = %id, released, error = %other, "Connection dropped");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Handoff
    // ------------------------------------------------------------------------

    /// Hands everything to the peer on connection `id`.
    ///
    /// On error the requester is gone but every other socket is still
    /// owned here and the listing service is running again.
    async fn hand_off(&mut self, id: ConnectionId, version: ProtocolVersion) -> Result<(), HandoffError> {
        let Some(mut requester) = self.connections.remove(&id) else {
            return Err(HandoffError::Inconsistent(format!(
                "handoff requester {id} vanished"
            )));
        };
        requester.release(&self.registry);
        info!(connection = %id, version = %version, "Handoff requested");

        let listing = match self.listing.take() {
            Some(service) => service.stop().await,
            None => None,
        };

        let quiesce = Arc::clone(&self.quiesce);
        let exclusive = quiesce.exclusive().await;
        let result = self.send_snapshot(requester, listing.as_ref());
        drop(exclusive);

        match result {
            Ok(()) => {
                info!(
                    connection = %id,
                    connections = self.connections.len(),
                    entries = self.registry.len(),
                    "Handoff complete"
                );
                Ok(())
            }
            Err(e) => {
                if let (Some(listener), Some(path)) = (listing, self.listing_path.clone()) {
                    self.start_listing(listener, path);
                }
                Err(e)
            }
        }
    }

    fn send_snapshot(
        &self,
        requester: Connection,
        listing: Option<&UnixListener>,
    ) -> Result<(), HandoffError> {
        let stream = requester.into_std()?;

        let mut listeners = vec![(ListenerRole::Registration, self.registration.as_fd())];
        if let Some(listener) = listing {
            listeners.push((ListenerRole::Listing, listener.as_fd()));
        }

        let connections = self
            .connections
            .values()
            .map(|connection| ConnectionTransfer {
                record: connection_record(connection),
                fd: connection.as_fd(),
            })
            .collect();

        send_state(
            stream,
            Snapshot {
                listeners,
                entries: self.registry.snapshot(),
                connections,
                next_connection: self.next_connection,
            },
        )
    }

    fn restore_connection(&self, inherited: InheritedConnection) -> Result<Connection, ServerError> {
        let InheritedConnection { record, stream } = inherited;
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        if record.auth == AuthState::AwaitingCredentials {
            enable_passcred(&stream)?;
        }

        debug!(connection = %record.id, "Adopted inherited connection");
        let session = Session::restore(
            record.id,
            self.daemon_uid,
            record.auth,
            record.pending,
            record.committed,
        );
        Ok(Connection::restore(
            stream,
            session,
            LineBuffer::from_partial(record.input),
            record.output,
        ))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn start_listing(&mut self, listener: UnixListener, path: PathBuf) {
        self.listing = Some(ListingService::spawn(listener, self.facade()));
        self.listing_path = Some(path);
    }

    async fn shutdown(&mut self) {
        let connections = std::mem::take(&mut self.connections);
        let mut released = 0;
        for (_, mut connection) in connections {
            released += connection.release(&self.registry);
        }

        if let Some(service) = self.listing.take() {
            service.stop().await;
        }

        remove_socket_file(&self.socket_path);
        if let Some(path) = &self.listing_path {
            remove_socket_file(path);
        }

        info!(released, "Server cleanup complete");
    }
}

fn connection_record(connection: &Connection) -> ConnectionRecord {
    let session = connection.session();
    ConnectionRecord {
        id: connection.id(),
        auth: session.auth().clone(),
        input: connection.input().partial().to_vec(),
        output: connection.output().to_vec(),
        pending: session.pending().to_vec(),
        committed: session.committed().clone(),
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Handoff error: {0}")]
    Handoff(#[from] HandoffError),
}
