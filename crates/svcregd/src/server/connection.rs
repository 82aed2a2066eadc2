//! One client connection as driven by the dispatcher.
//!
//! A `Connection` owns the socket, the protocol [`Session`], the partial
//! input line and any output not yet accepted by the kernel. It never
//! awaits: the dispatcher calls [`Connection::on_readable`] and
//! [`Connection::flush`] only when the socket has signalled readiness.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every failure is a `ConnectionError`, which the dispatcher turns into
//!   a teardown

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::task::{Context, Poll};

use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::{debug, trace};

use svcreg_core::PeerIdentity;
use svcreg_protocol::{ParseError, ProtocolVersion, Request, Response};

use super::credentials::{enable_passcred, recv_credentials};
use super::line::{DecodeError, LineBuffer};
use super::session::{Action, Session};
use crate::identity::IdentityResolver;
use crate::registry::{ConnectionId, Registry};

/// Bytes read per `try_read` call
const READ_CHUNK: usize = 4096;

/// Reads per readiness event before yielding to other connections
const MAX_READS_PER_EVENT: usize = 16;

/// Queued output beyond this means the peer stopped reading (1 MiB)
const MAX_PENDING_OUTPUT: usize = 1_048_576;

/// A registration-socket client.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    session: Session,
    input: LineBuffer,
    output: Vec<u8>,
}

impl Connection {
    /// Wraps a freshly accepted stream.
    pub fn accepted(
        stream: UnixStream,
        id: ConnectionId,
        daemon_uid: u32,
    ) -> Result<Self, ConnectionError> {
        enable_passcred(&stream).map_err(ConnectionError::Credentials)?;
        Ok(Self {
            stream,
            session: Session::new(id, daemon_uid),
            input: LineBuffer::new(),
            output: Vec::new(),
        })
    }

    /// Reassembles a connection carried over by a handoff.
    pub fn restore(stream: UnixStream, session: Session, input: LineBuffer, output: Vec<u8>) -> Self {
        Self {
            stream,
            session,
            input,
            output,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.session.id()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn input(&self) -> &LineBuffer {
        &self.input
    }

    /// Output queued but not yet written.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    pub fn poll_read_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_read_ready(cx)
    }

    pub fn wants_write(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn poll_write_ready(&self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.poll_write_ready(cx)
    }

    /// Handles read readiness: authenticates if needed, reads what is
    /// available and executes every complete line.
    ///
    /// Returns the requested version if a `REEXEC` was accepted; lines
    /// after it are left unprocessed. EOF is reported as
    /// [`ConnectionError::Closed`] after the lines that preceded it ran.
    pub fn on_readable(
        &mut self,
        registry: &Registry,
        resolver: &dyn IdentityResolver,
    ) -> Result<Option<ProtocolVersion>, ConnectionError> {
        if !self.session.is_authenticated() && !self.authenticate(resolver)? {
            return Ok(None);
        }

        let eof = self.fill_input()?;
        let reexec = self.process_lines(registry)?;
        if reexec.is_some() {
            return Ok(reexec);
        }
        if eof {
            // A half-closed peer may still read its replies.
            let _ = self.flush();
            return Err(ConnectionError::Closed);
        }
        self.flush()?;
        Ok(None)
    }

    /// Writes as much queued output as the socket accepts.
    pub fn flush(&mut self) -> Result<(), ConnectionError> {
        while !self.output.is_empty() {
            match self.stream.try_write(&self.output) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => {
                    self.output.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Withdraws the connection's registrations. Idempotent.
    pub fn release(&mut self, registry: &Registry) -> usize {
        self.session.release(registry)
    }

    /// Detaches the socket from the runtime, for the handoff requester.
    pub fn into_std(self) -> io::Result<std::os::unix::net::UnixStream> {
        self.stream.into_std()
    }

    /// Returns `Ok(false)` if the credential message has not arrived yet.
    fn authenticate(&mut self, resolver: &dyn IdentityResolver) -> Result<bool, ConnectionError> {
        let fd = self.stream.as_raw_fd();
        match self.stream.try_io(Interest::READABLE, || recv_credentials(fd)) {
            Ok(creds) => {
                let executable = resolver.resolve(creds.pid);
                self.session
                    .authenticate(PeerIdentity::new(creds.uid, creds.pid, executable));
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(ConnectionError::Closed),
            Err(e) => Err(ConnectionError::Credentials(e)),
        }
    }

    /// Returns true on EOF.
    fn fill_input(&mut self) -> Result<bool, ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        for _ in 0..MAX_READS_PER_EVENT {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.input.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    fn process_lines(
        &mut self,
        registry: &Registry,
    ) -> Result<Option<ProtocolVersion>, ConnectionError> {
        while let Some(line) = self.input.next_line()? {
            let action = match Request::parse(&line) {
                Ok(request) => {
                    trace!(connection = %self.id(), command = request.command(), "Request");
                    self.session.handle_request(request, registry)
                }
                Err(ParseError::UnknownCommand(command)) => {
                    debug!(connection = %self.id(), command = %command, "Unknown command");
                    Action::Reply(Response::UnknownCommand)
                }
                Err(e) => {
                    debug!(connection = %self.id(), error = %e, "Malformed request");
                    Action::Reply(Response::BadRequest(e.to_string()))
                }
            };

            match action {
                Action::Reply(response) => self.queue(&response)?,
                Action::Reexec(version) => return Ok(Some(version)),
            }
        }
        Ok(None)
    }

    fn queue(&mut self, response: &Response) -> Result<(), ConnectionError> {
        self.output.extend_from_slice(response.to_line().as_bytes());
        if self.output.len() > MAX_PENDING_OUTPUT {
            return Err(ConnectionError::OutputOverflow {
                len: self.output.len(),
            });
        }
        Ok(())
    }
}

/// Reasons a connection is torn down.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Credential handshake failed: {0}")]
    Credentials(#[source] io::Error),

    #[error("Undecodable input: {0}")]
    Decode(#[from] DecodeError),

    #[error("Peer is not reading responses ({len} bytes queued)")]
    OutputOverflow { len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::Duration;

    use svcreg_client::send_credentials;
    use svcreg_core::ListFilter;

    use crate::identity::NullResolver;

    const DAEMON_UID: u32 = u32::MAX;

    /// Returns the daemon side of a connected pair plus the raw client end.
    fn pair() -> (Connection, std::os::unix::net::UnixStream) {
        let (client, server) = std::os::unix::net::UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let server = UnixStream::from_std(server).unwrap();
        let conn = Connection::accepted(server, ConnectionId(1), DAEMON_UID).unwrap();
        (conn, client)
    }

    async fn drive(conn: &mut Connection, registry: &Registry) -> Result<Option<ProtocolVersion>, ConnectionError> {
        std::future::poll_fn(|cx| conn.poll_read_ready(cx)).await?;
        conn.on_readable(registry, &NullResolver)
    }

    fn read_reply(client: &mut std::os::unix::net::UnixStream, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_authenticates_then_serves_lines() {
        let registry = Registry::new();
        let (mut conn, mut client) = pair();

        send_credentials(&client).unwrap();
        client.write_all(b"SVC\t-\tmail\t25\nREG\tT1\n").unwrap();

        while !conn.session().is_authenticated() || registry.is_empty() {
            drive(&mut conn, &registry).await.unwrap();
        }
        read_reply(&mut client, "+Ok\n+Registered\n");
        assert_eq!(registry.list(&ListFilter::all()).len(), 1);
    }

    #[tokio::test]
    async fn test_protocol_errors_keep_connection() {
        let registry = Registry::new();
        let (mut conn, mut client) = pair();

        send_credentials(&client).unwrap();
        client.write_all(b"HELLO\nREG\nSVC\t-\tmail\tnowhere\n").unwrap();
        drive(&mut conn, &registry).await.unwrap();

        let mut replies = String::new();
        while replies.matches('\n').count() < 3 {
            let mut buf = [0u8; 256];
            let n = client.read(&mut buf).unwrap();
            replies.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        let lines: Vec<&str> = replies.lines().collect();
        assert_eq!(lines[0], "-Unknown command");
        assert!(lines[1].starts_with("-Bad request: "));
        assert!(lines[2].starts_with("-Bad request: "));
    }

    #[tokio::test]
    async fn test_partial_line_is_retained() {
        let registry = Registry::new();
        let (mut conn, client) = pair();

        send_credentials(&client).unwrap();
        (&client).write_all(b"SVC\t-\tma").unwrap();
        while conn.input().partial().is_empty() {
            drive(&mut conn, &registry).await.unwrap();
        }
        assert_eq!(conn.input().partial(), b"SVC\t-\tma");
        assert!(conn.session().pending().is_empty());
    }

    #[tokio::test]
    async fn test_eof_runs_preceding_lines_then_closes() {
        let registry = Registry::new();
        let (mut conn, mut client) = pair();

        send_credentials(&client).unwrap();
        client.write_all(b"SVC\t-\tmail\t25\n").unwrap();
        drop(client);

        let mut result = drive(&mut conn, &registry).await;
        while matches!(result, Ok(None)) {
            result = drive(&mut conn, &registry).await;
        }
        assert!(matches!(result, Err(ConnectionError::Closed)));
        assert_eq!(conn.session().pending().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_closes() {
        let registry = Registry::new();
        let (mut conn, mut client) = pair();

        client.write_all(b"SVC\t-\tmail\t25\n").unwrap();
        let result = drive(&mut conn, &registry).await;
        assert!(matches!(result, Err(ConnectionError::Credentials(_))));
    }

    #[tokio::test]
    async fn test_reexec_stops_processing() {
        let registry = Registry::new();
        let (client, server) = std::os::unix::net::UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let daemon_uid = nix::unistd::getuid().as_raw();
        let mut conn =
            Connection::accepted(UnixStream::from_std(server).unwrap(), ConnectionId(9), daemon_uid)
                .unwrap();

        send_credentials(&client).unwrap();
        (&client).write_all(b"REEXEC\t1.0\nSVC\t-\tmail\t25\n").unwrap();

        let mut result = drive(&mut conn, &registry).await.unwrap();
        while result.is_none() {
            result = drive(&mut conn, &registry).await.unwrap();
        }
        assert_eq!(result, Some(ProtocolVersion::CURRENT));
        assert!(conn.session().pending().is_empty());
        assert!(conn.output().is_empty());
    }
}
