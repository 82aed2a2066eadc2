//! Registration client.
//!
//! The daemon ties every registration to the connection that made it, so
//! a `RegistryClient` must be kept alive for as long as its services
//! should stay registered. Dropping it (or the process exiting) withdraws
//! them.

use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use svcreg_core::{Endpoint, ServiceFlags, ServiceName, Tag};
use svcreg_protocol::{ProtocolVersion, Request, Response, MAX_LINE_LEN};

use crate::credentials::send_credentials;
use crate::error::{ClientError, ClientResult};

// ============================================================================
// Registry Client
// ============================================================================

/// Connection to the daemon's registration socket.
///
/// Requests are answered strictly in order, one response line per
/// request, so the client is a simple request/response loop.
pub struct RegistryClient {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl RegistryClient {
    /// Connects to the registration socket and performs the credential
    /// handshake.
    pub fn connect(socket_path: impl AsRef<Path>) -> ClientResult<Self> {
        let stream = UnixStream::connect(socket_path.as_ref())?;
        debug!(socket = %socket_path.as_ref().display(), "Connected to registry daemon");
        Self::from_stream(stream)
    }

    /// Wraps an already connected stream, sending credentials first.
    pub fn from_stream(stream: UnixStream) -> ClientResult<Self> {
        send_credentials(&stream)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    /// Bounds how long a single response may take.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> ClientResult<()> {
        self.stream.set_read_timeout(timeout)?;
        self.stream.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Sends one request and returns the daemon's response, positive or
    /// negative.
    pub fn request(&mut self, request: &Request) -> ClientResult<Response> {
        self.stream.write_all(request.to_line().as_bytes())?;
        self.read_response()
    }

    /// Stages one entry in the connection's pending batch (`SVC`).
    pub fn stage(
        &mut self,
        flags: ServiceFlags,
        service: ServiceName,
        endpoint: Endpoint,
    ) -> ClientResult<()> {
        let request = Request::Svc {
            flags,
            service,
            endpoint,
        };
        self.expect_ok(&request)
    }

    /// Commits the pending batch under `tag` (`REG`).
    ///
    /// Returns `false` when the daemon refused the batch because it
    /// conflicts with an exclusive registration. The pending batch is
    /// cleared either way.
    pub fn register(&mut self, tag: &Tag) -> ClientResult<bool> {
        let request = Request::Reg { tag: tag.clone() };
        match self.request(&request)? {
            Response::Registered => Ok(true),
            Response::RegistrationFailed => Ok(false),
            other => Err(ClientError::Rejected(other)),
        }
    }

    /// Withdraws one entry previously committed under `tag` (`DEREG`).
    pub fn deregister(
        &mut self,
        tag: &Tag,
        service: ServiceName,
        endpoint: Endpoint,
    ) -> ClientResult<()> {
        let request = Request::Dereg {
            tag: tag.clone(),
            service,
            endpoint,
        };
        self.expect_ok(&request)
    }

    /// Withdraws every entry committed under `tag` (`DROP`).
    pub fn drop_tag(&mut self, tag: &Tag) -> ClientResult<()> {
        self.expect_ok(&Request::Drop { tag: tag.clone() })
    }

    /// Sends `REEXEC` and gives back the raw socket for the handoff stream.
    ///
    /// The daemon answers either with a negative response line or with
    /// the handoff preamble; the caller reads whichever comes.
    pub fn into_reexec(mut self, version: ProtocolVersion) -> ClientResult<UnixStream> {
        if !self.reader.buffer().is_empty() {
            return Err(ClientError::UnreadOutput);
        }
        let request = Request::Reexec { version };
        self.stream.write_all(request.to_line().as_bytes())?;
        Ok(self.stream)
    }

    fn expect_ok(&mut self, request: &Request) -> ClientResult<()> {
        match self.request(request)? {
            Response::Ok => Ok(()),
            other => Err(ClientError::Rejected(other)),
        }
    }

    fn read_response(&mut self) -> ClientResult<Response> {
        let mut line = String::new();
        let read = (&mut self.reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_line(&mut line)?;
        if read == 0 {
            return Err(ClientError::Closed);
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        Response::parse(trimmed).ok_or_else(|| ClientError::UnexpectedReply(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_writes_svc_line_and_reads_ok() {
        let (client_end, mut server_end) = UnixStream::pair().unwrap();
        let mut client = RegistryClient::from_stream(client_end).unwrap();

        server_end.write_all(b"+Ok\n").unwrap();
        client
            .stage(
                ServiceFlags::default(),
                ServiceName::new("mail").unwrap(),
                Endpoint::Port(25),
            )
            .unwrap();

        let mut received = [0u8; 15];
        server_end.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"\0SVC\t-\tmail\t25\n");
    }

    #[test]
    fn test_register_maps_failure_to_false() {
        let (client_end, mut server_end) = UnixStream::pair().unwrap();
        let mut client = RegistryClient::from_stream(client_end).unwrap();

        server_end.write_all(b"-Registration failed\n").unwrap();
        assert!(!client.register(&Tag::new("T1").unwrap()).unwrap());
    }

    #[test]
    fn test_negative_response_is_rejection() {
        let (client_end, mut server_end) = UnixStream::pair().unwrap();
        let mut client = RegistryClient::from_stream(client_end).unwrap();

        server_end.write_all(b"-Unknown command\n").unwrap();
        let err = client.drop_tag(&Tag::new("T1").unwrap()).unwrap_err();
        assert!(matches!(err, ClientError::Rejected(Response::UnknownCommand)));
    }

    #[test]
    fn test_closed_connection() {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        let mut client = RegistryClient::from_stream(client_end).unwrap();
        drop(server_end);

        let err = client.drop_tag(&Tag::new("T1").unwrap()).unwrap_err();
        assert!(matches!(err, ClientError::Closed | ClientError::Io(_)));
    }
}
