//! Listing socket client.

use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use svcreg_core::ListFilter;
use svcreg_protocol::{ListRequest, Response};

use crate::error::{ClientError, ClientResult};

/// Default time allowed for a listing round trip.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One-shot client for the read-only listing socket.
#[derive(Debug, Clone)]
pub struct ListingClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ListingClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Runs one query and returns the CSV document the daemon produced.
    pub fn query(&self, filter: &ListFilter) -> ClientResult<String> {
        let mut stream = UnixStream::connect(&self.socket_path)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let request = ListRequest::new(filter.clone());
        stream.write_all(request.to_line().as_bytes())?;
        stream.shutdown(Shutdown::Write)?;

        let mut body = String::new();
        stream.read_to_string(&mut body)?;
        if body.is_empty() {
            return Err(ClientError::Closed);
        }
        if body.starts_with('-') {
            let line = body.trim_end_matches(['\n', '\r']);
            return Err(match Response::parse(line) {
                Some(response) => ClientError::Rejected(response),
                None => ClientError::UnexpectedReply(line.to_string()),
            });
        }
        Ok(body)
    }
}
