//! Client error types.

use std::io;

use svcreg_protocol::Response;
use thiserror::Error;

/// Errors returned by registry and listing clients.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Socket-level failure (connect, read, write)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Daemon closed the connection before answering
    #[error("Connection closed by daemon")]
    Closed,

    /// Daemon answered with a line that is not a response
    #[error("Unexpected reply from daemon: {0:?}")]
    UnexpectedReply(String),

    /// Daemon answered with a negative response
    #[error("Daemon rejected request: {0}")]
    Rejected(Response),

    /// Bytes from the daemon were still buffered when the socket was released
    #[error("Unread daemon output on connection")]
    UnreadOutput,
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
