//! Splitting the inbound byte stream into protocol lines.

use svcreg_protocol::{LINE_TERMINATOR, MAX_LINE_LEN};
use thiserror::Error;

/// Accumulates inbound bytes and yields complete lines.
///
/// Bytes after the last terminator are kept as a partial line until more
/// input arrives; that remainder is exactly what a handoff must carry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a buffer from previously unconsumed bytes.
    pub fn from_partial(bytes: Vec<u8>) -> Self {
        Self { buf: bytes }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed as a line.
    pub fn partial(&self) -> &[u8] {
        &self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Removes and returns the next complete line without its terminator
    /// (a trailing `\r` is dropped too).
    ///
    /// Returns `Ok(None)` when no complete line is buffered yet.
    pub fn next_line(&mut self) -> Result<Option<String>, DecodeError> {
        let Some(end) = self.buf.iter().position(|&b| b == LINE_TERMINATOR) else {
            if self.buf.len() > MAX_LINE_LEN {
                return Err(DecodeError::LineTooLong { len: self.buf.len() });
            }
            return Ok(None);
        };
        if end > MAX_LINE_LEN {
            return Err(DecodeError::LineTooLong { len: end });
        }

        let mut line: Vec<u8> = self.buf.drain(..=end).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        String::from_utf8(line)
            .map(Some)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}

/// The inbound byte stream cannot be turned into lines.
///
/// Unlike a malformed command, this is not recoverable: the connection
/// is closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("line exceeds {max} bytes ({len} buffered)", max = MAX_LINE_LEN)]
    LineTooLong { len: usize },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}
