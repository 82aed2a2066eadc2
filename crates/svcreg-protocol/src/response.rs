//! Responses written by the daemon.
//!
//! Every response is a single line starting with `+` (success) or `-`
//! (failure).

use std::fmt;

/// Daemon reply to one request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Command accepted
    Ok,
    /// Pending batch committed
    Registered,
    /// Pending batch rejected (conflicting exclusive registration)
    RegistrationFailed,
    /// Peer may not issue this command
    PermissionDenied,
    /// `REEXEC` named an incompatible handoff version
    UnsupportedVersion,
    /// Command keyword not recognised
    UnknownCommand,
    /// Command recognised but its fields are malformed
    BadRequest(String),
}

impl Response {
    /// Returns true for `+` responses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Registered)
    }

    /// Formats the response as a complete wire line, terminator included.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }

    /// Parses a response line (terminator already stripped).
    ///
    /// Returns `None` if the line is not a response.
    pub fn parse(line: &str) -> Option<Self> {
        match line {
            "+Ok" => Some(Self::Ok),
            "+Registered" => Some(Self::Registered),
            "-Registration failed" => Some(Self::RegistrationFailed),
            "-Permission denied" => Some(Self::PermissionDenied),
            "-Unsupported version" => Some(Self::UnsupportedVersion),
            "-Unknown command" => Some(Self::UnknownCommand),
            other => other
                .strip_prefix("-Bad request: ")
                .map(|reason| Self::BadRequest(reason.to_string())),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("+Ok"),
            Self::Registered => f.write_str("+Registered"),
            Self::RegistrationFailed => f.write_str("-Registration failed"),
            Self::PermissionDenied => f.write_str("-Permission denied"),
            Self::UnsupportedVersion => f.write_str("-Unsupported version"),
            Self::UnknownCommand => f.write_str("-Unknown command"),
            Self::BadRequest(reason) => {
                // A reason must never terminate the line early.
                let reason: String = reason
                    .chars()
                    .map(|c| if c.is_control() { ' ' } else { c })
                    .collect();
                write!(f, "-Bad request: {reason}")
            }
        }
    }
}
