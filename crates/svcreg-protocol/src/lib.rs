//! svcreg Protocol - Line protocol for daemon communication
//!
//! Registration clients speak ASCII lines with tab-separated fields,
//! each terminated by `\n`. This crate provides request/response types,
//! their parsing and formatting, and the version used to negotiate a
//! graceful-restart handoff. It performs no I/O.

pub mod listing;
pub mod request;
pub mod response;
pub mod version;

pub use listing::ListRequest;
pub use request::{ParseError, Request};
pub use response::Response;
pub use version::{ProtocolVersion, VersionError};

/// Separator between fields of a protocol line.
pub const FIELD_SEPARATOR: char = '\t';

/// Terminator of every protocol line.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Maximum accepted line length in bytes, terminator excluded.
pub const MAX_LINE_LEN: usize = 64 * 1024;
