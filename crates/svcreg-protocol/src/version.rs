//! Protocol versioning for graceful restarts.
//!
//! A successor daemon names the handoff format it understands in its
//! `REEXEC` request; the running daemon only hands over state when the
//! versions are compatible.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Version of the handoff stream exchanged on `REEXEC`.
///
/// Uses `major.minor`:
/// - Major version bump: stream layout changed, incompatible
/// - Minor version bump: records added that older readers may skip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version spoken by this build.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parses a version string like "1.0".
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidFormat(s.to_string());

        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        let major = major.parse::<u16>().map_err(|_| invalid())?;
        let minor = minor.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self { major, minor })
    }

    /// Returns true if a daemon speaking `self` can hand off to a successor
    /// requesting `requested`.
    ///
    /// Majors must match; the successor must understand at least every
    /// record this daemon writes, so its minor may not be older.
    pub fn can_hand_off_to(&self, requested: &ProtocolVersion) -> bool {
        self.major == requested.major && requested.minor >= self.minor
    }

    /// Checks compatibility, returning a descriptive error on mismatch.
    pub fn check_handoff(&self, requested: &ProtocolVersion) -> Result<(), VersionError> {
        if self.can_hand_off_to(requested) {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                got: requested.to_string(),
                expected: self.to_string(),
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Incompatible handoff version: got {got}, expected {expected}")]
    Incompatible { got: String, expected: String },
}
