//! Registration entities and value objects.

use crate::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Symbolic name a service is registered under (e.g. "mail", "ipp").
///
/// Non-empty and free of control characters, so it can never break the
/// tab-separated wire format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceName(String);

impl ServiceName {
    /// Validates and wraps a service name.
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(DomainError::InvalidServiceName {
                value: name,
                reason: "empty",
            });
        }
        if name.chars().any(char::is_control) {
            return Err(DomainError::InvalidServiceName {
                value: name,
                reason: "contains control characters",
            });
        }
        Ok(Self(name))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ServiceName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ServiceName> for String {
    fn from(name: ServiceName) -> Self {
        name.0
    }
}

impl FromStr for ServiceName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Opaque client-chosen identifier grouping a batch of registrations.
///
/// Tags are scoped to the connection that created them: two connections
/// using the same tag string never touch each other's entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tag(String);

impl Tag {
    /// Validates and wraps a tag.
    pub fn new(tag: impl Into<String>) -> DomainResult<Self> {
        let tag = tag.into();
        if tag.is_empty() || tag.chars().any(char::is_control) {
            return Err(DomainError::InvalidTag { value: tag });
        }
        Ok(Self(tag))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Tag {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Tag> for String {
    fn from(tag: Tag) -> Self {
        tag.0
    }
}

impl FromStr for Tag {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// Address a service can be reached at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
    /// TCP port on the local host
    Port(u16),
    /// Filesystem socket path (always absolute)
    Path(String),
    /// Wildcard registration ("*")
    Wildcard,
}

impl Endpoint {
    /// Parses the wire form: decimal port, absolute path, or `*`.
    pub fn parse(s: &str) -> DomainResult<Self> {
        let invalid = || DomainError::InvalidEndpoint {
            value: s.to_string(),
        };

        if s == "*" {
            return Ok(Self::Wildcard);
        }
        if s.starts_with('/') {
            if s.chars().any(char::is_control) {
                return Err(invalid());
            }
            return Ok(Self::Path(s.to_string()));
        }
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return match s.parse::<u16>() {
                Ok(port) if port != 0 => Ok(Self::Port(port)),
                _ => Err(invalid()),
            };
        }
        Err(invalid())
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Wildcard)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(port) => write!(f, "{port}"),
            Self::Path(path) => f.write_str(path),
            Self::Wildcard => f.write_str("*"),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

impl FromStr for Endpoint {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Flags
// ============================================================================

/// Per-entry flags carried by the `SVC` command.
///
/// Wire form is a short string of flag letters, padded with `-`:
/// `X` marks the entry exclusive, `P` records the caller's executable.
/// `"-"` means no flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceFlags {
    pub exclusive: bool,
    pub record_executable: bool,
}

impl ServiceFlags {
    pub const EXCLUSIVE: char = 'X';
    pub const RECORD_EXECUTABLE: char = 'P';
    pub const PADDING: char = '-';

    /// Parses a flags field. Unknown letters are rejected.
    pub fn parse(s: &str) -> DomainResult<Self> {
        let mut flags = Self::default();
        for c in s.chars() {
            match c {
                Self::EXCLUSIVE => flags.exclusive = true,
                Self::RECORD_EXECUTABLE => flags.record_executable = true,
                Self::PADDING => {}
                other => {
                    return Err(DomainError::InvalidFlag {
                        value: s.to_string(),
                        flag: other,
                    })
                }
            }
        }
        Ok(flags)
    }
}

impl fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exclusive {
            write!(f, "{}", Self::EXCLUSIVE)?;
        }
        if self.record_executable {
            write!(f, "{}", Self::RECORD_EXECUTABLE)?;
        }
        write!(f, "{}", Self::PADDING)
    }
}

impl FromStr for ServiceFlags {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Registration Entry
// ============================================================================

/// One registration: a service name bound to an endpoint by a local process.
///
/// Identity for ordering and conflict checks is `(service, user)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEntry {
    pub service: ServiceName,
    /// Real uid of the registering peer
    pub user: u32,
    /// Pid of the registering peer
    pub pid: u32,
    /// Executable path of the registering peer; empty when unknown or not requested
    pub executable: String,
    pub endpoint: Endpoint,
    pub exclusive: bool,
}

impl RegistrationEntry {
    /// Returns true if both entries share the `(service, user)` identity.
    #[must_use]
    pub fn same_identity(&self, other: &RegistrationEntry) -> bool {
        self.user == other.user && self.service == other.service
    }

    /// Returns true if the two entries cannot coexist in the registry.
    ///
    /// The endpoint is not part of the key: two non-exclusive entries for
    /// the same service and endpoint are allowed.
    #[must_use]
    pub fn conflicts_with(&self, other: &RegistrationEntry) -> bool {
        self.same_identity(other) && (self.exclusive || other.exclusive)
    }

    /// Returns true if this entry records a (non-empty) executable path.
    #[must_use]
    pub fn has_executable(&self) -> bool {
        !self.executable.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(service: &str, user: u32, endpoint: &str, exclusive: bool) -> RegistrationEntry {
        RegistrationEntry {
            service: ServiceName::new(service).unwrap(),
            user,
            pid: 100,
            executable: String::new(),
            endpoint: Endpoint::parse(endpoint).unwrap(),
            exclusive,
        }
    }

    #[test]
    fn test_service_name_validation() {
        assert!(ServiceName::new("mail").is_ok());
        assert!(ServiceName::new("").is_err());
        assert!(ServiceName::new("bad\tname").is_err());
        assert!(ServiceName::new("bad\nname").is_err());
    }

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(Endpoint::parse("25").unwrap(), Endpoint::Port(25));
        assert_eq!(Endpoint::parse("*").unwrap(), Endpoint::Wildcard);
        assert_eq!(
            Endpoint::parse("/run/cups.sock").unwrap(),
            Endpoint::Path("/run/cups.sock".to_string())
        );
        assert!(Endpoint::parse("0").is_err());
        assert!(Endpoint::parse("70000").is_err());
        assert!(Endpoint::parse("relative.sock").is_err());
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("-1").is_err());
    }

    #[test]
    fn test_endpoint_display_matches_wire_form() {
        for wire in ["25", "*", "/tmp/x.sock"] {
            assert_eq!(Endpoint::parse(wire).unwrap().to_string(), wire);
        }
    }

    #[test]
    fn test_flags_parse() {
        let flags = ServiceFlags::parse("X-").unwrap();
        assert!(flags.exclusive);
        assert!(!flags.record_executable);

        let flags = ServiceFlags::parse("-").unwrap();
        assert_eq!(flags, ServiceFlags::default());

        let flags = ServiceFlags::parse("XP").unwrap();
        assert!(flags.exclusive && flags.record_executable);

        assert!(matches!(
            ServiceFlags::parse("Xq"),
            Err(DomainError::InvalidFlag { flag: 'q', .. })
        ));
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(ServiceFlags::default().to_string(), "-");
        let flags = ServiceFlags {
            exclusive: true,
            record_executable: false,
        };
        assert_eq!(flags.to_string(), "X-");
    }

    #[test]
    fn test_conflicts_require_same_identity_and_exclusive() {
        let a = entry("mail", 1000, "25", true);
        let b = entry("mail", 1000, "26", false);
        let other_user = entry("mail", 1001, "27", true);
        let shared = entry("mail", 1000, "25", false);

        assert!(a.conflicts_with(&b));
        assert!(b.conflicts_with(&a));
        assert!(!a.conflicts_with(&other_user));
        assert!(!b.conflicts_with(&shared));
    }

    #[test]
    fn test_entry_serde_rejects_invalid_service() {
        let json = r#"{"service":"","user":1,"pid":2,"executable":"","endpoint":"25","exclusive":false}"#;
        assert!(serde_json::from_str::<RegistrationEntry>(json).is_err());
    }
}
