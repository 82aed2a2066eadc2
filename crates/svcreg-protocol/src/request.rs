//! Requests sent by registration clients.

use std::fmt;

use svcreg_core::{DomainError, Endpoint, ServiceFlags, ServiceName, Tag};
use thiserror::Error;

use crate::version::{ProtocolVersion, VersionError};
use crate::FIELD_SEPARATOR;

/// One command line from a registration client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Stage one entry in the connection's pending batch.
    Svc {
        flags: ServiceFlags,
        service: ServiceName,
        endpoint: Endpoint,
    },

    /// Commit the pending batch under a tag.
    Reg { tag: Tag },

    /// Remove one committed entry of a tag.
    Dereg {
        tag: Tag,
        service: ServiceName,
        endpoint: Endpoint,
    },

    /// Remove every committed entry of a tag.
    Drop { tag: Tag },

    /// Ask the daemon to hand its state over to the requesting process.
    Reexec { version: ProtocolVersion },
}

impl Request {
    pub const SVC: &'static str = "SVC";
    pub const REG: &'static str = "REG";
    pub const DEREG: &'static str = "DEREG";
    pub const DROP: &'static str = "DROP";
    pub const REEXEC: &'static str = "REEXEC";

    /// Parses one line. The trailing `\n` (and an optional `\r`) must
    /// already be stripped.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut fields = line.split(FIELD_SEPARATOR);
        let command = fields.next().unwrap_or_default();
        if command.is_empty() {
            return Err(ParseError::Empty);
        }
        let args: Vec<&str> = fields.collect();

        match command {
            Self::SVC => {
                let [flags, service, endpoint] = expect_fields::<3>(Self::SVC, &args)?;
                Ok(Self::Svc {
                    flags: ServiceFlags::parse(flags)?,
                    service: ServiceName::new(service)?,
                    endpoint: Endpoint::parse(endpoint)?,
                })
            }
            Self::REG => {
                let [tag] = expect_fields::<1>(Self::REG, &args)?;
                Ok(Self::Reg { tag: Tag::new(tag)? })
            }
            Self::DEREG => {
                let [tag, service, endpoint] = expect_fields::<3>(Self::DEREG, &args)?;
                Ok(Self::Dereg {
                    tag: Tag::new(tag)?,
                    service: ServiceName::new(service)?,
                    endpoint: Endpoint::parse(endpoint)?,
                })
            }
            Self::DROP => {
                let [tag] = expect_fields::<1>(Self::DROP, &args)?;
                Ok(Self::Drop { tag: Tag::new(tag)? })
            }
            Self::REEXEC => {
                let [version] = expect_fields::<1>(Self::REEXEC, &args)?;
                Ok(Self::Reexec {
                    version: ProtocolVersion::parse(version)?,
                })
            }
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }

    /// Returns the command keyword.
    pub fn command(&self) -> &'static str {
        match self {
            Self::Svc { .. } => Self::SVC,
            Self::Reg { .. } => Self::REG,
            Self::Dereg { .. } => Self::DEREG,
            Self::Drop { .. } => Self::DROP,
            Self::Reexec { .. } => Self::REEXEC,
        }
    }

    /// Formats the request as a complete wire line, terminator included.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = FIELD_SEPARATOR;
        match self {
            Self::Svc {
                flags,
                service,
                endpoint,
            } => write!(f, "{}{sep}{flags}{sep}{service}{sep}{endpoint}", Self::SVC),
            Self::Reg { tag } => write!(f, "{}{sep}{tag}", Self::REG),
            Self::Dereg {
                tag,
                service,
                endpoint,
            } => write!(f, "{}{sep}{tag}{sep}{service}{sep}{endpoint}", Self::DEREG),
            Self::Drop { tag } => write!(f, "{}{sep}{tag}", Self::DROP),
            Self::Reexec { version } => write!(f, "{}{sep}{version}", Self::REEXEC),
        }
    }
}

fn expect_fields<'a, const N: usize>(
    command: &'static str,
    args: &[&'a str],
) -> Result<[&'a str; N], ParseError> {
    <[&str; N]>::try_from(args).map_err(|_| ParseError::FieldCount {
        command,
        expected: N,
        got: args.len(),
    })
}

/// Errors produced while parsing a request line.
///
/// All of these are recoverable: the daemon answers with a negative
/// response and keeps the connection open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("{command} takes {expected} field(s), got {got}")]
    FieldCount {
        command: &'static str,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    InvalidField(#[from] DomainError),

    #[error(transparent)]
    Version(#[from] VersionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_svc() {
        let req = Request::parse("SVC\tX-\tmail\t25").unwrap();
        match req {
            Request::Svc {
                flags,
                service,
                endpoint,
            } => {
                assert!(flags.exclusive);
                assert_eq!(service.as_str(), "mail");
                assert_eq!(endpoint, Endpoint::Port(25));
            }
            other => panic!("Expected Svc, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_tag_commands() {
        assert_eq!(
            Request::parse("REG\tT1").unwrap(),
            Request::Reg {
                tag: Tag::new("T1").unwrap()
            }
        );
        assert_eq!(
            Request::parse("DROP\tT1").unwrap(),
            Request::Drop {
                tag: Tag::new("T1").unwrap()
            }
        );
        assert!(matches!(
            Request::parse("DEREG\tT1\tmail\t/run/mail.sock").unwrap(),
            Request::Dereg { .. }
        ));
    }

    #[test]
    fn test_parse_reexec() {
        assert_eq!(
            Request::parse("REEXEC\t1.0").unwrap(),
            Request::Reexec {
                version: ProtocolVersion::new(1, 0)
            }
        );
        assert!(matches!(
            Request::parse("REEXEC\tlatest"),
            Err(ParseError::Version(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Request::parse(""), Err(ParseError::Empty));
        assert!(matches!(
            Request::parse("LIST"),
            Err(ParseError::UnknownCommand(c)) if c == "LIST"
        ));
        assert!(matches!(
            Request::parse("REG"),
            Err(ParseError::FieldCount { expected: 1, got: 0, .. })
        ));
        assert!(matches!(
            Request::parse("SVC\t-\tmail"),
            Err(ParseError::FieldCount { expected: 3, got: 2, .. })
        ));
        assert!(matches!(
            Request::parse("SVC\t-\t\t25"),
            Err(ParseError::InvalidField(DomainError::InvalidServiceName { .. }))
        ));
        assert!(matches!(
            Request::parse("SVC\t-\tmail\tnowhere"),
            Err(ParseError::InvalidField(DomainError::InvalidEndpoint { .. }))
        ));
    }

    #[test]
    fn test_to_line_is_parseable() {
        let req = Request::Svc {
            flags: ServiceFlags {
                exclusive: true,
                record_executable: true,
            },
            service: ServiceName::new("ipp").unwrap(),
            endpoint: Endpoint::Wildcard,
        };
        let line = req.to_line();
        assert_eq!(line, "SVC\tXP-\tipp\t*\n");
        assert_eq!(Request::parse(line.trim_end_matches('\n')).unwrap(), req);
    }
}
