//! Listing socket request.
//!
//! A listing client sends one line `LIST` followed by zero or more
//! `key=value` fields (`service=`, `user=`, `pid=`), and the daemon answers
//! with CSV and closes the connection.

use std::fmt;

use svcreg_core::ListFilter;

use crate::request::ParseError;
use crate::FIELD_SEPARATOR;

/// Read-only query against the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub filter: ListFilter,
}

impl ListRequest {
    pub const COMMAND: &'static str = "LIST";

    pub fn new(filter: ListFilter) -> Self {
        Self { filter }
    }

    /// Parses a listing line (terminator already stripped).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut fields = line.split(FIELD_SEPARATOR);
        match fields.next() {
            Some(Self::COMMAND) => {}
            Some("") | None => return Err(ParseError::Empty),
            Some(other) => return Err(ParseError::UnknownCommand(other.to_string())),
        }

        let mut filter = ListFilter::all();
        for field in fields.filter(|f| !f.is_empty()) {
            let (key, value) = field.split_once('=').ok_or_else(|| bad_field(field))?;
            match key {
                "service" => filter.services.push(value.to_string()),
                "user" => filter
                    .users
                    .push(value.parse().map_err(|_| bad_field(field))?),
                "pid" => filter.pids.push(value.parse().map_err(|_| bad_field(field))?),
                _ => return Err(bad_field(field)),
            }
        }

        Ok(Self { filter })
    }

    /// Formats the request as a complete wire line, terminator included.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for ListRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = FIELD_SEPARATOR;
        f.write_str(Self::COMMAND)?;
        for service in &self.filter.services {
            write!(f, "{sep}service={service}")?;
        }
        for user in &self.filter.users {
            write!(f, "{sep}user={user}")?;
        }
        for pid in &self.filter.pids {
            write!(f, "{sep}pid={pid}")?;
        }
        Ok(())
    }
}

fn bad_field(field: &str) -> ParseError {
    ParseError::InvalidField(svcreg_core::DomainError::ParseError {
        field: "listing filter".to_string(),
        reason: format!("unrecognised field {field:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unfiltered() {
        let req = ListRequest::parse("LIST").unwrap();
        assert!(req.filter.is_unrestricted());
    }

    #[test]
    fn test_parse_filters() {
        let req = ListRequest::parse("LIST\tservice=mail\tuser=1000\tpid=42\tservice=ipp").unwrap();
        assert_eq!(req.filter.services, vec!["mail", "ipp"]);
        assert_eq!(req.filter.users, vec![1000]);
        assert_eq!(req.filter.pids, vec![42]);
    }

    #[test]
    fn test_parse_rejects_bad_fields() {
        assert!(ListRequest::parse("LIST\tuser=root").is_err());
        assert!(ListRequest::parse("LIST\tcolour=blue").is_err());
        assert!(ListRequest::parse("LIST\tservice").is_err());
        assert!(matches!(
            ListRequest::parse("SVC"),
            Err(ParseError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_line_round_trips() {
        let req = ListRequest::new(ListFilter::all().with_service("mail").with_pid(7));
        let line = req.to_line();
        assert_eq!(line, "LIST\tservice=mail\tpid=7\n");
        assert_eq!(ListRequest::parse(line.trim_end()).unwrap(), req);
    }
}
