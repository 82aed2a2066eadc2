//! Listing filters.

use crate::RegistrationEntry;
use serde::{Deserialize, Serialize};

/// Filter for read-only registry listings.
///
/// Each list restricts one column; an empty list places no restriction.
/// An entry matches when it satisfies every non-empty list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub services: Vec<String>,
    pub users: Vec<u32>,
    pub pids: Vec<u32>,
}

impl ListFilter {
    /// Filter that matches every entry.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.services.push(service.into());
        self
    }

    pub fn with_user(mut self, user: u32) -> Self {
        self.users.push(user);
        self
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pids.push(pid);
        self
    }

    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        self.services.is_empty() && self.users.is_empty() && self.pids.is_empty()
    }

    /// Returns true if the entry passes every active restriction.
    #[must_use]
    pub fn matches(&self, entry: &RegistrationEntry) -> bool {
        (self.services.is_empty() || self.services.iter().any(|s| s == entry.service.as_str()))
            && (self.users.is_empty() || self.users.contains(&entry.user))
            && (self.pids.is_empty() || self.pids.contains(&entry.pid))
    }
}
