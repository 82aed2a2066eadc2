//! Authenticated peer identity.

use serde::{Deserialize, Serialize};

/// Identity of a connected peer, established from kernel-supplied credentials.
///
/// `uid` and `pid` come from the credential control message and can be
/// trusted; `executable` is best-effort and empty when the resolver could
/// not certify the pid mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub uid: u32,
    pub pid: u32,
    pub executable: String,
}

impl PeerIdentity {
    pub fn new(uid: u32, pid: u32, executable: impl Into<String>) -> Self {
        Self {
            uid,
            pid,
            executable: executable.into(),
        }
    }
}
