//! Listening sockets.

use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::net::UnixListener;
use tracing::{debug, info};

use super::credentials::enable_passcred;
use super::ServerError;

/// What a listening socket is for. Carried with the descriptor in a
/// handoff so the successor puts it back in the right place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerRole {
    /// Registration protocol, served by the dispatcher
    Registration,
    /// Read-only listing, served by its own accept task
    Listing,
}

impl fmt::Display for ListenerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registration => f.write_str("registration"),
            Self::Listing => f.write_str("listing"),
        }
    }
}

/// Binds a listening socket at `path`, replacing a stale socket file.
///
/// Registration sockets get `SO_PASSCRED` so the credential handshake
/// works on every accepted connection.
pub fn bind_listener(path: &Path, mode: u32, role: ListenerRole) -> Result<UnixListener, ServerError> {
    let setup = |e: std::io::Error| ServerError::SocketSetup {
        path: path.to_path_buf(),
        error: e.to_string(),
    };

    if path.exists() {
        debug!(socket = %path.display(), "Removing stale socket file");
        fs::remove_file(path).map_err(setup)?;
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(setup)?;
        }
    }

    let listener = UnixListener::bind(path).map_err(setup)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(setup)?;
    if role == ListenerRole::Registration {
        enable_passcred(&listener).map_err(setup)?;
    }

    info!(socket = %path.display(), role = %role, "Listening");
    Ok(listener)
}

/// Adopts an inherited listening socket into the runtime.
pub fn adopt_listener(
    listener: std::os::unix::net::UnixListener,
    role: ListenerRole,
) -> Result<(UnixListener, Option<PathBuf>), ServerError> {
    let setup = |e: std::io::Error| ServerError::SocketSetup {
        path: PathBuf::from(format!("<inherited {role} listener>")),
        error: e.to_string(),
    };

    listener.set_nonblocking(true).map_err(setup)?;
    let path = listener
        .local_addr()
        .ok()
        .and_then(|addr| addr.as_pathname().map(Path::to_path_buf));
    let listener = UnixListener::from_std(listener).map_err(setup)?;
    if role == ListenerRole::Registration {
        enable_passcred(&listener).map_err(setup)?;
    }

    info!(
        socket = %path.as_deref().map(|p| p.display().to_string()).unwrap_or_default(),
        role = %role,
        "Adopted inherited listener"
    );
    Ok((listener, path))
}

/// Removes a socket file, logging instead of failing.
pub fn remove_socket_file(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[tokio::test]
    async fn test_bind_replaces_stale_file_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("reg.sock");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"stale").unwrap();

        let _listener = bind_listener(&path, 0o600, ListenerRole::Registration).unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_adopt_reports_bound_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.sock");
        let std_listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let (_listener, adopted) = adopt_listener(std_listener, ListenerRole::Listing).unwrap();
        assert_eq!(adopted, Some(path));
    }

    #[test]
    fn test_role_serde_names() {
        assert_eq!(
            serde_json::to_string(&ListenerRole::Listing).unwrap(),
            "\"listing\""
        );
    }
}
