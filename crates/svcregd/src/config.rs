//! Daemon configuration.
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file, environment variables, then command-line flags (applied by the
//! binary on top of what this module returns).
//!
//! ```toml
//! socket_path = "/run/svcreg.sock"
//! listing_socket_path = "/run/svcreg-list.sock"
//! socket_mode = 0o666
//! resolver = "worker"
//! takeover = true
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default registration socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/svcreg.sock";

/// Default listing socket path
pub const DEFAULT_LISTING_SOCKET_PATH: &str = "/tmp/svcreg-list.sock";

/// Environment variable overriding the registration socket path
pub const SOCKET_ENV: &str = "SVCREG_SOCKET";

/// Environment variable overriding the listing socket path
/// (an empty value disables the listing socket)
pub const LISTING_SOCKET_ENV: &str = "SVCREG_LIST_SOCKET";

/// How peer executables are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverKind {
    /// Read `/proc` in the daemon process
    #[default]
    Direct,
    /// Ask a `resolve-worker` child process
    Worker,
}

/// Daemon settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Registration socket
    pub socket_path: PathBuf,

    /// Listing socket; `None` disables it
    pub listing_socket_path: Option<PathBuf>,

    /// Permission bits applied to both socket files
    pub socket_mode: u32,

    pub resolver: ResolverKind,

    /// Take over from a running daemon instead of binding fresh sockets
    pub takeover: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            listing_socket_path: Some(PathBuf::from(DEFAULT_LISTING_SOCKET_PATH)),
            socket_mode: 0o666,
            resolver: ResolverKind::Direct,
            takeover: true,
        }
    }
}

impl DaemonConfig {
    /// Loads defaults, overlays `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parses a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "Loading daemon config");
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies environment overrides looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup(SOCKET_ENV).filter(|s| !s.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(listing) = lookup(LISTING_SOCKET_ENV) {
            self.listing_socket_path = if listing.is_empty() {
                None
            } else {
                Some(PathBuf::from(listing))
            };
        }
    }
}

/// Errors loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config from {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
