//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors raised while validating registry domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Service name is empty or contains control characters
    #[error("Invalid service name {value:?}: {reason}")]
    InvalidServiceName { value: String, reason: &'static str },

    /// Endpoint is neither a port, an absolute path, nor the wildcard
    #[error("Invalid endpoint {value:?} (expected port, absolute path or '*')")]
    InvalidEndpoint { value: String },

    /// Tag is empty or contains control characters
    #[error("Invalid tag {value:?}")]
    InvalidTag { value: String },

    /// Unknown character in a flags field
    #[error("Invalid flag {flag:?} in {value:?}")]
    InvalidFlag { value: String, flag: char },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
