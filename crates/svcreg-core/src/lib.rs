//! svcreg Core - Shared types for the host-local service registry
//!
//! This crate provides the domain types shared between the daemon
//! (svcregd), the client library, and the wire protocol.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod entry;
pub mod error;
pub mod filter;
pub mod peer;

// Re-exports for convenience
pub use entry::{Endpoint, RegistrationEntry, ServiceFlags, ServiceName, Tag};
pub use error::{DomainError, DomainResult};
pub use filter::ListFilter;
pub use peer::PeerIdentity;
