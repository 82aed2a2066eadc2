//! svcreg daemon - host-local service registry
//!
//! Local processes register the services they offer over a Unix socket;
//! the kernel vouches for who they are. Registrations live exactly as long
//! as the connection that made them. A new daemon binary can take over a
//! running one without dropping a single client.
//!
//! - `registry` - Entry store and the quiesce lock
//! - `server` - Single-task event dispatcher and the connection protocol
//! - `handoff` - State and descriptor transfer to a successor daemon
//! - `identity` - Peer pid to executable resolution
//! - `listing` - Read-only registry queries and the listing socket
//! - `config` - Daemon settings
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        svcregd daemon                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  DaemonServer   │────▶│          Registry           │    │
//! │  │ (one task, all  │     │  (entries + owner labels)   │    │
//! │  │  connections)   │     └──────────────▲──────────────┘    │
//! │  └────────┬────────┘                    │ list (shared)     │
//! │           │ REEXEC                      │                   │
//! │           ▼                  ┌──────────┴──────────────┐    │
//! │  ┌─────────────────┐         │     ListingService      │    │
//! │  │  handoff        │         │  (own task, CSV socket) │    │
//! │  │ (exclusive)     │         └─────────────────────────┘    │
//! │  └────────┬────────┘                                        │
//! │           │ sockets + state                                 │
//! │           ▼                                                 │
//! │     successor svcregd                                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Lock acquisition cannot fail (`parking_lot` locks do not poison)

pub mod config;
pub mod handoff;
pub mod identity;
pub mod listing;
pub mod registry;
pub mod server;
