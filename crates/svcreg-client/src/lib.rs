//! svcreg Client - Talking to the registry daemon
//!
//! Provides an explicit client object for the registration socket and a
//! one-shot client for the listing socket. Nothing here is process-wide:
//! every registration lives exactly as long as its `RegistryClient`.
//!
//! ```rust,ignore
//! use svcreg_client::RegistryClient;
//! use svcreg_core::{Endpoint, ServiceFlags, ServiceName, Tag};
//!
//! let mut client = RegistryClient::connect("/tmp/svcreg.sock")?;
//! client.stage(ServiceFlags::default(), ServiceName::new("mail")?, Endpoint::Port(25))?;
//! client.register(&Tag::new("T1")?)?;
//! ```
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

pub mod client;
pub mod credentials;
pub mod error;
pub mod listing;

pub use client::RegistryClient;
pub use credentials::send_credentials;
pub use error::{ClientError, ClientResult};
pub use listing::ListingClient;
