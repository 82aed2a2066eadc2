//! In-memory service registry.
//!
//! The registry is an ordered multiset of registration entries keyed by
//! `(service, user, sequence)`. Connections never hold references into
//! it: they hold `EntryKey` handles, which stay valid no matter what other
//! connections insert or remove.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  insert_batch / remove   ┌────────────────────────┐
//! │  Event Dispatcher│─────────────────────────▶│        Registry        │
//! │  (per-connection │                          │ RwLock<BTreeMap<       │
//! │   EntryKey sets) │◀─────── EntryKey ────────│   EntryKey, Record>>   │
//! └──────────────────┘                          └───────────▲────────────┘
//!                                                           │ list
//!                                               ┌───────────┴────────────┐
//!                                               │     ListingFacade      │
//!                                               └────────────────────────┘
//! ```
//!
//! Registry locking only protects individual operations. Whole-registry
//! consistency across many operations (the handoff snapshot) is the job
//! of the separate [`Quiesce`] lock.
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - Lock acquisition cannot fail (`parking_lot` locks do not poison)

mod quiesce;
mod store;

pub use quiesce::Quiesce;
pub use store::{ConnectionId, EntryKey, Owner, Registry, RegistryRecord};
