//! Peer executable resolution.
//!
//! After the credential handshake the daemon knows a peer's pid, and asks
//! an [`IdentityResolver`] which executable that pid is running. Resolvers
//! must only answer when they can certify the mapping; anything uncertain
//! (process gone, pid recycled mid-lookup, permission denied) yields an
//! empty string and the peer simply cannot record its executable.

mod direct;
mod worker;

pub use direct::ProcResolver;
pub use worker::{run_resolver_worker, WorkerResolver};

use std::sync::Arc;

use crate::config::ResolverKind;

/// Maps a pid to a certified executable path.
pub trait IdentityResolver: Send + Sync {
    /// Returns the executable of `pid`, or `""` if it cannot be certified.
    fn resolve(&self, pid: u32) -> String;
}

/// Resolver that never knows anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullResolver;

impl IdentityResolver for NullResolver {
    fn resolve(&self, _pid: u32) -> String {
        String::new()
    }
}

/// Builds the resolver selected in the configuration.
///
/// `worker_program` is the binary to spawn for [`ResolverKind::Worker`];
/// it is started with a single `resolve-worker` argument.
pub fn build_resolver(
    kind: ResolverKind,
    worker_program: impl Into<std::path::PathBuf>,
) -> Arc<dyn IdentityResolver> {
    match kind {
        ResolverKind::Direct => Arc::new(ProcResolver::new()),
        ResolverKind::Worker => Arc::new(WorkerResolver::new(
            worker_program,
            vec![WorkerResolver::SUBCOMMAND.to_string()],
        )),
    }
}
