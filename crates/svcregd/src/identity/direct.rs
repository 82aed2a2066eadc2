//! Direct `/proc` resolution.

use procfs::process::Process;
use tracing::debug;

use super::IdentityResolver;

/// Reads `/proc/<pid>/exe` in-process.
///
/// The process start time is read before and after the link so a pid
/// that exits and gets recycled in between is caught and reported as
/// unknown.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcResolver;

impl ProcResolver {
    pub fn new() -> Self {
        Self
    }
}

impl IdentityResolver for ProcResolver {
    fn resolve(&self, pid: u32) -> String {
        match certified_executable(pid) {
            Some(path) => path,
            None => {
                debug!(pid, "Could not certify executable");
                String::new()
            }
        }
    }
}

fn certified_executable(pid: u32) -> Option<String> {
    let pid = i32::try_from(pid).ok()?;
    let process = Process::new(pid).ok()?;

    let started = process.stat().ok()?.starttime;
    let exe = process.exe().ok()?;
    let still_started = process.stat().ok()?.starttime;
    if started != still_started {
        return None;
    }

    // Newlines cannot travel over the worker channel and are never valid
    // in a recorded executable.
    let path = exe.into_os_string().into_string().ok()?;
    if path.contains('\n') {
        return None;
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolves_own_executable() {
        let resolved = ProcResolver::new().resolve(std::process::id());
        let expected = std::env::current_exe().unwrap();
        assert_eq!(resolved, expected.to_string_lossy());
    }

    #[test]
    fn test_unknown_pid_is_empty() {
        assert_eq!(ProcResolver::new().resolve(u32::MAX), "");
        assert_eq!(ProcResolver::new().resolve(0), "");
    }
}
