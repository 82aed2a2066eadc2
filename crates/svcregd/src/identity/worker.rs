//! Out-of-process resolution.
//!
//! The worker is a child process answering `"<pid>\n"` with
//! `"<executable>\n"` over its stdin/stdout. The pipe pair carries one
//! request at a time, so access is serialized by a mutex. A worker that
//! dies is replaced on the next request; one that does not answer within
//! the query timeout is killed and the lookup yields `""`.

use std::io::{self, BufRead, Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::IdentityResolver;

/// How long one lookup may take before the worker is given up on
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest answer line accepted from a worker
const MAX_ANSWER_LEN: usize = 8192;

/// Resolver backed by a long-lived worker process.
pub struct WorkerResolver {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    worker: Mutex<Option<Worker>>,
}

impl WorkerResolver {
    /// Daemon subcommand that runs [`run_resolver_worker`].
    pub const SUBCOMMAND: &'static str = "resolve-worker";

    /// Creates a resolver; the worker is spawned lazily on first use.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: QUERY_TIMEOUT,
            worker: Mutex::new(None),
        }
    }

    /// Overrides [`QUERY_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl IdentityResolver for WorkerResolver {
    fn resolve(&self, pid: u32) -> String {
        let mut slot = self.worker.lock();

        // One retry covers a worker that died since the previous request.
        for _ in 0..2 {
            if slot.is_none() {
                match Worker::spawn(&self.program, &self.args) {
                    Ok(worker) => *slot = Some(worker),
                    Err(e) => {
                        warn!(program = %self.program.display(), error = %e, "Failed to spawn resolver worker");
                        return String::new();
                    }
                }
            }

            if let Some(worker) = slot.as_mut() {
                match worker.query(pid, Instant::now() + self.timeout) {
                    Ok(executable) => return executable,
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                        warn!(pid, timeout = ?self.timeout, "Resolver worker hung, killing it");
                        *slot = None;
                        return String::new();
                    }
                    Err(e) => {
                        debug!(pid, error = %e, "Resolver worker failed, respawning");
                        *slot = None;
                    }
                }
            }
        }

        String::new()
    }
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    /// Bytes read past the last answer
    pending: Vec<u8>,
}

impl Worker {
    fn spawn(program: &Path, args: &[String]) -> io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        match (stdin, stdout) {
            (Some(stdin), Some(stdout)) => Ok(Self {
                child,
                stdin,
                stdout,
                pending: Vec::new(),
            }),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "worker pipes unavailable"))
            }
        }
    }

    fn query(&mut self, pid: u32, deadline: Instant) -> io::Result<String> {
        writeln!(self.stdin, "{pid}")?;
        self.stdin.flush()?;

        loop {
            if let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.pending.drain(..=end).collect();
                return Ok(String::from_utf8_lossy(&line[..end]).into_owned());
            }
            if self.pending.len() > MAX_ANSWER_LEN {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "worker answer too long"));
            }

            self.wait_readable(deadline)?;
            let mut buf = [0u8; 1024];
            let n = self.stdout.read(&mut buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "worker exited"));
            }
            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    /// Waits until stdout has data or has hung up, or `deadline` passes.
    fn wait_readable(&self, deadline: Instant) -> io::Result<()> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "worker did not answer"));
            }
            let millis = u16::try_from(remaining.as_millis().max(1)).unwrap_or(u16::MAX);

            let mut fds = [PollFd::new(self.stdout.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) => continue,
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Serves resolver requests read from `input`, one line each, until EOF.
///
/// Lines that are not a pid get an empty answer; the worker never gives
/// up on a bad request.
pub fn run_resolver_worker<R, W>(
    input: R,
    mut output: W,
    resolver: &dyn IdentityResolver,
) -> io::Result<()>
where
    R: BufRead,
    W: Write,
{
    for line in input.lines() {
        let line = line?;
        let executable = match line.trim().parse::<u32>() {
            Ok(pid) => resolver.resolve(pid),
            Err(_) => String::new(),
        };
        let executable = if executable.contains('\n') {
            String::new()
        } else {
            executable
        };
        writeln!(output, "{executable}")?;
        output.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct Canned;

    impl IdentityResolver for Canned {
        fn resolve(&self, pid: u32) -> String {
            if pid == 7 {
                "/usr/bin/seven".to_string()
            } else {
                String::new()
            }
        }
    }

    fn shell_worker(script: &str) -> WorkerResolver {
        WorkerResolver::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_worker_loop_answers_each_line() {
        let input = Cursor::new("7\n8\nnot-a-pid\n");
        let mut output = Vec::new();
        run_resolver_worker(input, &mut output, &Canned).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "/usr/bin/seven\n\n\n");
    }

    #[test]
    fn test_worker_resolver_round_trip() {
        let resolver = shell_worker("while read pid; do echo /bin/exe$pid; done");
        assert_eq!(resolver.resolve(12), "/bin/exe12");
        assert_eq!(resolver.resolve(13), "/bin/exe13");
    }

    #[test]
    fn test_dead_worker_is_respawned() {
        let resolver = shell_worker("read pid; echo /bin/once$pid");
        assert_eq!(resolver.resolve(1), "/bin/once1");
        assert_eq!(resolver.resolve(2), "/bin/once2");
    }

    #[test]
    fn test_hung_worker_is_killed_and_replaced() {
        // Hangs on pid 1 only; a fresh worker answers normally.
        let resolver = shell_worker(
            "read pid; [ \"$pid\" = 1 ] && exec sleep 1000; \
             echo /bin/exe$pid; while read pid; do echo /bin/exe$pid; done",
        )
        .with_timeout(Duration::from_millis(200));

        let start = Instant::now();
        assert_eq!(resolver.resolve(1), "");
        assert!(start.elapsed() < Duration::from_secs(5));

        assert_eq!(resolver.resolve(2), "/bin/exe2");
        assert_eq!(resolver.resolve(3), "/bin/exe3");
    }

    #[test]
    fn test_silent_worker_never_blocks_past_timeout() {
        let resolver = shell_worker("exec sleep 1000").with_timeout(Duration::from_millis(100));
        for pid in [1, 2] {
            let start = Instant::now();
            assert_eq!(resolver.resolve(pid), "");
            assert!(start.elapsed() < Duration::from_secs(5));
        }
    }

    #[test]
    fn test_missing_worker_program_degrades_to_empty() {
        let resolver = WorkerResolver::new("/nonexistent/svcregd", Vec::new());
        assert_eq!(resolver.resolve(1), "");
    }
}
