//! svcreg daemon - host-local service registry
//!
//! Runs the registry daemon. Starting a new daemon while one is running
//! takes the running one over: sockets, registrations and live client
//! connections move to the new process and the old one exits.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground), or upgrade a running one in place
//! svcregd start
//!
//! # Start the daemon (background/daemonized)
//! svcregd start -d
//!
//! # Stop the daemon
//! svcregd stop
//!
//! # Check daemon status
//! svcregd status
//! ```

use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use svcregd::config::DaemonConfig;
use svcregd::identity::{build_resolver, run_resolver_worker, ProcResolver};
use svcregd::registry::Registry;
use svcregd::server::{DaemonServer, ServerExit};

/// How long `stop` waits for the daemon to exit
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// svcreg daemon - host-local service registry
#[derive(Parser, Debug)]
#[command(name = "svcregd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon, taking over a running one if present
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Registration socket path
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Listing socket path
        #[arg(long)]
        listing_socket: Option<PathBuf>,

        /// Never take over a running daemon
        #[arg(long)]
        no_takeover: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Answer pid lookups on stdin (spawned by the daemon itself)
    #[command(hide = true)]
    ResolveWorker,
}

// ============================================================================
// Process Bookkeeping
// ============================================================================

/// Directory holding the PID file and the daemonized log.
fn state_dir() -> PathBuf {
    let base = dirs::state_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("svcreg")
}

/// The `svcregd.pid` file naming the process that currently serves.
///
/// After a takeover the successor rewrites it, so a predecessor only ever
/// removes the file while it still names itself.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn new() -> Self {
        Self::at(state_dir().join("svcregd.pid"))
    }

    fn at(path: PathBuf) -> Self {
        Self { path }
    }

    fn read(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }

    fn claim(&self) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        fs::write(&self.path, process::id().to_string())
            .with_context(|| format!("Cannot write {}", self.path.display()))
    }

    fn release(&self) {
        if self.read() == Some(process::id()) {
            let _ = fs::remove_file(&self.path);
        }
    }

    /// Pid of the live daemon, clearing a file left behind by a dead one.
    fn live_daemon(&self) -> Option<u32> {
        let pid = self.read()?;
        if process_alive(pid) {
            return Some(pid);
        }
        let _ = fs::remove_file(&self.path);
        None
    }
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

fn send_sigterm(pid: u32) -> Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
        return Err(io::Error::last_os_error())
            .with_context(|| format!("Cannot signal process {pid}"));
    }
    Ok(())
}

fn load_config(
    config: Option<&Path>,
    socket: Option<PathBuf>,
    listing_socket: Option<PathBuf>,
    no_takeover: bool,
) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load(config).context("Failed to load configuration")?;
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    if let Some(listing_socket) = listing_socket {
        config.listing_socket_path = Some(listing_socket);
    }
    if no_takeover {
        config.takeover = false;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
        socket: None,
        listing_socket: None,
        no_takeover: false,
    });

    match command {
        Command::Start {
            daemon,
            config,
            socket,
            listing_socket,
            no_takeover,
        } => {
            let config = load_config(config.as_deref(), socket, listing_socket, no_takeover)?;

            let pid_file = PidFile::new();
            if let Some(pid) = pid_file.live_daemon() {
                if !config.takeover {
                    bail!("svcregd already serves as pid {pid}; run `svcregd stop` first");
                }
                println!("svcregd pid {pid} is running; upgrading it in place.");
            }

            if daemon {
                daemonize()?;
            }

            // Claimed by run_daemon once this process actually serves.
            let exit = run_daemon(config, &pid_file);
            if !matches!(exit, Ok(ServerExit::HandedOff)) {
                pid_file.release();
            }
            match exit {
                // The successor now owns the sockets and the PID file.
                Ok(ServerExit::HandedOff) => process::exit(0),
                Ok(ServerExit::Stopped) => Ok(()),
                Err(e) => Err(e),
            }
        }
        Command::Stop => {
            let Some(pid) = PidFile::new().live_daemon() else {
                println!("svcregd is not running.");
                return Ok(());
            };

            println!("Sending SIGTERM to svcregd (pid {pid})");
            send_sigterm(pid)?;

            let deadline = Instant::now() + STOP_TIMEOUT;
            while Instant::now() < deadline {
                if !process_alive(pid) {
                    println!("svcregd stopped.");
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(100));
            }
            bail!("svcregd (pid {pid}) still running after {STOP_TIMEOUT:?}");
        }
        Command::Status => {
            let Some(pid) = PidFile::new().live_daemon() else {
                println!("svcregd is not running.");
                process::exit(1);
            };

            println!("svcregd is running (pid {pid})");
            let config = DaemonConfig::load(None).unwrap_or_default();
            let listing = config.listing_socket_path.as_deref();
            let sockets = [
                ("registration", Some(config.socket_path.as_path())),
                ("listing", listing),
            ];
            for (label, path) in sockets {
                if let Some(path) = path.filter(|p| p.exists()) {
                    println!("  {label} socket: {}", path.display());
                }
            }
            Ok(())
        }
        Command::ResolveWorker => {
            let stdin = io::stdin();
            let stdout = io::stdout();
            run_resolver_worker(stdin.lock(), stdout.lock(), &ProcResolver::new())
                .context("Resolver worker failed")
        }
    }
}

fn daemonize() -> Result<()> {
    let log_path = state_dir().join("svcregd.log");
    if let Some(dir) = log_path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
    }

    let log = File::create(&log_path)
        .with_context(|| format!("Cannot open log file {}", log_path.display()))?;
    let log_err = log.try_clone().context("Cannot duplicate log file handle")?;

    daemonize::Daemonize::new()
        .working_directory("/")
        .stdout(log)
        .stderr(log_err)
        .start()
        .context("Failed to detach from terminal")
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig, pid_file: &PidFile) -> Result<ServerExit> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("svcregd=info".parse()?)
                .add_directive("svcreg_core=info".parse()?)
                .add_directive("svcreg_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "svcreg daemon starting"
    );

    let cancel_token = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel_token.clone()));

    let worker_program = env::current_exe().unwrap_or_else(|_| PathBuf::from("svcregd"));
    let resolver = build_resolver(config.resolver, worker_program);
    let registry = Arc::new(Registry::new());

    let server = DaemonServer::launch(&config, registry, resolver, cancel_token)
        .await
        .context("Failed to start serving")?;
    pid_file.claim()?;

    let exit = match server.run().await {
        Ok(exit) => exit,
        Err(e) => {
            error!(error = %e, "Server error");
            return Err(e.into());
        }
    };

    match exit {
        ServerExit::HandedOff => info!("svcreg daemon handed over to successor"),
        ServerExit::Stopped => info!("svcreg daemon stopped"),
    }
    Ok(exit)
}

/// Cancels `token` on SIGTERM or SIGINT.
async fn cancel_on_signal(token: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Cannot install signal handlers");
            return;
        }
    };

    let name = tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    };
    info!(signal = name, "Shutting down");
    token.cancel();
}
