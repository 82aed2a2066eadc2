//! svcreg - register services with, and query, the local registry daemon
//!
//! # Usage
//!
//! ```text
//! svcreg register mail 25 /run/mail.sock   # hold until Ctrl+C
//! svcreg register --exclusive --tag mta mail 25
//! svcreg list --service mail --user 1000
//! ```

use std::env;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use svcreg_client::{ListingClient, RegistryClient};
use svcreg_core::{Endpoint, ListFilter, ServiceFlags, ServiceName, Tag};
use svcregd::config::{
    DEFAULT_LISTING_SOCKET_PATH, DEFAULT_SOCKET_PATH, LISTING_SOCKET_ENV, SOCKET_ENV,
};

// ============================================================================
// CLI Arguments
// ============================================================================

/// svcreg - host-local service registry client
#[derive(Parser, Debug)]
#[command(name = "svcreg")]
#[command(about = "Register and list services on this host")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a service and keep it registered until interrupted
    Register {
        /// Tag grouping these registrations
        #[arg(long, default_value = "default")]
        tag: String,

        /// Refuse other registrations of this service for the same user
        #[arg(long)]
        exclusive: bool,

        /// Record this process's executable with the entries
        #[arg(long)]
        record_exe: bool,

        /// Registration socket (defaults to $SVCREG_SOCKET or the built-in path)
        #[arg(long)]
        socket: Option<PathBuf>,

        /// Service name
        service: String,

        /// Ports, absolute socket paths or `*`
        #[arg(required = true)]
        endpoints: Vec<String>,
    },
    /// Print registered services as CSV
    List {
        /// Only these services (repeatable)
        #[arg(long)]
        service: Vec<String>,

        /// Only these user ids (repeatable)
        #[arg(long)]
        user: Vec<u32>,

        /// Only these pids (repeatable)
        #[arg(long)]
        pid: Vec<u32>,

        /// Listing socket (defaults to $SVCREG_LIST_SOCKET or the built-in path)
        #[arg(long)]
        socket: Option<PathBuf>,
    },
}

fn socket_from_env(flag: Option<PathBuf>, var: &str, default: &str) -> PathBuf {
    flag.or_else(|| {
        env::var(var)
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(|| PathBuf::from(default))
}

// ============================================================================
// Commands
// ============================================================================

async fn register(
    socket: PathBuf,
    tag: &str,
    flags: ServiceFlags,
    service: &str,
    endpoints: &[String],
) -> Result<()> {
    let tag = Tag::new(tag).context("Invalid tag")?;
    let service = ServiceName::new(service).context("Invalid service name")?;
    let endpoints = endpoints
        .iter()
        .map(|e| Endpoint::parse(e).with_context(|| format!("Invalid endpoint {e:?}")))
        .collect::<Result<Vec<_>>>()?;

    let mut client = RegistryClient::connect(&socket)
        .with_context(|| format!("Failed to connect to {}", socket.display()))?;

    for endpoint in endpoints {
        debug!(service = %service, endpoint = %endpoint, "Staging entry");
        client
            .stage(flags, service.clone(), endpoint)
            .context("Daemon rejected entry")?;
    }

    if !client.register(&tag).context("Registration failed")? {
        bail!("Registration refused: {service} is registered exclusively elsewhere");
    }

    info!(service = %service, tag = %tag, "Registered");
    println!("Registered {service}; press Ctrl+C to withdraw.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl+C")?;

    client.drop_tag(&tag).context("Failed to withdraw registration")?;
    println!("Withdrawn.");
    Ok(())
}

fn list(socket: PathBuf, services: Vec<String>, users: Vec<u32>, pids: Vec<u32>) -> Result<()> {
    let mut filter = ListFilter::all();
    for service in services {
        filter = filter.with_service(service);
    }
    for user in users {
        filter = filter.with_user(user);
    }
    for pid in pids {
        filter = filter.with_pid(pid);
    }

    let csv = ListingClient::new(&socket)
        .query(&filter)
        .with_context(|| format!("Listing via {} failed", socket.display()))?;
    print!("{csv}");
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Register {
            tag,
            exclusive,
            record_exe,
            socket,
            service,
            endpoints,
        } => {
            let socket = socket_from_env(socket, SOCKET_ENV, DEFAULT_SOCKET_PATH);
            let flags = ServiceFlags {
                exclusive,
                record_executable: record_exe,
            };
            register(socket, &tag, flags, &service, &endpoints).await
        }
        Command::List {
            service,
            user,
            pid,
            socket,
        } => {
            let socket = socket_from_env(socket, LISTING_SOCKET_ENV, DEFAULT_LISTING_SOCKET_PATH);
            list(socket, service, user, pid)
        }
    }
}
