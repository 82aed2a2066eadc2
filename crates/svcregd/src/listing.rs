//! Read-only view of the registry.
//!
//! [`ListingFacade`] is the only way anything outside the dispatcher reads
//! the registry. Every scan holds the quiesce lock in shared mode, so a
//! handoff snapshot never races a listing.
//!
//! [`ListingService`] puts the facade on its own Unix socket: one `LIST`
//! line in, a CSV document out, then the connection is closed.
//!
//! ```text
//! client                         ListingService task
//!   LIST\tservice=mail\n  ───▶   parse ListRequest
//!                                facade.query(filter)   (shared quiesce)
//!   CSV rows             ◀───    render_csv(entries)
//!   EOF                  ◀───    shutdown
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use svcreg_core::{ListFilter, RegistrationEntry};
use svcreg_protocol::{ListRequest, Response, MAX_LINE_LEN};

use crate::registry::{Quiesce, Registry};

/// Time a listing client gets to send its request line
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a listing client gets to take the whole reply
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long [`ListingService::stop`] lets the request in flight finish
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// CSV header line
pub const CSV_HEADER: &str = "service,user,pid,executable,endpoint,exclusive";

// ============================================================================
// Facade
// ============================================================================

/// Shared, read-only handle on the registry.
#[derive(Debug, Clone)]
pub struct ListingFacade {
    registry: Arc<Registry>,
    quiesce: Arc<Quiesce>,
}

impl ListingFacade {
    pub fn new(registry: Arc<Registry>, quiesce: Arc<Quiesce>) -> Self {
        Self { registry, quiesce }
    }

    /// Returns the entries matching `filter`, in registry order.
    pub async fn query(&self, filter: &ListFilter) -> Vec<RegistrationEntry> {
        let _shared = self.quiesce.shared().await;
        self.registry.list(filter)
    }
}

/// Renders entries as CSV with a header row.
///
/// Fields containing a comma, quote or line break are quoted, with inner
/// quotes doubled.
pub fn render_csv(entries: &[RegistrationEntry]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + 1 + entries.len() * 64);
    out.push_str(CSV_HEADER);
    out.push('\n');

    for entry in entries {
        let fields = [
            entry.service.to_string(),
            entry.user.to_string(),
            entry.pid.to_string(),
            entry.executable.clone(),
            entry.endpoint.to_string(),
            entry.exclusive.to_string(),
        ];
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            push_csv_field(&mut out, field);
        }
        out.push('\n');
    }
    out
}

fn push_csv_field(out: &mut String, field: &str) {
    if field.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&field.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(field);
    }
}

// ============================================================================
// Listing socket
// ============================================================================

/// Accept task serving the listing socket.
///
/// Stopping it hands the listener back, so a handoff can pass it on or,
/// if the handoff fails, serve it again.
#[derive(Debug)]
pub struct ListingService {
    stop: CancellationToken,
    task: JoinHandle<UnixListener>,
}

impl ListingService {
    /// Starts serving `listener` on the current runtime.
    pub fn spawn(listener: UnixListener, facade: ListingFacade) -> Self {
        let stop = CancellationToken::new();
        let task = tokio::spawn(serve(listener, facade, stop.clone()));
        Self { stop, task }
    }

    /// Stops accepting and returns the listener.
    ///
    /// A request in flight gets [`STOP_GRACE`] to finish before its client
    /// is dropped.
    pub async fn stop(self) -> Option<UnixListener> {
        self.stop.cancel();
        match self.task.await {
            Ok(listener) => Some(listener),
            Err(e) => {
                warn!(error = %e, "Listing task ended abnormally");
                None
            }
        }
    }
}

async fn serve(listener: UnixListener, facade: ListingFacade, stop: CancellationToken) -> UnixListener {
    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                debug!("Listing service stopping");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        if let Err(e) = answer_until_stopped(stream, &facade, &stop).await {
                            debug!(error = %e, "Listing request failed");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept listing connection");
                    }
                }
            }
        }
    }
    listener
}

async fn answer_until_stopped(
    stream: UnixStream,
    facade: &ListingFacade,
    stop: &CancellationToken,
) -> io::Result<()> {
    let request = answer(stream, facade);
    tokio::pin!(request);

    tokio::select! {
        result = &mut request => result,
        _ = stop.cancelled() => match tokio::time::timeout(STOP_GRACE, &mut request).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Dropping listing client still in flight at stop");
                Ok(())
            }
        },
    }
}

/// Answers one listing connection.
async fn answer(mut stream: UnixStream, facade: &ListingFacade) -> io::Result<()> {
    let line = match tokio::time::timeout(READ_TIMEOUT, read_request_line(&mut stream)).await {
        Ok(line) => line?,
        Err(_) => {
            debug!("Listing client sent no request in time");
            return Ok(());
        }
    };

    let reply = match ListRequest::parse(&line) {
        Ok(request) => {
            let entries = facade.query(&request.filter).await;
            info!(rows = entries.len(), "Listing served");
            render_csv(&entries)
        }
        Err(e) => Response::BadRequest(e.to_string()).to_line(),
    };

    let send = async {
        stream.write_all(reply.as_bytes()).await?;
        stream.shutdown().await
    };
    match tokio::time::timeout(WRITE_TIMEOUT, send).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "listing client stopped reading",
        )),
    }
}

async fn read_request_line(stream: &mut UnixStream) -> io::Result<String> {
    let mut reader = BufReader::new(stream).take(MAX_LINE_LEN as u64 + 1);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.len() > MAX_LINE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "listing request too long",
        ));
    }
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}
