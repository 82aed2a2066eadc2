//! Graceful restart: moving a running daemon into a successor process.
//!
//! The successor connects to the registration socket like any client,
//! authenticates, and sends `REEXEC\t<version>`. If the daemon accepts,
//! the same socket turns into the handoff stream:
//!
//! ```text
//! "+Handoff\t<version>\n"
//! Header { counts }
//! Listener { role }      + descriptor      (per listening socket)
//! Entry(record)                            (per registry row)
//! Connection(record)     + descriptor      (per live connection)
//! End
//!                      ◀── HANDOFF_ACK     (successor validated the state)
//! ```
//!
//! Records are length-prefixed JSON frames ([`frame`]); descriptors use the
//! marker-bracketed transfer of [`FdChannel`]. Only after the acknowledgement
//! does the old daemon exit, without unlinking its socket files, which now
//! belong to the successor.
//!
//! A refused or broken handoff never leaves either side stuck. The
//! successor gets a [`HandoffError`]; the running daemon loses only the
//! requesting connection and keeps serving.

mod fd;
mod frame;

pub use fd::{ChannelState, FdChannel, FD_BEGIN, FD_CARRIER, FD_END};
pub use frame::{ConnectionRecord, HandoffReader, HandoffRecord, HandoffWriter, MAX_FRAME_LEN};

use std::collections::HashMap;
use std::io::{self, BufWriter, Read, Write};
use std::os::fd::BorrowedFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use svcreg_client::{ClientError, RegistryClient};
use svcreg_protocol::{ProtocolVersion, Response, VersionError};

use crate::registry::{EntryKey, Owner, RegistryRecord};
use crate::server::ListenerRole;

/// First token of the line that starts a handoff stream
pub const PREAMBLE: &str = "+Handoff";

/// Longest preamble or refusal line the successor will read
const MAX_PREAMBLE_LEN: usize = 256;

/// Byte the successor sends once it holds a complete, consistent state
pub const HANDOFF_ACK: u8 = 0x06;

/// How long either side waits on a silent peer
const TAKEOVER_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Sending side
// ============================================================================

/// A live connection to hand over.
#[derive(Debug)]
pub struct ConnectionTransfer<'a> {
    pub record: ConnectionRecord,
    pub fd: BorrowedFd<'a>,
}

/// Everything the running daemon hands to its successor.
#[derive(Debug)]
pub struct Snapshot<'a> {
    pub listeners: Vec<(ListenerRole, BorrowedFd<'a>)>,
    pub entries: Vec<RegistryRecord>,
    pub connections: Vec<ConnectionTransfer<'a>>,
    pub next_connection: u64,
}

/// Writes the whole handoff stream to the requesting successor.
///
/// Blocks until the successor acknowledges. The descriptors are only
/// borrowed: if this fails part-way the caller still owns every socket
/// and can keep serving.
pub fn send_state(stream: UnixStream, snapshot: Snapshot<'_>) -> Result<(), HandoffError> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(TAKEOVER_TIMEOUT))?;

    let ack = stream.try_clone()?;
    let mut channel = FdChannel::new(stream.try_clone()?);
    let mut writer = HandoffWriter::new(BufWriter::new(stream));

    let preamble = format!("{PREAMBLE}\t{}\n", ProtocolVersion::CURRENT);
    writer.get_mut().write_all(preamble.as_bytes())?;

    writer.write_record(&HandoffRecord::Header {
        listeners: snapshot.listeners.len(),
        entries: snapshot.entries.len(),
        connections: snapshot.connections.len(),
        next_connection: snapshot.next_connection,
    })?;

    for (role, fd) in &snapshot.listeners {
        writer.write_record(&HandoffRecord::Listener { role: *role })?;
        writer.flush()?;
        channel.send_fd(*fd)?;
        debug!(role = %role, "Listener handed over");
    }

    for entry in snapshot.entries {
        writer.write_record(&HandoffRecord::Entry(entry))?;
    }

    for transfer in snapshot.connections {
        let id = transfer.record.id;
        writer.write_record(&HandoffRecord::Connection(transfer.record))?;
        writer.flush()?;
        channel.send_fd(transfer.fd)?;
        debug!(connection = %id, "Connection handed over");
    }

    writer.write_record(&HandoffRecord::End)?;
    writer.flush()?;

    let mut byte = [0u8; 1];
    (&ack).read_exact(&mut byte)?;
    if byte[0] != HANDOFF_ACK {
        return Err(HandoffError::Desync {
            expected: HANDOFF_ACK,
            got: byte[0],
        });
    }
    Ok(())
}

// ============================================================================
// Receiving side
// ============================================================================

/// A connection adopted from the predecessor.
#[derive(Debug)]
pub struct InheritedConnection {
    pub record: ConnectionRecord,
    pub stream: UnixStream,
}

/// Everything received from the predecessor, ready to be served.
#[derive(Debug)]
pub struct InheritedState {
    pub version: ProtocolVersion,
    pub listeners: Vec<(ListenerRole, UnixListener)>,
    pub records: Vec<RegistryRecord>,
    pub connections: Vec<InheritedConnection>,
    pub next_connection: u64,
}

/// Asks the daemon at `socket_path` to hand over, and receives its state.
///
/// Blocking; call it before starting the runtime's server loop.
pub fn take_over(socket_path: &Path) -> Result<InheritedState, HandoffError> {
    let client = RegistryClient::connect(socket_path)?;
    client.set_timeout(Some(TAKEOVER_TIMEOUT))?;
    let stream = client.into_reexec(ProtocolVersion::CURRENT)?;
    info!(socket = %socket_path.display(), "Requested handoff from running daemon");
    receive_state(stream)
}

/// Reads a complete handoff stream from `stream`.
pub fn receive_state(stream: UnixStream) -> Result<InheritedState, HandoffError> {
    let version = read_preamble(&stream)?;

    let ack = stream.try_clone()?;
    let mut channel = FdChannel::new(stream.try_clone()?);
    let mut reader = HandoffReader::new(stream);

    let (expected_listeners, expected_entries, expected_connections, mut next_connection) =
        match reader.read_record()? {
            HandoffRecord::Header {
                listeners,
                entries,
                connections,
                next_connection,
            } => (listeners, entries, connections, next_connection),
            other => return Err(HandoffError::UnexpectedRecord(other.kind())),
        };

    let mut listeners = Vec::new();
    let mut records = Vec::new();
    let mut connections = Vec::new();

    loop {
        match reader.read_record()? {
            HandoffRecord::Listener { role } => {
                let fd = channel.recv_fd()?;
                listeners.push((role, UnixListener::from(fd)));
            }
            HandoffRecord::Entry(record) => records.push(record),
            HandoffRecord::Connection(record) => {
                let fd = channel.recv_fd()?;
                next_connection = next_connection.max(record.id.0.saturating_add(1));
                connections.push(InheritedConnection {
                    record,
                    stream: UnixStream::from(fd),
                });
            }
            HandoffRecord::End => break,
            other @ HandoffRecord::Header { .. } => {
                return Err(HandoffError::UnexpectedRecord(other.kind()))
            }
        }
    }

    if listeners.len() != expected_listeners
        || records.len() != expected_entries
        || connections.len() != expected_connections
    {
        return Err(HandoffError::Inconsistent(format!(
            "expected {expected_listeners} listeners, {expected_entries} entries, \
             {expected_connections} connections; got {}, {}, {}",
            listeners.len(),
            records.len(),
            connections.len()
        )));
    }
    check_ownership(&records, &connections)?;
    (&ack).write_all(&[HANDOFF_ACK])?;

    info!(
        listeners = listeners.len(),
        entries = records.len(),
        connections = connections.len(),
        "Received daemon state"
    );

    Ok(InheritedState {
        version,
        listeners,
        records,
        connections,
        next_connection,
    })
}

/// Reads the preamble byte by byte so nothing past it is consumed.
fn read_preamble(mut stream: &UnixStream) -> Result<ProtocolVersion, HandoffError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_PREAMBLE_LEN {
            return Err(HandoffError::UnexpectedPreamble(
                String::from_utf8_lossy(&line).into_owned(),
            ));
        }
    }
    let line = String::from_utf8_lossy(&line).into_owned();

    if line.starts_with('-') {
        return Err(match Response::parse(&line) {
            Some(response) => HandoffError::Refused(response),
            None => HandoffError::UnexpectedPreamble(line),
        });
    }

    let version = line
        .strip_prefix(PREAMBLE)
        .and_then(|rest| rest.strip_prefix('\t'))
        .ok_or_else(|| HandoffError::UnexpectedPreamble(line.clone()))?;
    let version = ProtocolVersion::parse(version)?;
    version.check_handoff(&ProtocolVersion::CURRENT)?;
    Ok(version)
}

/// Every handle a connection holds must name an entry that connection
/// owns under the same tag.
fn check_ownership(
    records: &[RegistryRecord],
    connections: &[InheritedConnection],
) -> Result<(), HandoffError> {
    let owners: HashMap<&EntryKey, &Owner> = records.iter().map(|r| (&r.key, &r.owner)).collect();

    for connection in connections {
        let record = &connection.record;
        for (tag, keys) in &record.committed {
            for key in keys {
                let owned = owners
                    .get(key)
                    .is_some_and(|owner| owner.connection == record.id && &owner.tag == tag);
                if !owned {
                    return Err(HandoffError::Inconsistent(format!(
                        "connection {} holds {}/{}#{} under tag {tag} without owning it",
                        record.id, key.service, key.user, key.seq
                    )));
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// Failures of either side of a handoff.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Could not reach running daemon: {0}")]
    Client(#[from] ClientError),

    #[error("Running daemon refused handoff: {0}")]
    Refused(Response),

    #[error("Unexpected handoff preamble {0:?}")]
    UnexpectedPreamble(String),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("Failed to encode or decode handoff record: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Handoff frame of {len} bytes exceeds limit")]
    FrameTooLarge { len: usize },

    #[error("Unexpected {0} record in handoff stream")]
    UnexpectedRecord(&'static str),

    #[error("Descriptor channel desynchronized: expected byte {expected:#04x}, got {got:#04x}")]
    Desync { expected: u8, got: u8 },

    #[error("Descriptor channel in state {actual:?}, expected {expected:?}")]
    ChannelState {
        expected: ChannelState,
        actual: ChannelState,
    },

    #[error("Descriptor carrier arrived without a descriptor")]
    MissingDescriptor,

    #[error("Descriptor control message truncated")]
    TruncatedControl,

    #[error("Handoff state inconsistent: {0}")]
    Inconsistent(String),

    #[error("Handoff did not include a {0} listener")]
    MissingListener(ListenerRole),
}
