//! Typed records of the handoff byte stream.
//!
//! Each record is a frame: a big-endian `u32` length followed by that many
//! bytes of JSON. Records that announce a descriptor (`Listener`,
//! `Connection`) are immediately followed by one descriptor transfer on
//! the [`FdChannel`](super::FdChannel).

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use svcreg_core::{RegistrationEntry, Tag};

use super::HandoffError;
use crate::registry::{ConnectionId, EntryKey, RegistryRecord};
use crate::server::{AuthState, ListenerRole};

/// Largest accepted frame body (16 MiB)
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// State of one live connection, minus its descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub auth: AuthState,
    /// Received bytes not yet consumed as a line
    pub input: Vec<u8>,
    /// Responses not yet written to the peer
    pub output: Vec<u8>,
    pub pending: Vec<RegistrationEntry>,
    pub committed: BTreeMap<Tag, Vec<EntryKey>>,
}

/// One frame of the handoff stream, in the order they are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandoffRecord {
    /// Counts of what follows, used to verify completeness
    Header {
        listeners: usize,
        entries: usize,
        connections: usize,
        next_connection: u64,
    },
    /// A listening socket; its descriptor follows
    Listener { role: ListenerRole },
    /// One registry row
    Entry(RegistryRecord),
    /// One client connection; its descriptor follows
    Connection(ConnectionRecord),
    /// Nothing follows
    End,
}

impl HandoffRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Header { .. } => "header",
            Self::Listener { .. } => "listener",
            Self::Entry(_) => "entry",
            Self::Connection(_) => "connection",
            Self::End => "end",
        }
    }
}

/// Writes length-prefixed records.
#[derive(Debug)]
pub struct HandoffWriter<W: Write> {
    inner: W,
}

impl<W: Write> HandoffWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_record(&mut self, record: &HandoffRecord) -> Result<(), HandoffError> {
        let body = serde_json::to_vec(record)?;
        let len = u32::try_from(body.len())
            .ok()
            .filter(|_| body.len() <= MAX_FRAME_LEN)
            .ok_or(HandoffError::FrameTooLarge { len: body.len() })?;
        self.inner.write_all(&len.to_be_bytes())?;
        self.inner.write_all(&body)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), HandoffError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

/// Reads length-prefixed records.
///
/// Reads exactly one frame's bytes at a time, so it never consumes a byte
/// that carries a descriptor.
#[derive(Debug)]
pub struct HandoffReader<R: Read> {
    inner: R,
}

impl<R: Read> HandoffReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn read_record(&mut self) -> Result<HandoffRecord, HandoffError> {
        let mut len = [0u8; 4];
        self.inner.read_exact(&mut len)?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_FRAME_LEN {
            return Err(HandoffError::FrameTooLarge { len });
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use svcreg_core::{Endpoint, PeerIdentity, ServiceName};

    use crate::registry::Owner;

    fn sample_connection() -> ConnectionRecord {
        let tag = Tag::new("T1").unwrap();
        let key = EntryKey {
            service: ServiceName::new("mail").unwrap(),
            user: 1000,
            seq: 4,
        };
        ConnectionRecord {
            id: ConnectionId(7),
            auth: AuthState::Authenticated(PeerIdentity::new(1000, 42, "/usr/sbin/mta")),
            input: b"SVC\t-\tma".to_vec(),
            output: b"+Ok\n".to_vec(),
            pending: Vec::new(),
            committed: BTreeMap::from([(tag, vec![key])]),
        }
    }

    #[test]
    fn test_records_survive_framing() {
        let records = vec![
            HandoffRecord::Header {
                listeners: 1,
                entries: 1,
                connections: 1,
                next_connection: 8,
            },
            HandoffRecord::Listener {
                role: ListenerRole::Registration,
            },
            HandoffRecord::Entry(RegistryRecord {
                key: EntryKey {
                    service: ServiceName::new("mail").unwrap(),
                    user: 1000,
                    seq: 4,
                },
                entry: RegistrationEntry {
                    service: ServiceName::new("mail").unwrap(),
                    user: 1000,
                    pid: 42,
                    executable: "/usr/sbin/mta".to_string(),
                    endpoint: Endpoint::Port(25),
                    exclusive: true,
                },
                owner: Owner::new(ConnectionId(7), Tag::new("T1").unwrap()),
            }),
            HandoffRecord::Connection(sample_connection()),
            HandoffRecord::End,
        ];

        let mut writer = HandoffWriter::new(Vec::new());
        for record in &records {
            writer.write_record(record).unwrap();
        }
        let bytes = writer.get_mut().clone();

        let mut reader = HandoffReader::new(Cursor::new(bytes));
        for record in &records {
            assert_eq!(&reader.read_record().unwrap(), record);
        }
        assert!(reader.read_record().is_err());
    }

    #[test]
    fn test_frame_is_length_prefixed_json() {
        let mut writer = HandoffWriter::new(Vec::new());
        writer.write_record(&HandoffRecord::End).unwrap();
        let bytes = writer.get_mut().clone();

        let body = br#"{"kind":"end"}"#;
        assert_eq!(&bytes[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&bytes[4..], body);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut bytes = (MAX_FRAME_LEN as u32 + 1).to_be_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        let mut reader = HandoffReader::new(Cursor::new(bytes));
        assert!(matches!(
            reader.read_record(),
            Err(HandoffError::FrameTooLarge { .. })
        ));
    }
}
