//! Descriptor transfer interleaved with the handoff byte stream.
//!
//! A descriptor rides as `SCM_RIGHTS` ancillary data on a single carrier
//! byte. The kernel only hands it over to a `recvmsg` that reads exactly
//! that byte with a control buffer, so both sides bracket the carrier with
//! marker bytes and move in lockstep:
//!
//! ```text
//!   sender                                  receiver
//!   flush pending frames
//!   write FD_BEGIN           ──────────▶    read 1 byte == FD_BEGIN
//!   (ExpectMarker → TransferFd)             (ExpectMarker → TransferFd)
//!   sendmsg(FD_CARRIER + fd) ──────────▶    recvmsg 1 byte + fd (blocking)
//!   write FD_END             ──────────▶    read 1 byte == FD_END
//!   (TransferFd → ExpectMarker)             (TransferFd → ExpectMarker)
//! ```
//!
//! The receiver forces the socket into blocking mode for the `recvmsg`
//! and restores the previous mode afterwards.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use super::HandoffError;

/// Marker written before a descriptor transfer
pub const FD_BEGIN: u8 = 0x1c;

/// Payload byte carrying the descriptor
pub const FD_CARRIER: u8 = 0x1d;

/// Marker written after a descriptor transfer
pub const FD_END: u8 = 0x1e;

/// Where the channel is in the transfer handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Between transfers; the next descriptor byte must be `FD_BEGIN`
    ExpectMarker,
    /// `FD_BEGIN` seen; the carrier byte with the descriptor is next
    TransferFd,
}

/// Descriptor side of a handoff socket.
#[derive(Debug)]
pub struct FdChannel {
    stream: UnixStream,
    state: ChannelState,
}

impl FdChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            state: ChannelState::ExpectMarker,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Sends one descriptor. Any buffered frame bytes for the same socket
    /// must have been flushed first.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>) -> Result<(), HandoffError> {
        self.expect(ChannelState::ExpectMarker)?;

        (&self.stream).write_all(&[FD_BEGIN])?;
        self.state = ChannelState::TransferFd;

        let fds = [fd.as_raw_fd()];
        let cmsgs = [ControlMessage::ScmRights(&fds)];
        let payload = [FD_CARRIER];
        let iov = [IoSlice::new(&payload)];
        let sent = sendmsg::<()>(self.stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
            .map_err(io::Error::from)?;
        if sent != payload.len() {
            return Err(HandoffError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "descriptor carrier not sent",
            )));
        }

        (&self.stream).write_all(&[FD_END])?;
        self.state = ChannelState::ExpectMarker;
        Ok(())
    }

    /// Receives one descriptor, close-on-exec.
    pub fn recv_fd(&mut self) -> Result<OwnedFd, HandoffError> {
        self.expect(ChannelState::ExpectMarker)?;

        self.expect_byte(FD_BEGIN)?;
        self.state = ChannelState::TransferFd;

        let fd = {
            let _blocking = BlockingMode::engage(self.stream.as_raw_fd())?;
            recv_carrier(self.stream.as_raw_fd())?
        };

        self.expect_byte(FD_END)?;
        self.state = ChannelState::ExpectMarker;
        Ok(fd)
    }

    fn expect(&self, expected: ChannelState) -> Result<(), HandoffError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HandoffError::ChannelState {
                expected,
                actual: self.state,
            })
        }
    }

    fn expect_byte(&mut self, expected: u8) -> Result<(), HandoffError> {
        let mut byte = [0u8; 1];
        (&self.stream).read_exact(&mut byte)?;
        if byte[0] != expected {
            return Err(HandoffError::Desync {
                expected,
                got: byte[0],
            });
        }
        Ok(())
    }
}

fn recv_carrier(fd: RawFd) -> Result<OwnedFd, HandoffError> {
    let mut byte = [0u8; 1];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

    let (bytes, truncated, received) = {
        let mut iov = [IoSliceMut::new(&mut byte)];
        let msg = recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::MSG_CMSG_CLOEXEC)
            .map_err(io::Error::from)?;

        let mut received: Vec<RawFd> = Vec::new();
        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received.extend(fds);
            }
        }
        (
            msg.bytes,
            msg.flags.contains(MsgFlags::MSG_CTRUNC),
            received,
        )
    };

    // SAFETY: every descriptor in an SCM_RIGHTS message is newly installed
    // in this process and owned by nobody else.
    let mut owned: Vec<OwnedFd> = received
        .into_iter()
        .map(|raw| unsafe { OwnedFd::from_raw_fd(raw) })
        .collect();

    if bytes == 0 {
        return Err(HandoffError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "handoff stream ended before descriptor",
        )));
    }
    if byte[0] != FD_CARRIER {
        return Err(HandoffError::Desync {
            expected: FD_CARRIER,
            got: byte[0],
        });
    }
    if truncated || owned.len() > 1 {
        return Err(HandoffError::TruncatedControl);
    }
    owned.pop().ok_or(HandoffError::MissingDescriptor)
}

/// Clears `O_NONBLOCK` on a descriptor until dropped.
struct BlockingMode {
    fd: RawFd,
    saved: libc::c_int,
}

impl BlockingMode {
    fn engage(fd: RawFd) -> io::Result<Self> {
        // SAFETY: F_GETFL/F_SETFL only read and write file status flags.
        let saved = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if saved < 0 {
            return Err(io::Error::last_os_error());
        }
        if saved & libc::O_NONBLOCK != 0 {
            let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, saved & !libc::O_NONBLOCK) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self { fd, saved })
    }
}

impl Drop for BlockingMode {
    fn drop(&mut self) {
        if self.saved & libc::O_NONBLOCK != 0 {
            // SAFETY: see `engage`.
            unsafe {
                libc::fcntl(self.fd, libc::F_SETFL, self.saved);
            }
        }
    }
}
