//! Client half of the credential handshake.

use std::io::{self, IoSlice};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags, UnixCredentials};

/// Payload byte carrying the credential control message.
pub const CREDENTIALS_BYTE: u8 = 0;

/// Sends this process's uid/pid/gid as an `SCM_CREDENTIALS` control
/// message attached to a single NUL byte.
///
/// Must be the first thing written on a fresh registration connection.
/// The kernel rejects credentials that do not belong to the caller, so
/// the daemon can trust what it receives.
pub fn send_credentials(stream: &UnixStream) -> io::Result<()> {
    let creds = UnixCredentials::new();
    let cmsgs = [ControlMessage::ScmCredentials(&creds)];
    let payload = [CREDENTIALS_BYTE];
    let iov = [IoSlice::new(&payload)];

    let sent = sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
        .map_err(io::Error::from)?;
    if sent != payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "credential message not sent",
        ));
    }
    Ok(())
}
