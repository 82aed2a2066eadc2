//! Server half of the credential handshake.

use std::io::{self, IoSliceMut};
use std::os::fd::{AsFd, RawFd};

use nix::sys::socket::{
    recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, UnixCredentials,
};
use svcreg_client::credentials::CREDENTIALS_BYTE;

/// Uid and pid the kernel vouched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub pid: u32,
}

/// Asks the kernel to attach sender credentials to received messages.
///
/// Set on listeners (accepted sockets inherit it) and again on each
/// accepted socket.
pub fn enable_passcred<F: AsFd>(socket: &F) -> io::Result<()> {
    setsockopt(socket, sockopt::PassCred, &true).map_err(io::Error::from)
}

/// Reads the one-byte credential message from a fresh connection.
///
/// Fails with `WouldBlock` if nothing has arrived yet, `UnexpectedEof` if
/// the peer hung up, and `InvalidData` if the first byte carried no
/// credentials or was not the credential byte.
pub fn recv_credentials(fd: RawFd) -> io::Result<PeerCredentials> {
    let mut byte = [0u8; 1];
    let mut cmsg_buffer = nix::cmsg_space!(UnixCredentials);

    let (bytes, credentials) = {
        let mut iov = [IoSliceMut::new(&mut byte)];
        let msg = recvmsg::<()>(
            fd,
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC | MsgFlags::MSG_DONTWAIT,
        )
        .map_err(io::Error::from)?;

        let credentials = msg
            .cmsgs()
            .map_err(io::Error::from)?
            .find_map(|cmsg| match cmsg {
                ControlMessageOwned::ScmCredentials(creds) => Some(creds),
                _ => None,
            });
        (msg.bytes, credentials)
    };

    if bytes == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed before sending credentials",
        ));
    }
    if byte[0] != CREDENTIALS_BYTE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "first byte is not the credential byte",
        ));
    }
    let credentials = credentials.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "no credential control message")
    })?;

    Ok(PeerCredentials {
        uid: credentials.uid(),
        pid: u32::try_from(credentials.pid()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "negative pid in credentials")
        })?,
    })
}
