//! One descriptor over a Unix stream socket, as SCM_RIGHTS ancillary data
//! riding on exactly one NUL byte of in-band data.

use crate::error::{ProcError, Result};
use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

const MARKER: [u8; 1] = [0];

pub fn send_fd(socket: &impl AsRawFd, fd: BorrowedFd<'_>) -> Result<()> {
    let iov = [IoSlice::new(&MARKER)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let sent = sendmsg::<()>(socket.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    if sent != MARKER.len() {
        return Err(ProcError::Protocol(format!(
            "sent {sent} bytes of in-band data alongside a descriptor, expected 1"
        )));
    }
    Ok(())
}

/// Every descriptor that arrives is owned, so anything rejected here is closed.
pub fn recv_fd(socket: &impl AsRawFd) -> Result<OwnedFd> {
    // Room for one extra byte and one extra fd, so excess is detectable.
    let mut data = [0xffu8; 2];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; 2]);

    let (bytes, truncated, mut received, foreign) = {
        let mut iov = [IoSliceMut::new(&mut data)];
        let msg = recvmsg::<()>(
            socket.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )?;

        let mut received: Vec<OwnedFd> = Vec::new();
        let mut foreign = 0usize;
        let cmsgs = msg
            .cmsgs()
            .map_err(|_| ProcError::Protocol("control data truncated".into()))?;
        for cmsg in cmsgs {
            match cmsg {
                ControlMessageOwned::ScmRights(fds) => {
                    // SAFETY: the kernel just installed these descriptors for us.
                    received.extend(fds.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
                _ => foreign += 1,
            }
        }
        (
            msg.bytes,
            msg.flags.contains(MsgFlags::MSG_CTRUNC),
            received,
            foreign,
        )
    };

    if bytes != MARKER.len() {
        return Err(ProcError::Protocol(format!(
            "expected exactly 1 byte of in-band data with a descriptor, got {bytes}"
        )));
    }
    if data[0] != MARKER[0] {
        return Err(ProcError::Protocol(format!(
            "unexpected in-band byte {:#04x} with a descriptor",
            data[0]
        )));
    }
    if truncated || foreign != 0 {
        return Err(ProcError::Protocol(
            "control data truncated or of an unexpected type".into(),
        ));
    }
    match (received.pop(), received.is_empty()) {
        (Some(fd), true) => Ok(fd),
        (None, _) => Err(ProcError::Protocol("no descriptor received".into())),
        (Some(_), false) => Err(ProcError::Protocol("more than one descriptor received".into())),
    }
}
