//! Handing the frame buffer's memfd to worker processes over a Unix socket.
//!
//! One descriptor travels per message as an `SCM_RIGHTS` control message,
//! next to an 8-byte little-endian region size in the ordinary payload.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

/// Control-message space; one descriptor needs far less.
const CMSG_SPACE: usize = 64;

/// Send `fd` with `payload`, which must not be empty.
fn send_fd(socket: &UnixStream, fd: impl AsFd, payload: &[u8]) -> Result<()> {
    if payload.is_empty() {
        return Err(Error::Protocol("descriptor message needs a payload".into()));
    }
    let fds = [fd.as_fd()];
    let mut space = [const { MaybeUninit::<u8>::uninit() }; CMSG_SPACE];
    let mut control = SendAncillaryBuffer::new(&mut space);
    if !control.push(SendAncillaryMessage::ScmRights(&fds)) {
        return Err(Error::Protocol("descriptor does not fit the control message".into()));
    }
    sendmsg(socket, &[IoSlice::new(payload)], &mut control, SendFlags::empty())?;
    Ok(())
}

/// Receive one message into `payload`; returns its length and every
/// descriptor that came with it.
fn recv_fd(socket: &UnixStream, payload: &mut [u8]) -> Result<(usize, Vec<OwnedFd>)> {
    let mut space = [const { MaybeUninit::<u8>::uninit() }; CMSG_SPACE];
    let mut control = RecvAncillaryBuffer::new(&mut space);
    let received = recvmsg(
        socket,
        &mut [IoSliceMut::new(payload)],
        &mut control,
        RecvFlags::empty(),
    )?;

    let fds: Vec<OwnedFd> = control
        .drain()
        .filter_map(|msg| match msg {
            RecvAncillaryMessage::ScmRights(rights) => Some(rights),
            _ => None,
        })
        .flatten()
        .collect();
    if received.bytes == 0 && fds.is_empty() {
        return Err(Error::Disconnected("peer closed the socket".into()));
    }
    Ok((received.bytes, fds))
}

/// Send the frame buffer descriptor and its region size in bytes.
pub fn send_segment_handle(socket: &UnixStream, fd: impl AsFd, size: usize) -> Result<()> {
    send_fd(socket, fd, &(size as u64).to_le_bytes())
}

/// Receive a descriptor sent with [`send_segment_handle`].
///
/// Exactly one descriptor and a full size field must arrive.
pub fn recv_segment_handle(socket: &UnixStream) -> Result<(OwnedFd, usize)> {
    let mut size = [0u8; 8];
    let (len, fds) = recv_fd(socket, &mut size)?;
    if len != size.len() {
        return Err(Error::Protocol(format!("region size truncated to {len} bytes")));
    }
    let mut fds = fds.into_iter();
    match (fds.next(), fds.next()) {
        (Some(fd), None) => Ok((fd, u64::from_le_bytes(size) as usize)),
        (None, _) => Err(Error::Protocol("region size arrived without a descriptor".into())),
        (Some(_), Some(_)) => Err(Error::Protocol("expected one descriptor, got several".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Frame, Shape};
    use crate::memory::SharedFrameBuffer;

    #[test]
    fn test_send_recv_segment_handle() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let buffer = SharedFrameBuffer::new(8, 8).unwrap();
        let frame = Frame::filled(Shape::new(2, 3), 9.0);
        buffer.lock().write_frame(&frame).unwrap();

        send_segment_handle(&sender, buffer.as_fd(), buffer.region_len()).unwrap();
        let (fd, size) = recv_segment_handle(&receiver).unwrap();
        assert_eq!(size, buffer.region_len());

        let remote = unsafe { SharedFrameBuffer::from_fd(fd, size).unwrap() };
        assert_eq!(remote.snapshot(), frame);

        // Writes through the received mapping are visible to the original.
        remote.lock().write_frame(&Frame::filled(Shape::new(1, 1), 4.0)).unwrap();
        assert_eq!(buffer.snapshot().as_slice(), &[4.0]);
    }

    #[test]
    fn test_size_without_descriptor_rejected() {
        use std::io::Write;
        let (mut sender, receiver) = UnixStream::pair().unwrap();
        sender.write_all(&64u64.to_le_bytes()).unwrap();
        assert!(matches!(
            recv_segment_handle(&receiver),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_recv_after_peer_closed() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        drop(sender);
        assert!(matches!(
            recv_segment_handle(&receiver),
            Err(Error::Disconnected(_))
        ));
    }
}
