//! Byte-stream transports.
//!
//! A [`Transport`] delivers and accepts bytes and never interprets them.
//! The plain implementation wraps a non-blocking socket; the TLS wrapper in
//! [`crate::crypto`] implements the same interface over another transport,
//! so the state machine is oblivious to encryption.

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bitflags::bitflags;
use nix::errno::Errno;
use nix::sys::socket::{self, MsgFlags, Shutdown};

bitflags! {
    /// Which direction(s) the caller must wait on before re-entering the
    /// state machine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AioDirection: u32 {
        const READ = 1;
        const WRITE = 2;
        const BOTH = 3;
    }
}

/// Why a transport operation could not complete.
#[derive(Debug)]
pub(crate) enum TransportError {
    /// Not an error: retry after the fd is ready in the given direction.
    WouldBlock(AioDirection),
    /// A system-call failure; the connection is unusable.
    Io(Errno),
    /// A TLS-level failure; the connection is unusable.
    Tls(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::WouldBlock(_) => write!(f, "operation would block"),
            TransportError::Io(errno) => write!(f, "{}", errno.desc()),
            TransportError::Tls(msg) => write!(f, "TLS: {msg}"),
        }
    }
}

pub(crate) type TransportResult<T> = Result<T, TransportError>;

/// A non-blocking byte stream.
pub(crate) trait Transport: Send {
    /// Read some bytes. Partial reads are allowed; `Ok(0)` means the peer
    /// closed the connection.
    fn recv(&mut self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Write some bytes. Partial writes are allowed. `more` hints that
    /// further data follows immediately (`MSG_MORE`).
    fn send(&mut self, buf: &[u8], more: bool) -> TransportResult<usize>;

    /// True if the transport holds buffered bytes that a poll on
    /// [`Transport::poll_fd`] would not report (only TLS buffers).
    fn pending(&self) -> bool;

    /// File descriptor suitable for readiness polling.
    fn poll_fd(&self) -> RawFd;

    /// Half-close the write side. `Ok(false)` means call again after the fd
    /// is writable (TLS needs to flush its close-notify).
    fn shutdown_writes(&mut self) -> TransportResult<bool>;

    /// Release the transport's resources: any session teardown the layer
    /// can still manage, then the fd as the transport is consumed.
    fn close(self: Box<Self>);

    /// Drive a TLS handshake one step, if this transport has one. The
    /// plain transport has nothing to do.
    fn tls_handshake(&mut self) -> TransportResult<bool> {
        Ok(true)
    }
}

/// Plain transport over a non-blocking socket fd.
#[derive(Debug)]
pub(crate) struct PlainTransport {
    fd: OwnedFd,
}

impl PlainTransport {
    /// Wrap an fd that is already in non-blocking mode.
    pub fn new(fd: OwnedFd) -> Self {
        PlainTransport { fd }
    }
}

impl Transport for PlainTransport {
    fn recv(&mut self, buf: &mut [u8]) -> TransportResult<usize> {
        match socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Err(TransportError::WouldBlock(AioDirection::READ)),
            Err(Errno::EINTR) => Err(TransportError::WouldBlock(AioDirection::READ)),
            Err(errno) => Err(TransportError::Io(errno)),
        }
    }

    fn send(&mut self, buf: &[u8], more: bool) -> TransportResult<usize> {
        let mut flags = MsgFlags::MSG_NOSIGNAL;
        if more {
            flags |= MsgFlags::from_bits_retain(libc::MSG_MORE);
        }
        match socket::send(self.fd.as_raw_fd(), buf, flags) {
            Ok(n) => Ok(n),
            Err(Errno::EAGAIN) => Err(TransportError::WouldBlock(AioDirection::WRITE)),
            Err(Errno::EINTR) => Err(TransportError::WouldBlock(AioDirection::WRITE)),
            Err(errno) => Err(TransportError::Io(errno)),
        }
    }

    fn pending(&self) -> bool {
        false
    }

    fn poll_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn shutdown_writes(&mut self) -> TransportResult<bool> {
        match socket::shutdown(self.fd.as_raw_fd(), Shutdown::Write) {
            Ok(()) => Ok(true),
            Err(Errno::ENOTCONN) => Ok(true),
            Err(errno) => Err(TransportError::Io(errno)),
        }
    }

    fn close(self: Box<Self>) {
        // nothing to tear down above the socket; the owned fd closes here
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    fn pair() -> (PlainTransport, PlainTransport) {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .expect("socketpair");
        (PlainTransport::new(a), PlainTransport::new(b))
    }

    #[test]
    fn send_and_recv() {
        let (mut a, mut b) = pair();
        let n = a.send(b"hello", false).unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn recv_would_block() {
        let (_a, mut b) = pair();
        let mut buf = [0u8; 16];
        match b.recv(&mut buf) {
            Err(TransportError::WouldBlock(d)) => assert_eq!(d, AioDirection::READ),
            other => panic!("expected WouldBlock, got {other:?}"),
        }
    }

    #[test]
    fn recv_zero_after_close() {
        let (a, mut b) = pair();
        Box::new(a).close();
        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).unwrap(), 0);
    }

    #[test]
    fn shutdown_then_peer_sees_eof() {
        let (mut a, mut b) = pair();
        assert!(a.shutdown_writes().unwrap());
        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).unwrap(), 0);
        // the other direction still works
        b.send(b"x", false).unwrap();
        assert_eq!(a.recv(&mut buf).unwrap(), 1);
    }
}
