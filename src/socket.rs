//! Transport seam between the reactor and whatever carries the bytes.
//!
//! The reactor and [`Connection`](crate::connection::Connection) never
//! branch on a concrete transport type; they only see the [`Socket`]
//! capability trait. Plain TCP is provided here, an encrypted variant
//! only has to map its handshake failures to
//! [`SocketError::Handshake`] and the rest of the core stays unchanged.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use thiserror::Error;

/// Outcome of a socket operation that did not produce bytes.
#[derive(Error, Debug)]
pub enum SocketError {
    /// No data available right now; retry on the next readiness event.
    #[error("operation would block")]
    WouldBlock,

    /// Encrypted-transport negotiation failed. Distinguished from plain
    /// I/O errors so the reactor can report it with peer context.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Hard transport failure.
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => SocketError::WouldBlock,
            _ => SocketError::Io(err),
        }
    }
}

/// A non-blocking byte stream with a pollable descriptor.
///
/// `read` returning `Ok(0)` means the peer closed the stream.
pub trait Socket: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError>;

    fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError>;

    /// Raw descriptor used for readiness polling.
    fn raw_fd(&self) -> RawFd;

    /// Orderly close; close-time errors are ignored.
    fn close(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// DER-encoded peer certificate, when the transport has one.
    fn peer_certificate(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Plain (unencrypted) socket over any non-blocking byte stream.
pub struct PlainSocket<T> {
    inner: T,
    peer: Option<SocketAddr>,
}

impl<T: Read + Write + AsRawFd + Send> PlainSocket<T> {
    /// Wraps a stream that is already in non-blocking mode.
    pub fn new(inner: T) -> Self {
        PlainSocket { inner, peer: None }
    }
}

impl PlainSocket<TcpStream> {
    /// Wraps a freshly accepted TCP stream, switching it to non-blocking
    /// mode and recording the peer address.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr().ok();
        Ok(PlainSocket {
            inner: stream,
            peer,
        })
    }
}

impl<T: Read + Write + AsRawFd + Send> Socket for PlainSocket<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        loop {
            match self.inner.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SocketError::from(e)),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        loop {
            match self.inner.write(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(SocketError::from(e)),
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    fn close(&mut self) {
        // Dropping the stream closes the descriptor; flush is best-effort.
        let _ = self.inner.flush();
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// One-shot readiness probe on a raw descriptor.
///
/// Used for the keep-alive fast path (zero/short timeout) and by
/// [`Connection::finish`](crate::connection::Connection::finish) to wait
/// for data outside the reactor. `timeout` of `None` blocks until ready.
pub fn poll_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1);
    poll.registry()
        .register(&mut SourceFd(&fd), Token(0), Interest::READABLE)?;
    loop {
        match poll.poll(&mut events, timeout) {
            Ok(()) => return Ok(!events.is_empty()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Like [`poll_readable`], for write readiness. Used by response writers
/// that want to ride out a transient `WouldBlock`.
pub fn poll_writable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1);
    poll.registry()
        .register(&mut SourceFd(&fd), Token(0), Interest::WRITABLE)?;
    loop {
        match poll.poll(&mut events, timeout) {
            Ok(()) => return Ok(!events.is_empty()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
