//! Per-socket request assembly.
//!
//! A [`Connection`] owns one socket, one parser and the bytes read so
//! far, and turns readiness notifications into "feed me again" calls
//! until a complete request (header block plus body) has been put
//! together. It never blocks: every read either makes progress, reports
//! "not yet", or fails the connection.

use std::fmt;
use std::io::{self, Cursor, Write};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::body::Body;
use crate::error::Error;
use crate::parser::{self, Env, HttpParser, Parser};
use crate::socket::{self, Socket, SocketError};
use crate::Settings;

/// Fixed responses written on the error paths. Built once at startup;
/// every field is a complete response with headers and a short body.
struct CannedResponses {
    bad_request: Vec<u8>,
    request_timeout: Vec<u8>,
    server_error: Vec<u8>,
}

static RESPONSES: Lazy<CannedResponses> = Lazy::new(|| CannedResponses {
    bad_request: canned("400 Bad Request", "Malformed request"),
    request_timeout: canned("408 Request Timeout", "Request timeout"),
    server_error: canned("500 Internal Server Error", "Internal server error"),
});

fn canned(status: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
    .into_bytes()
}

/// Outcome of one socket read while assembling a request.
enum Feed {
    /// Request fully assembled.
    Ready,
    /// Bytes consumed; more may already be buffered in the kernel.
    Progress,
    /// The socket ran dry.
    WouldBlock,
}

/// Request-assembly state machine for one client socket.
pub struct Connection {
    socket: Option<Box<dyn Socket>>,
    parser: Box<dyn Parser>,
    proto_env: Option<Env>,
    env: Env,

    /// Bytes read from the socket but not yet claimed by a request.
    pending: Option<Vec<u8>>,
    /// How much of `pending` the parser has already scanned.
    parsed_offset: usize,
    reading_header: bool,
    body: Body,
    body_remain: usize,
    ready: bool,
    hijacked: bool,

    timeout_at: Option<Instant>,

    created_at: Instant,
    last_reset_at: Instant,
    finished_at: Option<Instant>,
    resets: u64,
    requests_served: u64,

    settings: Settings,
}

impl Connection {
    /// Wraps an open socket. `proto_env` is a prototype metadata snapshot
    /// cloned into each request's env; the prototype itself is never
    /// mutated.
    pub fn new(socket: Box<dyn Socket>, proto_env: Option<Env>) -> Self {
        Connection::with_parser(socket, Box::new(HttpParser::new()), proto_env, Settings::default())
    }

    pub fn with_settings(socket: Box<dyn Socket>, proto_env: Option<Env>, settings: Settings) -> Self {
        Connection::with_parser(socket, Box::new(HttpParser::new()), proto_env, settings)
    }

    pub fn with_parser(
        socket: Box<dyn Socket>,
        parser: Box<dyn Parser>,
        proto_env: Option<Env>,
        settings: Settings,
    ) -> Self {
        let now = Instant::now();
        let env = proto_env.clone().unwrap_or_default();
        Connection {
            socket: Some(socket),
            parser,
            proto_env,
            env,
            pending: None,
            parsed_offset: 0,
            reading_header: true,
            body: Body::Empty,
            body_remain: 0,
            ready: false,
            hijacked: false,
            timeout_at: None,
            created_at: now,
            last_reset_at: now,
            finished_at: None,
            resets: 0,
            requests_served: 0,
            settings,
        }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// True once the header block has been read and a body is still
    /// being streamed (or just finished). Drives the 408-on-timeout
    /// decision: a connection that never sent a header is closed
    /// silently instead.
    pub fn in_data_phase(&self) -> bool {
        !self.reading_header
    }

    pub fn timeout_at(&self) -> Option<Instant> {
        self.timeout_at
    }

    /// Arms the deadline used by the reactor's timeout sweep.
    pub fn set_timeout(&mut self, after: Duration) {
        self.timeout_at = Some(Instant::now() + after);
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.raw_fd())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.peer_addr())
    }

    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.socket.as_ref().and_then(|s| s.peer_certificate())
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_reset_at(&self) -> Instant {
        self.last_reset_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub fn resets(&self) -> u64 {
        self.resets
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served
    }

    /// Transfers the raw socket out for a protocol upgrade. After this,
    /// every feed/reset path refuses to touch the connection.
    pub fn hijack(&mut self) -> Option<Box<dyn Socket>> {
        self.hijacked = true;
        self.socket.take()
    }

    /// Direct socket access for response writing by the worker pool.
    pub fn socket_mut(&mut self) -> Option<&mut (dyn Socket + 'static)> {
        self.socket.as_deref_mut()
    }

    /// Assembles as much of the request as the kernel already holds.
    /// Returns `Ok(true)` once the request is fully assembled, `Ok(false)`
    /// when the socket ran dry first. Reads until `WouldBlock`: readiness
    /// notifications are edge-triggered, so bytes left buffered would
    /// never raise another event.
    pub fn try_to_finish(&mut self) -> Result<bool, Error> {
        if self.hijacked {
            return Err(Error::Hijacked);
        }
        if self.ready {
            return Ok(true);
        }
        loop {
            match self.feed_once()? {
                Feed::Ready => return Ok(true),
                Feed::WouldBlock => return Ok(false),
                Feed::Progress => {}
            }
        }
    }

    fn feed_once(&mut self) -> Result<Feed, Error> {
        if !self.reading_header {
            return self.read_body();
        }

        let sock = self.socket.as_mut().ok_or(Error::Hijacked)?;
        let mut chunk = vec![0u8; self.settings.chunk_size];
        let n = match sock.read(&mut chunk) {
            Ok(0) => {
                return Err(Error::Connection(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed during header read",
                )))
            }
            Ok(n) => n,
            Err(SocketError::WouldBlock) => return Ok(Feed::WouldBlock),
            Err(SocketError::Handshake(msg)) => return Err(Error::Handshake(msg)),
            Err(SocketError::Io(e)) => return Err(Error::Connection(e)),
        };

        self.pending
            .get_or_insert_with(Vec::new)
            .extend_from_slice(&chunk[..n]);
        if self.advance_parser()? {
            Ok(Feed::Ready)
        } else {
            Ok(Feed::Progress)
        }
    }

    /// Drives the connection to completion, blocking between reads.
    /// For callers that are not the reactor.
    pub fn finish(&mut self) -> Result<(), Error> {
        while !self.ready {
            if !self.try_to_finish()? {
                let fd = self.socket.as_ref().ok_or(Error::Hijacked)?.raw_fd();
                socket::poll_readable(fd, None)?;
            }
        }
        Ok(())
    }

    /// Zero-timeout probe plus one feed pass. Lets a producer skip the
    /// reactor round-trip when the request bytes are already queued.
    pub fn eagerly_finish(&mut self) -> Result<bool, Error> {
        if self.ready {
            return Ok(true);
        }
        let fd = self.socket.as_ref().ok_or(Error::Hijacked)?.raw_fd();
        if !socket::poll_readable(fd, Some(Duration::ZERO))? {
            return Ok(false);
        }
        self.try_to_finish()
    }

    /// Prepares for the next keep-alive request. If pipelined bytes are
    /// already buffered they are re-parsed immediately, possibly
    /// completing the next request without any socket read. With
    /// `fast_check`, an otherwise idle connection is probed briefly so
    /// an already-ready keep-alive peer avoids re-registration with the
    /// reactor.
    pub fn reset(&mut self, fast_check: bool) -> Result<bool, Error> {
        if self.hijacked {
            return Err(Error::Hijacked);
        }
        self.last_reset_at = Instant::now();
        self.resets += 1;

        self.parser.reset();
        self.reading_header = true;
        self.env = self.proto_env.clone().unwrap_or_default();
        self.body = Body::Empty;
        self.body_remain = 0;
        self.parsed_offset = 0;
        self.ready = false;
        self.timeout_at = None;

        if self.pending.is_some() {
            return self.advance_parser();
        }

        if fast_check {
            let fd = self.socket.as_ref().ok_or(Error::Hijacked)?.raw_fd();
            if socket::poll_readable(fd, Some(self.settings.fast_ka_timeout))? {
                return self.try_to_finish();
            }
        }
        Ok(false)
    }

    /// Closes the socket, ignoring close-time errors.
    pub fn close(&mut self) {
        self.finished_at = Some(Instant::now());
        if let Some(mut sock) = self.socket.take() {
            sock.close();
        }
    }

    pub fn write_bad_request(&mut self) {
        self.write_canned(&RESPONSES.bad_request);
    }

    pub fn write_timeout(&mut self) {
        self.write_canned(&RESPONSES.request_timeout);
    }

    pub fn write_server_error(&mut self) {
        self.write_canned(&RESPONSES.server_error);
    }

    fn advance_parser(&mut self) -> Result<bool, Error> {
        let buf = self.pending.as_deref().unwrap_or(&[]);
        self.parsed_offset = self.parser.execute(&mut self.env, buf, self.parsed_offset)?;

        if self.parser.finished() {
            self.setup_body()
        } else if self.parsed_offset >= self.settings.max_header_bytes {
            Err(Error::HeaderTooLarge)
        } else {
            Ok(false)
        }
    }

    /// Chooses the body strategy from the declared content length.
    /// An absent or unparsable length means no body.
    fn setup_body(&mut self) -> Result<bool, Error> {
        let body_start = self.parser.body_start();
        let buf = self.pending.take().unwrap_or_default();
        let buffered = &buf[body_start.min(buf.len())..];
        self.parsed_offset = 0;

        let declared = self
            .env
            .get(parser::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse::<usize>().ok());

        let declared = match declared {
            Some(n) => n,
            None => {
                // No body; anything trailing the header block is the
                // next pipelined request.
                self.carry_over(buffered);
                self.body = Body::Empty;
                self.finish_request();
                return Ok(true);
            }
        };

        if buffered.len() >= declared {
            self.body = Body::Buffer(Cursor::new(buffered[..declared].to_vec()));
            self.carry_over(&buffered[declared..]);
            self.finish_request();
            return Ok(true);
        }

        let remain = declared - buffered.len();
        self.body = if remain > self.settings.max_body_bytes {
            Body::spooled()?
        } else {
            Body::buffer(declared)
        };
        self.body.write_all(buffered)?;
        self.body_remain = remain;
        self.reading_header = false;
        Ok(false)
    }

    fn read_body(&mut self) -> Result<Feed, Error> {
        let want = self.body_remain.min(self.settings.chunk_size);
        let mut chunk = vec![0u8; want];

        let sock = self.socket.as_mut().ok_or(Error::Hijacked)?;
        let n = match sock.read(&mut chunk) {
            Ok(0) => {
                // Peer went away mid-body. Mark ready so the caller can
                // respond and close, but flag the truncation.
                self.body.close();
                self.pending = None;
                self.finish_request();
                return Err(Error::PrematureEof);
            }
            Ok(n) => n,
            Err(SocketError::WouldBlock) => return Ok(Feed::WouldBlock),
            Err(SocketError::Handshake(msg)) => return Err(Error::Handshake(msg)),
            Err(SocketError::Io(e)) => return Err(Error::Connection(e)),
        };

        self.body.write_all(&chunk[..n])?;
        self.body_remain -= n;

        if self.body_remain == 0 {
            self.body.rewind()?;
            self.finish_request();
            return Ok(Feed::Ready);
        }
        Ok(Feed::Progress)
    }

    fn carry_over(&mut self, residue: &[u8]) {
        self.pending = if residue.is_empty() {
            None
        } else {
            Some(residue.to_vec())
        };
    }

    fn finish_request(&mut self) {
        self.requests_served += 1;
        self.ready = true;
    }

    /// Best-effort canned write; the connection is being abandoned, so
    /// every failure is swallowed. A single transient `WouldBlock` is
    /// ridden out with a short write-readiness probe.
    fn write_canned(&mut self, bytes: &[u8]) {
        let fd = match self.socket.as_ref() {
            Some(sock) => sock.raw_fd(),
            None => return,
        };
        let mut offset = 0;
        let mut probed = false;
        while offset < bytes.len() {
            let sock = match self.socket.as_mut() {
                Some(sock) => sock,
                None => return,
            };
            match sock.write(&bytes[offset..]) {
                Ok(0) => return,
                Ok(n) => offset += n,
                Err(SocketError::WouldBlock) if !probed => {
                    probed = true;
                    match socket::poll_writable(fd, Some(Duration::from_millis(100))) {
                        Ok(true) => continue,
                        _ => return,
                    }
                }
                Err(_) => return,
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("ready", &self.ready)
            .field("reading_header", &self.reading_header)
            .field("hijacked", &self.hijacked)
            .field("resets", &self.resets)
            .field("requests_served", &self.requests_served)
            .field("timeout_at", &self.timeout_at)
            .finish()
    }
}
