//! Connection-handling core for a standalone HTTP server.
//!
//! One reactor thread multiplexes many client sockets without blocking:
//! it assembles complete requests from partial reads, enforces
//! per-connection deadlines, and hands finished requests to an external
//! worker pool. See [`connection::Connection`] for the per-socket state
//! machine and [`reactor::Reactor`] for the event loop.

use std::time::Duration;

pub mod body;
pub mod connection;
pub mod error;
pub mod events;
pub mod parser;
pub mod reactor;
pub mod socket;

pub use body::Body;
pub use connection::Connection;
pub use error::Error;
pub use events::{EventSink, LogEvents, NullEvents};
pub use parser::{Env, HttpParser, ParseError, Parser};
pub use reactor::{Dispatch, Handle, Reactor};
pub use socket::{PlainSocket, Socket, SocketError};

/// Tuning knobs. Defaults are conservative; every value can be
/// overridden before constructing connections or the reactor.
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    /// A header block that grows past this without completing fails the
    /// request with a 400.
    pub max_header_bytes: usize,
    /// Declared body bytes beyond this spool to a temp file instead of
    /// accumulating in memory.
    pub max_body_bytes: usize,
    /// Upper bound for a single socket read.
    pub chunk_size: usize,
    /// Readiness probe window for the keep-alive fast path in
    /// [`Connection::reset`](connection::Connection::reset).
    pub fast_ka_timeout: Duration,
    /// Poll timeout when no connection carries a deadline.
    pub default_sleep: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_header_bytes: 112 * 1024,
            max_body_bytes: 112 * 1024,
            chunk_size: 16 * 1024,
            fast_ka_timeout: Duration::from_millis(200),
            default_sleep: Duration::from_secs(5),
        }
    }
}
