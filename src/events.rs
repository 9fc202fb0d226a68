//! Observability sink for per-connection failures.
//!
//! Purely informational: the reactor reports handshake and parse
//! failures here and moves on; nothing a sink does affects control flow.

use std::net::SocketAddr;

use log::warn;

use crate::error::Error;
use crate::parser::{self, Env};

pub trait EventSink: Send {
    /// Encrypted-transport negotiation failed on a watched connection.
    fn ssl_error(&self, _peer: Option<SocketAddr>, _cert: Option<&[u8]>, _error: &Error) {}

    /// A watched connection sent something that is not HTTP.
    fn parse_error(&self, _env: &Env, _error: &Error) {}
}

/// Discards every event.
pub struct NullEvents;

impl EventSink for NullEvents {}

/// Reports events through the `log` facade.
pub struct LogEvents;

impl EventSink for LogEvents {
    fn ssl_error(&self, peer: Option<SocketAddr>, _cert: Option<&[u8]>, error: &Error) {
        warn!("ssl handshake failed (peer={:?}): {}", peer, error);
    }

    fn parse_error(&self, env: &Env, error: &Error) {
        warn!(
            "malformed request (method={:?} path={:?}): {}",
            env.get(parser::REQUEST_METHOD),
            env.get(parser::REQUEST_PATH),
            error
        );
    }
}
