use std::io;

use thiserror::Error;

use crate::parser::ParseError;

/// Everything that can go wrong while assembling a request.
///
/// The reactor maps each variant onto a per-connection outcome: transport
/// failures are dropped silently, protocol violations get a 400, anything
/// unexpected gets a 500. None of these ever escape the poll loop.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level read/write failure. Fatal for the connection; the
    /// peer is presumed gone, so no response is written.
    #[error("connection error detected during read: {0}")]
    Connection(#[source] io::Error),

    /// The header block grew past the configured limit without completing.
    #[error("header is longer than allowed, aborting client early")]
    HeaderTooLarge,

    /// The client doesn't know HTTP well.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Encrypted-transport negotiation failed; there is no HTTP context
    /// yet, so the connection is closed without a response.
    #[error("transport handshake failed: {0}")]
    Handshake(String),

    /// The peer closed the socket before the declared body arrived. The
    /// connection is marked ready so the caller can respond and close,
    /// but the request must be treated as truncated.
    #[error("peer closed the socket before the declared body arrived")]
    PrematureEof,

    /// The socket was handed off for a protocol upgrade; the request
    /// assembly path must not touch it anymore.
    #[error("connection has been hijacked")]
    Hijacked,

    /// Local I/O failure outside the socket itself (body spooling, probe
    /// setup). Treated as an internal server error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
