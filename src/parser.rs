//! Incremental HTTP/1.1 header parsing.
//!
//! The connection core only depends on the [`Parser`] trait: feed it the
//! accumulated buffer plus the offset already scanned, ask whether the
//! header block is complete, and read back where the body starts.
//! [`HttpParser`] is the stock implementation; request metadata lands in
//! an [`Env`] map using CGI-style keys (`REQUEST_METHOD`, `HTTP_HOST`,
//! `CONTENT_LENGTH`, ...).

use rustc_hash::FxHashMap;
use thiserror::Error;

/// Request metadata: derived fields plus one entry per header.
pub type Env = FxHashMap<String, String>;

pub const REQUEST_METHOD: &str = "REQUEST_METHOD";
pub const REQUEST_PATH: &str = "REQUEST_PATH";
pub const QUERY_STRING: &str = "QUERY_STRING";
pub const SERVER_PROTOCOL: &str = "SERVER_PROTOCOL";
pub const CONTENT_LENGTH: &str = "CONTENT_LENGTH";
pub const CONTENT_TYPE: &str = "CONTENT_TYPE";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid request line")]
    InvalidRequestLine,
    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),
    #[error("request head is not valid utf-8")]
    InvalidEncoding,
}

/// Incremental header parser.
///
/// `execute` is called with the whole accumulated buffer and the offset
/// previous calls already scanned; it returns the new scan offset. Once
/// `finished` reports true, `body_start` is the offset of the first body
/// byte within that same buffer.
pub trait Parser: Send {
    fn execute(&mut self, env: &mut Env, buf: &[u8], offset: usize) -> Result<usize, ParseError>;

    fn finished(&self) -> bool;

    fn body_start(&self) -> usize;

    fn reset(&mut self);
}

/// Stock HTTP/1.1 request-head parser.
///
/// Scans for the `\r\n\r\n` terminator across partial reads, then parses
/// the head in one pass. Header names are mapped to `HTTP_*` keys except
/// `Content-Length` and `Content-Type`, which keep their bare CGI names.
#[derive(Default)]
pub struct HttpParser {
    done: bool,
    body_start: usize,
}

impl HttpParser {
    pub fn new() -> Self {
        HttpParser::default()
    }
}

impl Parser for HttpParser {
    fn execute(&mut self, env: &mut Env, buf: &[u8], offset: usize) -> Result<usize, ParseError> {
        if self.done {
            return Ok(offset);
        }

        // The terminator may straddle two reads, so back up a few bytes
        // before scanning the new data.
        let from = offset.saturating_sub(3);
        match find_terminator(&buf[from..]) {
            Some(pos) => {
                let head_end = from + pos;
                parse_head(env, &buf[..head_end])?;
                self.done = true;
                self.body_start = head_end + 4;
                Ok(self.body_start)
            }
            None => Ok(buf.len()),
        }
    }

    fn finished(&self) -> bool {
        self.done
    }

    fn body_start(&self) -> usize {
        self.body_start
    }

    fn reset(&mut self) {
        self.done = false;
        self.body_start = 0;
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(env: &mut Env, head: &[u8]) -> Result<(), ParseError> {
    let head = std::str::from_utf8(head).map_err(|_| ParseError::InvalidEncoding)?;
    let mut lines = head.split("\r\n");

    let request_line = lines.next().ok_or(ParseError::InvalidRequestLine)?;
    parse_request_line(env, request_line)?;

    for line in lines {
        parse_header_line(env, line)?;
    }
    Ok(())
}

fn parse_request_line(env: &mut Env, line: &str) -> Result<(), ParseError> {
    let mut parts = line.split(' ');
    let method = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let target = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    let version = parts.next().ok_or(ParseError::InvalidRequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::InvalidRequestLine);
    }

    if method.is_empty()
        || !method
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b == b'-' || b == b'_')
    {
        return Err(ParseError::InvalidRequestLine);
    }
    if target.is_empty() || !version.starts_with("HTTP/") {
        return Err(ParseError::InvalidRequestLine);
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };

    env.insert(REQUEST_METHOD.to_string(), method.to_string());
    env.insert(REQUEST_PATH.to_string(), path.to_string());
    env.insert(QUERY_STRING.to_string(), query.to_string());
    env.insert(SERVER_PROTOCOL.to_string(), version.to_string());
    Ok(())
}

fn parse_header_line(env: &mut Env, line: &str) -> Result<(), ParseError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;
    if name.is_empty() || name.bytes().any(|b| b == b' ' || b == b'\t') {
        return Err(ParseError::InvalidHeader(line.to_string()));
    }
    let value = value.trim();

    let key = if name.eq_ignore_ascii_case("content-length") {
        CONTENT_LENGTH.to_string()
    } else if name.eq_ignore_ascii_case("content-type") {
        CONTENT_TYPE.to_string()
    } else {
        let mut key = String::with_capacity(name.len() + 5);
        key.push_str("HTTP_");
        for b in name.bytes() {
            key.push(match b {
                b'-' => '_',
                other => other.to_ascii_uppercase() as char,
            });
        }
        key
    };

    // Repeated headers are joined, per RFC 9110 field-line semantics.
    match env.get_mut(&key) {
        Some(existing) => {
            existing.push_str(", ");
            existing.push_str(value);
        }
        None => {
            env.insert(key, value.to_string());
        }
    }
    Ok(())
}
