//! Request body sinks.
//!
//! Bodies land in one of three places depending on the declared content
//! length: nowhere (no body), an in-memory buffer, or a spooled temp
//! file for bodies too large to hold in memory. The selection logic
//! lives in `Connection::setup_body`; this module only provides the
//! tagged sink.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// Where body bytes accumulate for the current request.
pub enum Body {
    /// No body. Stateless, shared by every body-less request.
    Empty,
    /// In-memory buffer for bodies below the spooling threshold.
    Buffer(Cursor<Vec<u8>>),
    /// Anonymous temp file for large bodies.
    Spooled(File),
}

impl Body {
    /// Allocates an anonymous spool file.
    pub fn spooled() -> io::Result<Body> {
        Ok(Body::Spooled(tempfile::tempfile()?))
    }

    pub fn buffer(capacity: usize) -> Body {
        Body::Buffer(Cursor::new(Vec::with_capacity(capacity)))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    pub fn is_spooled(&self) -> bool {
        matches!(self, Body::Spooled(_))
    }

    /// Seeks back to the start so the worker can read the body from the
    /// beginning.
    pub fn rewind(&mut self) -> io::Result<()> {
        match self {
            Body::Empty => Ok(()),
            Body::Buffer(cursor) => {
                cursor.set_position(0);
                Ok(())
            }
            Body::Spooled(file) => file.seek(SeekFrom::Start(0)).map(|_| ()),
        }
    }

    /// Drops any accumulated bytes. Used when the peer disappears
    /// mid-body and the request is being abandoned.
    pub fn close(&mut self) {
        *self = Body::Empty;
    }

    /// Reads everything from the current position.
    pub fn read_all(&mut self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out)?;
        Ok(out)
    }
}

impl Write for Body {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            // Null-sink semantics: accept and discard.
            Body::Empty => Ok(buf.len()),
            Body::Buffer(cursor) => cursor.write(buf),
            Body::Spooled(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Body::Empty => Ok(()),
            Body::Buffer(cursor) => cursor.flush(),
            Body::Spooled(file) => file.flush(),
        }
    }
}

impl Read for Body {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Body::Empty => Ok(0),
            Body::Buffer(cursor) => cursor.read(buf),
            Body::Spooled(file) => file.read(buf),
        }
    }
}
