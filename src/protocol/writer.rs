//! Batched RESP Reply Writer
//!
//! The write side of the protocol. Every `write_*` call appends the RESP
//! encoding of one reply fragment to an in-memory buffer; nothing touches
//! the stream until [`flush`](ReplyWriter::flush). The connection engine
//! flushes exactly once per handled batch, so pipelined commands get their
//! replies in a single write.
//!
//! ## Sticky errors
//!
//! The writer never fails a `write_*` call. Instead, the first flush failure
//! (or an explicit [`close`](ReplyWriter::close)) latches a sticky
//! [`WriteError`]; from then on every append is a silent no-op and every
//! flush returns the latched error. This lets handler code emit replies
//! unconditionally and leave error observation to the engine.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// The sticky write-side fault.
///
/// Cloneable so the same latched value can be returned from every
/// subsequent flush.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The connection was closed on purpose (`Conn::close`).
    #[error("connection closed")]
    Closed,

    /// Flushing to the stream failed; the original error kind and message
    /// are preserved.
    #[error("i/o error: {message}")]
    Io {
        kind: io::ErrorKind,
        message: String,
    },
}

impl WriteError {
    pub(crate) fn from_io(e: &io::Error) -> Self {
        WriteError::Io {
            kind: e.kind(),
            message: e.to_string(),
        }
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            WriteError::Closed => io::Error::new(io::ErrorKind::Other, "connection closed"),
            WriteError::Io { kind, message } => io::Error::new(kind, message),
        }
    }
}

/// The per-connection reply framer.
#[derive(Debug, Default)]
pub struct ReplyWriter {
    buf: Vec<u8>,
    fault: Option<WriteError>,
}

impl ReplyWriter {
    /// Creates a writer with a small default buffer.
    pub fn new() -> Self {
        Self::with_buffer(Vec::with_capacity(crate::WRITE_BUF_CAPACITY))
    }

    /// Creates a writer backed by an existing buffer (typically pooled).
    pub fn with_buffer(buf: Vec<u8>) -> Self {
        Self { buf, fault: None }
    }

    /// Appends a simple string reply: `+<s>\r\n`.
    pub fn write_string(&mut self, s: &str) {
        if self.fault.is_some() {
            return;
        }
        if s == "OK" {
            self.buf.extend_from_slice(b"+OK\r\n");
        } else {
            self.buf.push(b'+');
            self.buf.extend_from_slice(s.as_bytes());
            self.buf.extend_from_slice(b"\r\n");
        }
    }

    /// Appends an error reply: `-<msg>\r\n`.
    pub fn write_error(&mut self, msg: &str) {
        if self.fault.is_some() {
            return;
        }
        self.buf.push(b'-');
        self.buf.extend_from_slice(msg.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Appends an integer reply: `:<n>\r\n`.
    pub fn write_int(&mut self, n: i64) {
        if self.fault.is_some() {
            return;
        }
        self.buf.push(b':');
        self.buf.extend_from_slice(n.to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Appends a bulk string reply: `$<len>\r\n<s>\r\n`.
    pub fn write_bulk(&mut self, s: &str) {
        self.write_bulk_bytes(s.as_bytes());
    }

    /// Appends a binary-safe bulk reply: `$<len>\r\n<bytes>\r\n`.
    pub fn write_bulk_bytes(&mut self, b: &[u8]) {
        if self.fault.is_some() {
            return;
        }
        self.buf.push(b'$');
        self.buf.extend_from_slice(b.len().to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(b);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Appends an array header: `*<count>\r\n`.
    ///
    /// The caller must follow up with exactly `count` replies; the writer
    /// does not check.
    pub fn write_array(&mut self, count: usize) {
        if self.fault.is_some() {
            return;
        }
        self.buf.push(b'*');
        self.buf.extend_from_slice(count.to_string().as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Appends a null bulk reply: `$-1\r\n`.
    pub fn write_null(&mut self) {
        if self.fault.is_some() {
            return;
        }
        self.buf.extend_from_slice(b"$-1\r\n");
    }

    /// Writes the whole buffered region to `w` in one call.
    ///
    /// On success the buffer is truncated (capacity kept). On failure the
    /// error latches and is returned from this and every later flush.
    pub async fn flush<W>(&mut self, w: &mut W) -> Result<(), WriteError>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        if let Err(e) = w.write_all(&self.buf).await {
            let fault = WriteError::from_io(&e);
            self.fault = Some(fault.clone());
            return Err(fault);
        }
        self.buf.clear();
        Ok(())
    }

    /// Latches the `Closed` fault. Buffered bytes are kept so the engine
    /// can drain them once before the connection goes away.
    pub fn close(&mut self) {
        if self.fault.is_none() {
            self.fault = Some(WriteError::Closed);
        }
    }

    /// True once [`close`](Self::close) has latched the fault.
    pub fn is_closed(&self) -> bool {
        matches!(self.fault, Some(WriteError::Closed))
    }

    /// Drains any bytes buffered before `close` latched.
    ///
    /// A latched I/O fault suppresses the drain (the stream already
    /// failed).
    pub(crate) async fn flush_remaining<W>(&mut self, w: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if matches!(self.fault, Some(WriteError::Io { .. })) || self.buf.is_empty() {
            return Ok(());
        }
        w.write_all(&self.buf).await?;
        self.buf.clear();
        Ok(())
    }

    /// Consumes the writer, returning its (cleared) buffer for pooling.
    pub(crate) fn into_buf(mut self) -> Vec<u8> {
        self.buf.clear();
        self.buf
    }

    #[cfg(test)]
    fn buffered(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings_match_the_wire_format() {
        let mut w = ReplyWriter::new();
        w.write_string("OK");
        w.write_string("PONG");
        w.write_error("ERR nope");
        w.write_int(1000);
        w.write_int(-42);
        w.write_bulk("hello");
        w.write_bulk_bytes(b"a\x00b");
        w.write_array(2);
        w.write_null();
        assert_eq!(
            w.buffered(),
            &b"+OK\r\n+PONG\r\n-ERR nope\r\n:1000\r\n:-42\r\n$5\r\nhello\r\n$3\r\na\x00b\r\n*2\r\n$-1\r\n"[..]
        );
    }

    #[test]
    fn ok_fast_path_matches_generic_encoding() {
        let mut fast = ReplyWriter::new();
        fast.write_string("OK");
        // Generic path, same payload.
        let mut generic = ReplyWriter::new();
        generic.buf.push(b'+');
        generic.buf.extend_from_slice(b"OK");
        generic.buf.extend_from_slice(b"\r\n");
        assert_eq!(fast.buffered(), generic.buffered());
    }

    #[tokio::test]
    async fn flush_writes_once_and_truncates() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut w = ReplyWriter::new();
        w.write_null();
        w.flush(&mut a).await.unwrap();
        assert!(w.buffered().is_empty());

        let mut out = [0u8; 8];
        use tokio::io::AsyncReadExt;
        let n = b.read(&mut out).await.unwrap();
        assert_eq!(&out[..n], b"$-1\r\n");

        // Nothing buffered: flush is a no-op.
        w.flush(&mut a).await.unwrap();
    }

    #[tokio::test]
    async fn close_latches_and_later_flushes_report_it() {
        let (mut a, _b) = tokio::io::duplex(64);
        let mut w = ReplyWriter::new();
        w.write_string("OK");
        w.close();
        // Writes after close are dropped.
        w.write_string("IGNORED");
        assert_eq!(w.flush(&mut a).await.unwrap_err(), WriteError::Closed);
        // The pre-close bytes are still there for the engine's drain.
        w.flush_remaining(&mut a).await.unwrap();
        assert!(w.buffered().is_empty());
    }

    #[tokio::test]
    async fn io_failure_sticks() {
        let (mut a, b) = tokio::io::duplex(4);
        drop(b);
        let mut w = ReplyWriter::new();
        w.write_string("PONG");
        let first = w.flush(&mut a).await.unwrap_err();
        assert!(matches!(first, WriteError::Io { .. }));
        // Latched: appending and flushing again reports the same fault.
        w.write_string("MORE");
        assert_eq!(w.flush(&mut a).await.unwrap_err(), first);
    }
}
