//! Raw connection ownership after a handler detaches.
//!
//! A handler that calls [`Conn::hijack`](crate::Conn::hijack) asks the
//! engine to stop managed dispatch for that connection. The engine finishes
//! the triggering invocation (including the flush), exits its loop without
//! closing the stream, and hands the connection's parts over through a
//! oneshot channel. From then on the application owns the socket and drives
//! it with the synchronous write calls plus the async
//! [`read_command`](HijackedConn::read_command) /
//! [`flush`](HijackedConn::flush) below.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::connection::conn::Conn;
use crate::protocol::{CommandReader, ReadError, ReplyWriter, WriteError};

/// The connection terminated before the hijack handoff completed (for
/// example, the flush after the triggering invocation failed).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connection ended before hijack handoff")]
pub struct HijackError;

/// Future returned by [`Conn::hijack`](crate::Conn::hijack); resolves to
/// the detached connection once the engine steps aside.
#[derive(Debug)]
pub struct Hijack {
    rx: oneshot::Receiver<HijackedConn>,
}

impl Hijack {
    pub(crate) fn new(rx: oneshot::Receiver<HijackedConn>) -> Self {
        Self { rx }
    }
}

impl Future for Hijack {
    type Output = Result<HijackedConn, HijackError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|res| res.map_err(|_| HijackError))
    }
}

/// An unmanaged connection: the stream, parser, and writer of a hijacked
/// [`Conn`], owned by application code.
pub struct HijackedConn {
    stream: TcpStream,
    reader: CommandReader,
    writer: ReplyWriter,
    addr: String,
    context: Option<Box<dyn Any + Send>>,
    pending: VecDeque<Vec<Bytes>>,
}

impl std::fmt::Debug for HijackedConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HijackedConn")
            .field("stream", &self.stream)
            .field("addr", &self.addr)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl HijackedConn {
    pub(crate) fn from_conn(conn: Conn) -> Self {
        let Conn {
            stream,
            reader,
            writer,
            addr,
            context,
            ..
        } = conn;
        Self {
            stream,
            reader,
            writer,
            addr,
            context,
            pending: VecDeque::new(),
        }
    }

    /// Reads the next command, arguments as strings.
    pub async fn read_command(&mut self) -> Result<Vec<String>, ReadError> {
        let cmd = self.read_command_bytes().await?;
        Ok(cmd
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect())
    }

    /// Reads the next command, arguments as independent byte copies.
    ///
    /// Commands already decoded in an earlier batch are drained first; only
    /// then does the parser read more from the stream.
    pub async fn read_command_bytes(&mut self) -> Result<Vec<Bytes>, ReadError> {
        loop {
            if let Some(cmd) = self.pending.pop_front() {
                return Ok(cmd);
            }
            let batch = self.reader.read_commands(&mut self.stream).await?;
            let copied: Vec<Vec<Bytes>> = batch
                .iter()
                .map(|cmd| cmd.iter().map(|arg| Bytes::copy_from_slice(arg)).collect())
                .collect();
            self.pending.extend(copied);
        }
    }

    /// Writes everything buffered since the last flush to the stream.
    pub async fn flush(&mut self) -> Result<(), WriteError> {
        self.writer.flush(&mut self.stream).await
    }

    /// Flushes any buffered replies, then shuts the connection down.
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.flush_remaining(&mut self.stream).await?;
        self.writer.close();
        self.stream.shutdown().await
    }

    /// The remote address of the client.
    pub fn remote_addr(&self) -> &str {
        &self.addr
    }

    /// Appends a simple string reply: `+<s>\r\n`.
    pub fn write_string(&mut self, s: &str) {
        self.writer.write_string(s);
    }

    /// Appends an error reply: `-<msg>\r\n`.
    pub fn write_error(&mut self, msg: &str) {
        self.writer.write_error(msg);
    }

    /// Appends a bulk string reply.
    pub fn write_bulk(&mut self, s: &str) {
        self.writer.write_bulk(s);
    }

    /// Appends a binary-safe bulk reply.
    pub fn write_bulk_bytes(&mut self, b: &[u8]) {
        self.writer.write_bulk_bytes(b);
    }

    /// Appends an integer reply.
    pub fn write_int(&mut self, n: i64) {
        self.writer.write_int(n);
    }

    /// Appends an array header; follow with exactly `count` sub-replies.
    pub fn write_array(&mut self, count: usize) {
        self.writer.write_array(count);
    }

    /// Appends a null bulk reply.
    pub fn write_null(&mut self) {
        self.writer.write_null();
    }

    /// Stores a user-defined value on the connection.
    pub fn set_context<T: Any + Send>(&mut self, value: T) {
        self.context = Some(Box::new(value));
    }

    /// Borrows the context slot, downcast to `T`.
    pub fn context<T: Any>(&self) -> Option<&T> {
        self.context.as_deref().and_then(|c| c.downcast_ref())
    }

    /// Mutably borrows the context slot, downcast to `T`.
    pub fn context_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.context.as_deref_mut().and_then(|c| c.downcast_mut())
    }

    /// Advisory read-buffer sizing, as on [`Conn`](crate::Conn).
    pub fn set_read_buffer(&mut self, n: usize) {
        self.reader.ensure_capacity(n);
    }
}
