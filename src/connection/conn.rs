//! The per-connection facade handed to application handlers.

use std::any::Any;
use std::io;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::connection::hijack::{Hijack, HijackedConn};
use crate::protocol::{CommandReader, ProtocolError, ReplyWriter};

/// The terminal error of a connection, as seen by the close observer.
///
/// Clean disconnects, handler-initiated closes, and hijacks are not errors;
/// the observer receives `None` for those.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The client violated the wire protocol; an `-ERR` reply was attempted
    /// before closing.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Reading or flushing the stream failed, including EOF in the middle
    /// of a command.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One client connection.
///
/// Owns the stream, the command reader, and the reply writer. Handlers
/// receive `&mut Conn` and interact with it synchronously: writes buffer
/// locally and hit the wire when the engine flushes after the handler
/// returns, which is what batches pipelined replies into a single write.
///
/// # Example
///
/// ```ignore
/// server handler:
/// |conn: &mut Conn, batch: Vec<Vec<String>>| {
///     for cmd in batch {
///         match cmd[0].to_ascii_lowercase().as_str() {
///             "ping" => conn.write_string("PONG"),
///             "quit" => {
///                 conn.write_string("OK");
///                 conn.close();
///             }
///             _ => conn.write_error("ERR unknown command"),
///         }
///     }
/// }
/// ```
pub struct Conn {
    pub(crate) id: u64,
    pub(crate) stream: TcpStream,
    pub(crate) reader: CommandReader,
    pub(crate) writer: ReplyWriter,
    pub(crate) addr: String,
    pub(crate) context: Option<Box<dyn Any + Send>>,
    pub(crate) hijack: Option<oneshot::Sender<HijackedConn>>,
}

impl Conn {
    pub(crate) fn new(
        id: u64,
        stream: TcpStream,
        addr: String,
        read_buf: Vec<u8>,
        write_buf: Vec<u8>,
    ) -> Self {
        Self {
            id,
            stream,
            reader: CommandReader::with_buffer(read_buf),
            writer: ReplyWriter::with_buffer(write_buf),
            addr,
            context: None,
            hijack: None,
        }
    }

    /// The remote address of the client, snapshotted at accept time.
    pub fn remote_addr(&self) -> &str {
        &self.addr
    }

    /// Closes the connection once the current handler invocation returns.
    ///
    /// Replies written before this call are still flushed; the close
    /// observer sees no error.
    pub fn close(&mut self) {
        self.writer.close();
    }

    /// Appends a simple string reply: `+<s>\r\n`.
    pub fn write_string(&mut self, s: &str) {
        self.writer.write_string(s);
    }

    /// Appends an error reply: `-<msg>\r\n`.
    pub fn write_error(&mut self, msg: &str) {
        self.writer.write_error(msg);
    }

    /// Appends a bulk string reply: `$<len>\r\n<s>\r\n`.
    pub fn write_bulk(&mut self, s: &str) {
        self.writer.write_bulk(s);
    }

    /// Appends a binary-safe bulk reply.
    pub fn write_bulk_bytes(&mut self, b: &[u8]) {
        self.writer.write_bulk_bytes(b);
    }

    /// Appends an integer reply: `:<n>\r\n`.
    pub fn write_int(&mut self, n: i64) {
        self.writer.write_int(n);
    }

    /// Appends an array header: `*<count>\r\n`.
    ///
    /// Must be followed by exactly `count` sub-replies:
    ///
    /// ```ignore
    /// conn.write_array(2);
    /// conn.write_bulk("item 1");
    /// conn.write_bulk("item 2");
    /// ```
    pub fn write_array(&mut self, count: usize) {
        self.writer.write_array(count);
    }

    /// Appends a null bulk reply: `$-1\r\n`.
    pub fn write_null(&mut self) {
        self.writer.write_null();
    }

    /// Stores a user-defined value on the connection.
    ///
    /// The engine never touches it; typical use is per-session state set up
    /// by the accept filter and read back by the handler.
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

    /// Advisory read-buffer sizing: grows the read buffer so at least `n`
    /// bytes fit before the parser has to resize again.
    pub fn set_read_buffer(&mut self, n: usize) {
        self.reader.ensure_capacity(n);
    }

    /// Detaches this connection from managed dispatch.
    ///
    /// Returns a future resolving to the raw [`HijackedConn`] once the
    /// engine finishes the current invocation (flushing any replies written
    /// so far) and steps aside without closing the stream. Useful for
    /// pub/sub style command flows:
    ///
    /// ```ignore
    /// let pending = conn.hijack();
    /// tokio::spawn(async move {
    ///     let mut raw = pending.await?;
    ///     loop {
    ///         let cmd = raw.read_command().await?;
    ///         raw.write_string("OK");
    ///         raw.flush().await?;
    ///     }
    /// });
    /// ```
    pub fn hijack(&mut self) -> Hijack {
        let (tx, rx) = oneshot::channel();
        self.hijack = Some(tx);
        Hijack::new(rx)
    }
}
