//! Connection Lifecycle Engine
//!
//! Runs one loop per accepted connection: read a batch of commands, hand
//! the whole batch to the application handler, flush the buffered replies
//! in a single write, repeat. The loop ends when the client disconnects,
//! the handler closes the connection, the stream fails, the client breaks
//! protocol framing (after a best-effort `-ERR` reply), or the handler
//! hijacks the connection.
//!
//! ## Copy before exposure
//!
//! The parser returns argument slices that borrow its read buffer; the next
//! read would invalidate them. The engine therefore copies every argument
//! before the handler sees it: `String`s for the string-form handler,
//! independent [`Bytes`] for the bytes form. Handlers may retain arguments
//! for as long as they like.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::connection::conn::{Conn, ConnError};
use crate::connection::hijack::HijackedConn;
use crate::protocol::{Command, ReadError};
use crate::server::ServerInner;

/// The application's batch handler, in one of its two forms. Exactly one
/// form is active per server.
pub(crate) enum BatchHandler {
    Strings(Box<dyn Fn(&mut Conn, Vec<Vec<String>>) + Send + Sync>),
    Bytes(Box<dyn Fn(&mut Conn, Vec<Vec<Bytes>>) + Send + Sync>),
}

/// Decides per connection whether to serve it; `false` drops it silently.
pub(crate) type AcceptFilter = Box<dyn Fn(&mut Conn) -> bool + Send + Sync>;

/// Observes connection teardown with the terminal error, if any.
pub(crate) type CloseObserver = Box<dyn Fn(&mut Conn, Option<&ConnError>) + Send + Sync>;

/// A batch copied out of the parser buffer, shaped for the active handler.
enum OwnedBatch {
    Strings(Vec<Vec<String>>),
    Bytes(Vec<Vec<Bytes>>),
}

/// Why the engine loop ended.
enum Exit {
    /// Clean disconnect on a command boundary.
    Eof,
    /// The handler called `Conn::close`.
    Closed,
    /// The handler detached the connection; the stream stays open.
    Hijacked,
    /// Protocol violation or stream failure.
    Err(ConnError),
}

/// Entry point of a connection task: runs the engine loop, then tears the
/// connection down (or hands it off, if hijacked).
pub(crate) async fn drive_connection(
    inner: Arc<ServerInner>,
    mut conn: Conn,
    mut shutdown: broadcast::Receiver<()>,
) {
    debug!(client = %conn.addr, "client connected");
    let exit = serve_batches(&inner, &mut conn, &mut shutdown).await;
    match &exit {
        Exit::Eof => debug!(client = %conn.addr, "client disconnected"),
        Exit::Closed => debug!(client = %conn.addr, "connection closed by handler"),
        Exit::Hijacked => debug!(client = %conn.addr, "connection hijacked"),
        Exit::Err(e) => debug!(client = %conn.addr, error = %e, "connection ended"),
    }
    finish(&inner, conn, exit).await;
}

/// The read → dispatch → flush loop.
async fn serve_batches(
    inner: &ServerInner,
    conn: &mut Conn,
    shutdown: &mut broadcast::Receiver<()>,
) -> Exit {
    loop {
        if conn.hijack.is_some() {
            return Exit::Hijacked;
        }
        let read: Result<OwnedBatch, ReadError> = tokio::select! {
            res = conn.reader.read_commands(&mut conn.stream) => {
                res.map(|batch| copy_batch(&inner.handler, batch))
            }
            _ = shutdown.recv() => Err(ReadError::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "server shut down",
            ))),
        };
        match read {
            Ok(OwnedBatch::Strings(cmds)) => {
                if let BatchHandler::Strings(handler) = &inner.handler {
                    handler(conn, cmds);
                }
            }
            Ok(OwnedBatch::Bytes(cmds)) => {
                if let BatchHandler::Bytes(handler) = &inner.handler {
                    handler(conn, cmds);
                }
            }
            Err(ReadError::Eof) => return Exit::Eof,
            Err(ReadError::Io(e)) => return Exit::Err(ConnError::Io(e)),
            Err(ReadError::Protocol(e)) => {
                warn!(client = %conn.addr, error = %e, "protocol violation");
                // Best effort: tell the client what went wrong, then bail.
                conn.writer.write_error(&format!("ERR {e}"));
                let _ = conn.writer.flush(&mut conn.stream).await;
                return Exit::Err(ConnError::Protocol(e));
            }
        }
        if conn.writer.is_closed() {
            // Handler-requested close: drain replies written before the
            // close mark, then end without an error.
            return match conn.writer.flush_remaining(&mut conn.stream).await {
                Ok(()) => Exit::Closed,
                Err(e) => Exit::Err(ConnError::Io(e)),
            };
        }
        if let Err(e) = conn.writer.flush(&mut conn.stream).await {
            return Exit::Err(ConnError::Io(e.into_io()));
        }
    }
}

/// Copies a borrowed batch into owned arguments shaped for the handler.
fn copy_batch(handler: &BatchHandler, batch: Vec<Command<'_>>) -> OwnedBatch {
    match handler {
        BatchHandler::Strings(_) => OwnedBatch::Strings(
            batch
                .iter()
                .map(|cmd| {
                    cmd.iter()
                        .map(|arg| String::from_utf8_lossy(arg).into_owned())
                        .collect()
                })
                .collect(),
        ),
        BatchHandler::Bytes(_) => OwnedBatch::Bytes(
            batch
                .iter()
                .map(|cmd| cmd.iter().map(|arg| Bytes::copy_from_slice(arg)).collect())
                .collect(),
        ),
    }
}

/// Teardown: close (or hand off) the stream, notify the observer,
/// deregister, and repool the buffers.
async fn finish(inner: &ServerInner, mut conn: Conn, exit: Exit) {
    let hijacked = matches!(exit, Exit::Hijacked);
    if !hijacked {
        let _ = conn.stream.shutdown().await;
    }
    let err = match &exit {
        Exit::Err(e) => Some(e),
        _ => None,
    };
    if let Some(observer) = &inner.closed {
        observer(&mut conn, err);
    }
    let id = conn.id;
    if hijacked {
        inner.state.lock().unwrap().conns.remove(&id);
        if let Some(tx) = conn.hijack.take() {
            let _ = tx.send(HijackedConn::from_conn(conn));
        }
        return;
    }
    let Conn {
        stream,
        reader,
        writer,
        ..
    } = conn;
    drop(stream);
    let mut state = inner.state.lock().unwrap();
    state.conns.remove(&id);
    state.read_pool.put(reader.into_buf());
    state.write_pool.put(writer.into_buf());
}
