//! The TCP server: accept loop, connection registry, and shutdown.
//!
//! A [`Server`] binds a listener and spawns one task per accepted
//! connection; each task runs the engine loop in
//! [`connection::handler`](crate::connection). The server itself only
//! tracks shared state: the registry of live connection ids and the two
//! buffer pools, all under a single lock that is never held across I/O or
//! handler invocations. Shutdown is a broadcast: [`Server::close`] stops
//! the accept loop and unparks every connection task, which then tears its
//! connection down the normal way.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

use crate::buffer::BufferPool;
use crate::connection::handler::{
    drive_connection, AcceptFilter, BatchHandler, CloseObserver,
};
use crate::connection::Conn;
use crate::{DEFAULT_BUF_LEN, DEFAULT_POOL_SIZE, WRITE_BUF_CAPACITY};

/// An embeddable RESP server.
///
/// `Server` is a cheaply cloneable handle; clone it to call
/// [`close`](Server::close) from another task while
/// [`listen_and_serve`](Server::listen_and_serve) runs. Configure it with
/// the builder methods before serving.
///
/// # Example
///
/// ```ignore
/// let server = Server::new("127.0.0.1:6379", |conn, batch| {
///     for cmd in batch {
///         match cmd[0].to_ascii_lowercase().as_str() {
///             "ping" => conn.write_string("PONG"),
///             _ => conn.write_error("ERR unknown command"),
///         }
///     }
/// });
/// server.listen_and_serve().await?;
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    addr: String,
    pub(crate) handler: BatchHandler,
    accept: Option<AcceptFilter>,
    pub(crate) closed: Option<CloseObserver>,
    pub(crate) state: Mutex<ServerState>,
    shutdown: broadcast::Sender<()>,
    done: AtomicBool,
}

pub(crate) struct ServerState {
    next_id: u64,
    pub(crate) conns: HashSet<u64>,
    pub(crate) read_pool: BufferPool,
    pub(crate) write_pool: BufferPool,
}

impl Server {
    /// Creates a server whose handler receives command arguments as
    /// strings.
    pub fn new<H>(addr: impl Into<String>, handler: H) -> Self
    where
        H: Fn(&mut Conn, Vec<Vec<String>>) + Send + Sync + 'static,
    {
        Self::build(addr.into(), BatchHandler::Strings(Box::new(handler)))
    }

    /// Creates a server whose handler receives command arguments as raw
    /// bytes. Use this form for binary-safe applications.
    pub fn new_bytes<H>(addr: impl Into<String>, handler: H) -> Self
    where
        H: Fn(&mut Conn, Vec<Vec<Bytes>>) + Send + Sync + 'static,
    {
        Self::build(addr.into(), BatchHandler::Bytes(Box::new(handler)))
    }

    fn build(addr: String, handler: BatchHandler) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(ServerInner {
                addr,
                handler,
                accept: None,
                closed: None,
                state: Mutex::new(ServerState {
                    next_id: 0,
                    conns: HashSet::new(),
                    read_pool: BufferPool::prefilled(DEFAULT_POOL_SIZE, DEFAULT_BUF_LEN),
                    write_pool: BufferPool::new(DEFAULT_POOL_SIZE, DEFAULT_BUF_LEN),
                }),
                shutdown,
                done: AtomicBool::new(false),
            }),
        }
    }

    /// Installs a per-connection accept filter.
    ///
    /// Runs before the connection's first read; returning `false` drops the
    /// connection silently (no handler, no close observer).
    ///
    /// # Panics
    ///
    /// Panics if called after the server handle has been cloned or started.
    pub fn accept_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&mut Conn) -> bool + Send + Sync + 'static,
    {
        self.configure(|inner| inner.accept = Some(Box::new(filter)));
        self
    }

    /// Installs a close observer, invoked on every served connection's
    /// teardown with the terminal error (`None` for clean ends, handler
    /// closes, and hijacks).
    ///
    /// # Panics
    ///
    /// Panics if called after the server handle has been cloned or started.
    pub fn close_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&mut Conn, Option<&crate::ConnError>) + Send + Sync + 'static,
    {
        self.configure(|inner| inner.closed = Some(Box::new(observer)));
        self
    }

    fn configure(&mut self, apply: impl FnOnce(&mut ServerInner)) {
        let inner =
            Arc::get_mut(&mut self.inner).expect("configure the server before serving it");
        apply(inner);
    }

    /// Binds the listener and serves connections until
    /// [`close`](Server::close) is called or accepting fails.
    pub async fn listen_and_serve(&self) -> io::Result<()> {
        self.serve(None).await
    }

    /// Like [`listen_and_serve`](Server::listen_and_serve), but first
    /// publishes the bind outcome (the bound address, or the bind error)
    /// on `signal` before entering the accept loop.
    pub async fn listen_serve_and_signal(
        &self,
        signal: oneshot::Sender<io::Result<SocketAddr>>,
    ) -> io::Result<()> {
        self.serve(Some(signal)).await
    }

    /// Stops the server: the accept loop returns cleanly and every live
    /// connection is torn down.
    pub fn close(&self) {
        self.inner.done.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(());
    }

    async fn serve(
        &self,
        signal: Option<oneshot::Sender<io::Result<SocketAddr>>>,
    ) -> io::Result<()> {
        let listener = match TcpListener::bind(&self.inner.addr).await {
            Ok(listener) => listener,
            Err(e) => {
                if let Some(tx) = signal {
                    let _ = tx.send(Err(io::Error::new(e.kind(), e.to_string())));
                }
                return Err(e);
            }
        };
        if let Some(tx) = signal {
            let _ = tx.send(listener.local_addr());
        }
        info!(addr = %self.inner.addr, "listening");

        let mut shutdown = self.inner.shutdown.subscribe();
        loop {
            let (stream, peer) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if self.inner.done.load(Ordering::SeqCst) {
                            return Ok(());
                        }
                        return Err(e);
                    }
                },
                _ = shutdown.recv() => return Ok(()),
            };
            debug!(client = %peer, "accepted");

            let inner = Arc::clone(&self.inner);
            let mut conn = {
                let mut state = inner.state.lock().unwrap();
                let id = state.next_id;
                state.next_id += 1;
                let read_buf = state
                    .read_pool
                    .take()
                    .unwrap_or_else(|| vec![0; DEFAULT_BUF_LEN]);
                let write_buf = state
                    .write_pool
                    .take()
                    .unwrap_or_else(|| Vec::with_capacity(WRITE_BUF_CAPACITY));
                state.conns.insert(id);
                Conn::new(id, stream, peer.to_string(), read_buf, write_buf)
            };

            if let Some(filter) = &inner.accept {
                if !filter(&mut conn) {
                    inner.state.lock().unwrap().conns.remove(&conn.id);
                    debug!(client = %peer, "rejected by accept filter");
                    continue; // dropping the conn closes the stream
                }
            }

            let conn_shutdown = self.inner.shutdown.subscribe();
            tokio::spawn(drive_connection(inner, conn, conn_shutdown));
        }
    }
}

/// Binds `addr` and serves `handler` until the process ends or accepting
/// fails. Convenience for applications that need no filter or observer.
pub async fn listen_and_serve<H>(addr: impl Into<String>, handler: H) -> io::Result<()>
where
    H: Fn(&mut Conn, Vec<Vec<String>>) + Send + Sync + 'static,
{
    Server::new(addr, handler).listen_and_serve().await
}

/// Bytes-form twin of [`listen_and_serve`].
pub async fn listen_and_serve_bytes<H>(addr: impl Into<String>, handler: H) -> io::Result<()>
where
    H: Fn(&mut Conn, Vec<Vec<Bytes>>) + Send + Sync + 'static,
{
    Server::new_bytes(addr, handler).listen_and_serve().await
}
