//! Per-Connection Machinery
//!
//! Everything that lives for exactly one client connection: the
//! [`Conn`] facade handed to handlers, the engine loop that pumps batches
//! between the parser and the application, and the hijack path that lets a
//! handler take raw ownership of the socket.
//!
//! ## Lifecycle
//!
//! ```text
//! accept ──> accept filter ──> engine loop ──┬──> closed (EOF, error,
//!                │                           │    or handler close)
//!                └── false: dropped          └──> hijacked (stream handed
//!                        silently                 to application code)
//! ```
//!
//! The engine owns the connection exclusively; nothing here is shared or
//! locked. Replies buffer in the connection's writer and are flushed once
//! per handled batch, which is what makes pipelining efficient.

pub mod conn;
pub(crate) mod handler;
pub mod hijack;

pub use conn::{Conn, ConnError};
pub use hijack::{Hijack, HijackError, HijackedConn};
