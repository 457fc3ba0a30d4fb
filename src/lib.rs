//! # respd: an embeddable RESP protocol server library
//!
//! respd lets an application speak the Redis Serialization Protocol (and
//! its telnet-friendly inline variant) without writing any network
//! plumbing. You supply a handler that receives batches of parsed
//! commands; the library manages the accept loop, per-connection parsing,
//! reply framing, pipelining, and buffer reuse. Command semantics (what
//! `GET` or `SET` actually do) stay entirely in your code.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            respd                                 │
//! │                                                                  │
//! │  ┌────────────┐     ┌───────────────┐     ┌──────────────────┐   │
//! │  │  Server    │────>│  Connection   │────>│  Your handler    │   │
//! │  │ (accept    │     │  engine       │     │  (&mut Conn,     │   │
//! │  │  loop +    │     │  read→dispatch│     │   batch)         │   │
//! │  │  registry) │     │  →flush loop  │     └──────────────────┘   │
//! │  └────────────┘     └───┬───────┬───┘                            │
//! │        │                │       │                                │
//! │  ┌─────┴──────┐  ┌──────┴──┐ ┌──┴──────────┐                     │
//! │  │ BufferPool │  │ Command │ │ ReplyWriter │                     │
//! │  │ (reuse)    │  │ Reader  │ │ (batched)   │                     │
//! │  └────────────┘  └─────────┘ └─────────────┘                     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use respd::{Conn, Server};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let server = Server::new("127.0.0.1:6379", |conn: &mut Conn, batch| {
//!         for cmd in batch {
//!             match cmd[0].to_ascii_lowercase().as_str() {
//!                 "ping" => conn.write_string("PONG"),
//!                 "quit" => {
//!                     conn.write_string("OK");
//!                     conn.close();
//!                 }
//!                 _ => conn.write_error("ERR unknown command"),
//!             }
//!         }
//!     });
//!     server.listen_and_serve().await
//! }
//! ```
//!
//! ## What the engine guarantees
//!
//! - Commands reach the handler in wire order, one full pipelined batch per
//!   invocation; replies flush once per batch.
//! - Handler arguments are independent copies; retain them freely.
//! - Protocol violations answer the client with `-ERR Protocol error: …`
//!   before the connection closes.
//! - A handler can [`hijack`](Conn::hijack) its connection and drive the
//!   raw socket itself (pub/sub style flows).
//!
//! ## Module overview
//!
//! - [`protocol`]: the RESP/inline parser and the reply writer
//! - [`connection`]: the `Conn` facade, engine loop, and hijack support
//! - [`server`]: the accept loop, registry, and shutdown

pub mod connection;
pub mod protocol;
pub mod server;

mod buffer;

pub use connection::{Conn, ConnError, Hijack, HijackError, HijackedConn};
pub use protocol::{
    Command, CommandReader, ProtocolError, ReadError, ReplyWriter, WriteError,
};
pub use server::{listen_and_serve, listen_and_serve_bytes, Server};

/// Default length of pooled read buffers; also the size cap above which a
/// grown buffer is discarded instead of repooled.
pub const DEFAULT_BUF_LEN: usize = 4 * 1024;

/// Maximum number of buffers each pool retains.
pub const DEFAULT_POOL_SIZE: usize = 64;

/// Initial capacity of a fresh write buffer.
pub(crate) const WRITE_BUF_CAPACITY: usize = 64;
