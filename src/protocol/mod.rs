//! Wire Protocol: RESP and Inline Commands
//!
//! The two halves of the wire format:
//!
//! - [`reader`]: decodes the client byte stream into batches of commands,
//!   both RESP arrays (`*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`) and telnet-style
//!   inline lines (`get name`), resumable across partial reads.
//! - [`writer`]: encodes replies (`+OK\r\n`, `-ERR …\r\n`, `:1\r\n`,
//!   `$5\r\nhello\r\n`, `*2\r\n`, `$-1\r\n`) into a buffer flushed in one
//!   write per batch.
//!
//! Both sides are plain state machines over byte buffers; they are generic
//! over `AsyncRead`/`AsyncWrite` and carry no connection policy of their
//! own.

pub mod reader;
pub mod writer;

pub use reader::{Command, CommandReader, ProtocolError, ReadError};
pub use writer::{ReplyWriter, WriteError};
