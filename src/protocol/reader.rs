//! Pipelined RESP + Inline Command Parser
//!
//! This module implements the read side of the protocol: a resumable,
//! byte-oriented decoder that turns a TCP byte stream into batches of
//! commands. Two request formats are accepted and may be freely mixed on the
//! same connection, selected per command by its first byte:
//!
//! - **RESP arrays**: `*<N>\r\n` followed by `N` bulk strings
//!   (`$<len>\r\n<bytes>\r\n`). This is what every Redis client library
//!   sends.
//! - **Inline commands**: a plain text line terminated by `\n` (optionally
//!   preceded by `\r`), split on spaces, with double-quoted arguments and
//!   `\n`/`\r`/`\t` escapes. This is what you get when someone telnets in.
//!
//! ## Incremental parsing
//!
//! TCP is a stream: a read may deliver half a command, or twenty commands at
//! once. [`CommandReader`] owns a growable buffer with `start`/`end` cursors
//! delimiting the unconsumed region. Each call to
//! [`read_commands`](CommandReader::read_commands) decodes every complete
//! command currently buffered and returns them together (pipelining); the
//! leading bytes of an unfinished command stay in place and are rescanned
//! once more input arrives. When nothing complete is buffered the reader
//! performs one stream read and scans again, so a successful return always
//! carries at least one command.
//!
//! ## Zero-copy until exposure
//!
//! Returned argument slices borrow the read buffer (`Cow::Borrowed`) for
//! RESP bulk data. Inline arguments are rebuilt during unescaping and come
//! back owned. Callers that hand arguments to user code copy them first; the
//! connection engine does exactly that.

use std::borrow::Cow;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::DEFAULT_BUF_LEN;

/// A single decoded command: one or more argument tokens.
///
/// RESP bulk arguments borrow the reader's buffer; inline arguments are
/// owned. Both are plain byte strings; the protocol layer attaches no
/// meaning to the first token.
pub type Command<'a> = Vec<Cow<'a, [u8]>>;

/// A framing violation detected while decoding a command.
///
/// The connection engine reports these to the client as
/// `-ERR Protocol error: <message>\r\n` before closing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A quoted inline argument never closed, or a quote appeared in the
    /// middle of a token.
    #[error("Protocol error: unbalanced quotes in request")]
    UnbalancedQuotes,

    /// A `$<len>` header was malformed or its payload was not terminated
    /// with CRLF.
    #[error("Protocol error: invalid bulk length")]
    InvalidBulkLength,

    /// A `*<N>` header was malformed, zero, or negative.
    #[error("Protocol error: invalid multibulk length")]
    InvalidMultibulkLength,

    /// A bulk string header was expected but some other byte was found.
    #[error("Protocol error: expected '$', got '{0}'")]
    ExpectedBulkMarker(char),
}

/// Errors surfaced by [`CommandReader::read_commands`].
#[derive(Debug, Error)]
pub enum ReadError {
    /// The peer violated the protocol framing rules.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Reading from the stream failed. EOF in the middle of a command is
    /// reported here as [`io::ErrorKind::UnexpectedEof`].
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection cleanly on a command boundary.
    #[error("end of stream")]
    Eof,
}

/// An argument located during a scan, before materialization.
enum RawArg {
    /// Absolute byte range into the read buffer (RESP bulk data).
    Span(usize, usize),
    /// Rebuilt bytes (inline arguments, which unescape during the scan).
    Owned(Vec<u8>),
}

/// The resumable command decoder for one connection.
///
/// Holds the read buffer across calls so partial commands survive until the
/// rest of their bytes arrive. Buffers are typically pooled by the server
/// and handed in via [`with_buffer`](CommandReader::with_buffer).
#[derive(Debug)]
pub struct CommandReader {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl Default for CommandReader {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandReader {
    /// Creates a reader with a default-sized buffer.
    pub fn new() -> Self {
        Self::with_buffer(vec![0; DEFAULT_BUF_LEN])
    }

    /// Creates a reader backed by an existing buffer (typically pooled).
    pub fn with_buffer(buf: Vec<u8>) -> Self {
        Self { buf, start: 0, end: 0 }
    }

    /// Reads one batch of commands from `stream`.
    ///
    /// Returns every complete command currently available, decoding what is
    /// already buffered before touching the stream. Never returns an empty
    /// batch: if the buffer holds no complete command the reader blocks in a
    /// stream read and rescans, repeating until at least one command is
    /// decoded or an error occurs.
    ///
    /// # Errors
    ///
    /// - [`ReadError::Protocol`] on a framing violation,
    /// - [`ReadError::Io`] on a stream failure, including
    ///   [`io::ErrorKind::UnexpectedEof`] when the peer disconnects in the
    ///   middle of a command,
    /// - [`ReadError::Eof`] when the peer disconnects cleanly between
    ///   commands.
    pub async fn read_commands<'a, R>(
        &'a mut self,
        stream: &mut R,
    ) -> Result<Vec<Command<'a>>, ReadError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if self.end > self.start {
                let cmds = self.scan()?;
                if !cmds.is_empty() {
                    return Ok(self.materialize(cmds));
                }
            }
            if self.end == self.buf.len() {
                // Full buffer with no complete command: double it. The
                // consumed prefix is reclaimed on the next full drain.
                let grown = if self.buf.is_empty() {
                    DEFAULT_BUF_LEN
                } else {
                    self.buf.len() * 2
                };
                self.buf.resize(grown, 0);
            }
            let n = stream.read(&mut self.buf[self.end..]).await?;
            if n == 0 {
                if self.end > 0 {
                    return Err(ReadError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-command",
                    )));
                }
                return Err(ReadError::Eof);
            }
            self.end += n;
        }
    }

    /// Grows the read buffer so at least `n` bytes can be buffered.
    ///
    /// Used by `Conn::set_read_buffer`; existing buffered bytes are kept.
    pub fn ensure_capacity(&mut self, n: usize) {
        if n > self.buf.len() {
            self.buf.resize(n, 0);
        }
    }

    /// Consumes the reader, returning its buffer for pooling.
    pub(crate) fn into_buf(self) -> Vec<u8> {
        self.buf
    }

    /// Decodes every complete command in the buffered region, advancing the
    /// cursors past them. A partial trailing command is left in place. When
    /// everything was consumed both cursors reset to zero so the whole
    /// buffer is writable again.
    fn scan(&mut self) -> Result<Vec<Vec<RawArg>>, ProtocolError> {
        let mut cmds = Vec::new();
        let mut pos = self.start;
        loop {
            if pos >= self.end {
                self.start = 0;
                self.end = 0;
                break;
            }
            let step = if self.buf[pos] == b'*' {
                self.scan_multibulk(pos)?
            } else {
                self.scan_inline(pos)?
            };
            match step {
                Some((next, args)) => {
                    if !args.is_empty() {
                        cmds.push(args);
                    }
                    pos = next;
                }
                None => {
                    self.start = pos;
                    break;
                }
            }
        }
        Ok(cmds)
    }

    /// Decodes one RESP array command starting at `pos` (which holds `*`).
    ///
    /// Returns `None` when the command is not yet fully buffered.
    fn scan_multibulk(
        &self,
        pos: usize,
    ) -> Result<Option<(usize, Vec<RawArg>)>, ProtocolError> {
        let nl = match self.find_newline(pos + 1) {
            Some(i) => i,
            None => return Ok(None),
        };
        if self.buf[nl - 1] != b'\r' {
            return Err(ProtocolError::InvalidMultibulkLength);
        }
        let argc = parse_len(&self.buf[pos + 1..nl - 1])
            .filter(|&n| n > 0)
            .ok_or(ProtocolError::InvalidMultibulkLength)?;

        let mut args = Vec::with_capacity(argc.min(1024));
        let mut cur = nl + 1;
        for _ in 0..argc {
            if cur >= self.end {
                return Ok(None);
            }
            if self.buf[cur] != b'$' {
                return Err(ProtocolError::ExpectedBulkMarker(self.buf[cur] as char));
            }
            let hdr_nl = match self.find_newline(cur + 1) {
                Some(i) => i,
                None => return Ok(None),
            };
            if self.buf[hdr_nl - 1] != b'\r' {
                return Err(ProtocolError::InvalidBulkLength);
            }
            let len = parse_len(&self.buf[cur + 1..hdr_nl - 1])
                .ok_or(ProtocolError::InvalidBulkLength)?;
            let data = hdr_nl + 1;
            let data_end = data
                .checked_add(len)
                .ok_or(ProtocolError::InvalidBulkLength)?;
            let needed = data_end
                .checked_add(2)
                .ok_or(ProtocolError::InvalidBulkLength)?;
            if needed > self.end {
                return Ok(None);
            }
            if self.buf[data_end] != b'\r' || self.buf[data_end + 1] != b'\n' {
                return Err(ProtocolError::InvalidBulkLength);
            }
            args.push(RawArg::Span(data, data_end));
            cur = data_end + 2;
        }
        Ok(Some((cur, args)))
    }

    /// Decodes one inline command line starting at `pos`.
    ///
    /// Returns `None` until a full line is buffered. Blank lines come back
    /// as an empty argument list and are dropped by the caller.
    fn scan_inline(
        &self,
        pos: usize,
    ) -> Result<Option<(usize, Vec<RawArg>)>, ProtocolError> {
        let nl = match self.find_newline(pos) {
            Some(i) => i,
            None => return Ok(None),
        };
        let line_end = if nl > pos && self.buf[nl - 1] == b'\r' {
            nl - 1
        } else {
            nl
        };
        let args = split_inline(&self.buf[pos..line_end])?
            .into_iter()
            .map(RawArg::Owned)
            .collect();
        Ok(Some((nl + 1, args)))
    }

    /// Position of the next `\n` at or after `from`, within the buffered
    /// region.
    fn find_newline(&self, from: usize) -> Option<usize> {
        self.buf[from..self.end]
            .iter()
            .position(|&c| c == b'\n')
            .map(|i| from + i)
    }

    fn materialize(&self, cmds: Vec<Vec<RawArg>>) -> Vec<Command<'_>> {
        cmds.into_iter()
            .map(|args| {
                args.into_iter()
                    .map(|arg| match arg {
                        RawArg::Span(s, e) => Cow::Borrowed(&self.buf[s..e]),
                        RawArg::Owned(v) => Cow::Owned(v),
                    })
                    .collect()
            })
            .collect()
    }
}

/// Splits one inline command line into arguments.
///
/// Runs of spaces separate tokens; empty unquoted tokens are discarded.
/// A `"` opens a quoted argument only at the start of a token; see
/// [`scan_quoted`] for the rules inside quotes.
fn split_inline(line: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let mut args = Vec::new();
    let mut i = 0;
    while i < line.len() {
        match line[i] {
            b' ' => i += 1,
            b'"' => {
                let (arg, next) = scan_quoted(line, i)?;
                args.push(arg);
                i = next;
            }
            _ => {
                let tok = i;
                while i < line.len() && line[i] != b' ' {
                    if line[i] == b'"' {
                        return Err(ProtocolError::UnbalancedQuotes);
                    }
                    i += 1;
                }
                args.push(line[tok..i].to_vec());
            }
        }
    }
    Ok(args)
}

/// Decodes one double-quoted argument whose opening quote sits at `open`.
///
/// `\n`, `\r`, and `\t` escapes become the corresponding control byte; any
/// other escaped byte passes through literally. The closing quote must be
/// followed by end-of-line or a space. Returns the unescaped bytes and the
/// position just past the closing quote.
fn scan_quoted(line: &[u8], open: usize) -> Result<(Vec<u8>, usize), ProtocolError> {
    let mut arg = Vec::new();
    let mut i = open + 1;
    while i < line.len() {
        match line[i] {
            b'\\' => {
                if i + 1 >= line.len() {
                    return Err(ProtocolError::UnbalancedQuotes);
                }
                arg.push(match line[i + 1] {
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    c => c,
                });
                i += 2;
            }
            b'"' => {
                if i + 1 < line.len() && line[i + 1] != b' ' {
                    return Err(ProtocolError::UnbalancedQuotes);
                }
                return Ok((arg, i + 1));
            }
            c => {
                arg.push(c);
                i += 1;
            }
        }
    }
    Err(ProtocolError::UnbalancedQuotes)
}

/// Parses a length header: ASCII digits only, no sign, no whitespace.
///
/// An empty digit run parses as zero. Returns `None` on any other byte or
/// on overflow.
fn parse_len(b: &[u8]) -> Option<usize> {
    let mut n: usize = 0;
    for &c in b {
        if !c.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add((c - b'0') as usize)?;
    }
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// An `AsyncRead` that yields a fixed sequence of chunks, then EOF.
    struct Script {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Script {
        fn new<const N: usize>(chunks: [&[u8]; N]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| c.to_vec()).collect(),
            }
        }
    }

    impl AsyncRead for Script {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            if let Some(mut chunk) = this.chunks.pop_front() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    chunk.drain(..n);
                    this.chunks.push_front(chunk);
                }
            }
            Poll::Ready(Ok(()))
        }
    }

    /// Reads one batch and returns it as owned byte vectors.
    async fn one_batch(reader: &mut CommandReader, script: &mut Script) -> Vec<Vec<Vec<u8>>> {
        reader
            .read_commands(script)
            .await
            .expect("batch")
            .iter()
            .map(|cmd| cmd.iter().map(|a| a.to_vec()).collect())
            .collect()
    }

    fn cmd(args: &[&str]) -> Vec<Vec<u8>> {
        args.iter().map(|a| a.as_bytes().to_vec()).collect()
    }

    #[tokio::test]
    async fn resp_single_command() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"*1\r\n$4\r\nPING\r\n"]);
        assert_eq!(one_batch(&mut r, &mut s).await, vec![cmd(&["PING"])]);
    }

    #[tokio::test]
    async fn resp_pipelined_batch() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n*2\r\n$3\r\nGET\r\n$1\r\nk\r\n"]);
        assert_eq!(
            one_batch(&mut r, &mut s).await,
            vec![cmd(&["SET", "k", "v"]), cmd(&["GET", "k"])]
        );
    }

    #[tokio::test]
    async fn resp_resumes_across_arbitrary_splits() {
        // Split a SET command at every byte position and make sure the
        // decoded arguments are byte-identical each time.
        let wire = b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n";
        for split in 1..wire.len() - 1 {
            let mut r = CommandReader::new();
            let mut s = Script::new([&wire[..split], &wire[split..]]);
            assert_eq!(
                one_batch(&mut r, &mut s).await,
                vec![cmd(&["SET", "key", "value"])],
                "split at {split}"
            );
        }
    }

    #[tokio::test]
    async fn resp_partial_command_stays_pending() {
        // Missing the trailing CRLF: must wait, not error.
        let mut r = CommandReader::new();
        let mut s = Script::new([b"*2\r\n$3\r\nfoo\r\n$3\r\nbar" as &[u8], b"\r\n"]);
        assert_eq!(one_batch(&mut r, &mut s).await, vec![cmd(&["foo", "bar"])]);
    }

    #[tokio::test]
    async fn resp_empty_bulk_argument() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"*1\r\n$0\r\n\r\n"]);
        assert_eq!(one_batch(&mut r, &mut s).await, vec![vec![Vec::new()]]);
    }

    #[tokio::test]
    async fn resp_binary_safe_argument() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"*2\r\n$3\r\nSET\r\n$5\r\na\x00\r\nb\r\n"]);
        let batch = one_batch(&mut r, &mut s).await;
        assert_eq!(batch[0][1], b"a\x00\r\nb".to_vec());
    }

    #[tokio::test]
    async fn resp_rejects_bad_multibulk_lengths() {
        for wire in [&b"*abc\r\n"[..], b"*0\r\n", b"*-1\r\n", b"*2\n"] {
            let mut r = CommandReader::new();
            let mut s = Script::new([wire]);
            let err = r.read_commands(&mut s).await.unwrap_err();
            assert!(
                matches!(
                    err,
                    ReadError::Protocol(ProtocolError::InvalidMultibulkLength)
                ),
                "wire {wire:?} gave {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn resp_rejects_missing_bulk_marker() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"*1\r\n:123\r\n"]);
        let err = r.read_commands(&mut s).await.unwrap_err();
        match err {
            ReadError::Protocol(e @ ProtocolError::ExpectedBulkMarker(':')) => {
                assert_eq!(e.to_string(), "Protocol error: expected '$', got ':'");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resp_rejects_bad_bulk_framing() {
        // Payload longer than declared: the byte where CRLF should be is 'x'.
        let mut r = CommandReader::new();
        let mut s = Script::new([b"*1\r\n$3\r\nfooxx\r\n"]);
        assert!(matches!(
            r.read_commands(&mut s).await.unwrap_err(),
            ReadError::Protocol(ProtocolError::InvalidBulkLength)
        ));
    }

    #[tokio::test]
    async fn inline_collapses_space_runs() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"  foo   bar  \n"]);
        assert_eq!(one_batch(&mut r, &mut s).await, vec![cmd(&["foo", "bar"])]);
    }

    #[tokio::test]
    async fn inline_quoted_arguments_unescape() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"set \"a b\" \"c\\nd\"\r\n"]);
        assert_eq!(
            one_batch(&mut r, &mut s).await,
            vec![cmd(&["set", "a b", "c\nd"])]
        );
    }

    #[tokio::test]
    async fn inline_unknown_escape_passes_through() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"set \"a\\xb\"\n"]);
        assert_eq!(one_batch(&mut r, &mut s).await, vec![cmd(&["set", "axb"])]);
    }

    #[tokio::test]
    async fn inline_empty_quoted_argument_survives() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"set k \"\"\n"]);
        assert_eq!(
            one_batch(&mut r, &mut s).await,
            vec![vec![b"set".to_vec(), b"k".to_vec(), Vec::new()]]
        );
    }

    #[tokio::test]
    async fn inline_unbalanced_quotes() {
        for wire in [
            &b"\"a\"b\n"[..],      // closing quote not followed by space
            b"set \"a b\n",        // never closed
            b"se\"t\n",            // quote mid-token
            b"set \"a\\\n",        // escape at end of line
        ] {
            let mut r = CommandReader::new();
            let mut s = Script::new([wire]);
            assert!(
                matches!(
                    r.read_commands(&mut s).await.unwrap_err(),
                    ReadError::Protocol(ProtocolError::UnbalancedQuotes)
                ),
                "wire {wire:?}"
            );
        }
    }

    #[tokio::test]
    async fn inline_blank_lines_are_dropped() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"\r\n   \r\nping\r\n"]);
        assert_eq!(one_batch(&mut r, &mut s).await, vec![cmd(&["ping"])]);
    }

    #[tokio::test]
    async fn inline_and_resp_interleave() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"ping\r\n*1\r\n$4\r\nping\r\n"]);
        assert_eq!(
            one_batch(&mut r, &mut s).await,
            vec![cmd(&["ping"]), cmd(&["ping"])]
        );
    }

    #[tokio::test]
    async fn clean_eof_between_commands() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"*1\r\n$4\r\nPING\r\n"]);
        assert_eq!(one_batch(&mut r, &mut s).await, vec![cmd(&["PING"])]);
        assert!(matches!(
            r.read_commands(&mut s).await.unwrap_err(),
            ReadError::Eof
        ));
    }

    #[tokio::test]
    async fn eof_mid_command_is_unexpected() {
        let mut r = CommandReader::new();
        let mut s = Script::new([b"*2\r\n$3\r\nfoo\r\n"]);
        match r.read_commands(&mut s).await.unwrap_err() {
            ReadError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn buffer_doubles_for_oversized_commands() {
        // A 64-byte starting buffer forces two growth rounds.
        let payload = vec![b'x'; 200];
        let mut wire = format!("*2\r\n$3\r\nSET\r\n${}\r\n", payload.len()).into_bytes();
        wire.extend_from_slice(&payload);
        wire.extend_from_slice(b"\r\n");

        let mut r = CommandReader::with_buffer(vec![0; 64]);
        let mut s = Script::new([&wire[..50], &wire[50..120], &wire[120..]]);
        let batch = one_batch(&mut r, &mut s).await;
        assert_eq!(batch[0][1], payload);
    }

    #[tokio::test]
    async fn error_discards_commands_from_same_scan() {
        // A complete PING followed by garbage framing: the whole call fails.
        let mut r = CommandReader::new();
        let mut s = Script::new([b"ping\r\n*abc\r\n"]);
        assert!(matches!(
            r.read_commands(&mut s).await.unwrap_err(),
            ReadError::Protocol(ProtocolError::InvalidMultibulkLength)
        ));
    }

    #[test]
    fn parse_len_accepts_digits_only() {
        assert_eq!(parse_len(b"0"), Some(0));
        assert_eq!(parse_len(b"42"), Some(42));
        assert_eq!(parse_len(b""), Some(0));
        assert_eq!(parse_len(b"-1"), None);
        assert_eq!(parse_len(b"1a"), None);
        assert_eq!(parse_len(b"99999999999999999999999"), None);
    }
}
