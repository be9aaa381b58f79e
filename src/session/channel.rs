//! Line-protocol channel over a child's stdin/stdout.
//!
//! One exchange is one compact JSON line written to the child followed by
//! exactly one JSON line read back. Failures are reported to the caller
//! as-is and nothing is retried.

use std::pin::Pin;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use crate::protocol::codec::LineCodec;
use crate::protocol::envelope::{RpcRequest, RpcResponse};
use crate::{AppError, Result};

/// Boxed write half (the child's stdin).
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Boxed read half (the child's stdout).
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Buffered reader yielding one newline-terminated line at a time.
///
/// Bytes after a returned line stay buffered for the next call. An
/// over-long line is reported once and then discarded up to its newline, so
/// the reader keeps working afterwards.
#[derive(Debug)]
pub struct LineReader<R> {
    reader: R,
    codec: LineCodec,
    buffer: BytesMut,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap `reader`, framing it with `codec`.
    pub fn new(reader: R, codec: LineCodec) -> Self {
        Self {
            reader,
            codec,
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Read the next line, without its terminator.
    ///
    /// Returns `Ok(None)` on a clean EOF. Cancel-safe: dropping the future
    /// loses no buffered bytes.
    ///
    /// # Errors
    ///
    /// - [`AppError::ProtocolDecode`] for a line over the codec limit.
    /// - [`AppError::TransportRead`] for I/O failures and for EOF inside an
    ///   unterminated line.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(line));
            }

            let n = self
                .reader
                .read_buf(&mut self.buffer)
                .await
                .map_err(|e| AppError::TransportRead(format!("read failed: {e}")))?;

            if n == 0 {
                return self.codec.decode_eof(&mut self.buffer);
            }
        }
    }
}

/// Strictly synchronous request/reply transport over a pair of pipes.
///
/// [`LineChannel::send`] may be abandoned at any await point (timeout,
/// cancellation). The channel keeps track of what was left behind:
///
/// - a request written in full whose reply was never read is counted in
///   `unread_replies`; the next `send` reads and discards that many lines
///   before writing, so a late reply never reaches the wrong caller;
/// - a request only partly written leaves the child's stdin mid-line, which
///   cannot be repaired; every later `send` fails and
///   [`LineChannel::is_desynced`] reports it.
pub struct LineChannel {
    session_key: String,
    writer: BoxedWriter,
    reader: LineReader<BoxedReader>,
    unread_replies: usize,
    write_interrupted: bool,
}

impl std::fmt::Debug for LineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineChannel")
            .field("session_key", &self.session_key)
            .field("unread_replies", &self.unread_replies)
            .field("write_interrupted", &self.write_interrupted)
            .finish_non_exhaustive()
    }
}

impl LineChannel {
    /// Wrap a writer/reader pair, framing the reader with `codec`.
    pub fn new(
        session_key: impl Into<String>,
        writer: BoxedWriter,
        reader: BoxedReader,
        codec: LineCodec,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            writer,
            reader: LineReader::new(reader, codec),
            unread_replies: 0,
            write_interrupted: false,
        }
    }

    /// Whether an earlier request was abandoned part way through its write.
    #[must_use]
    pub fn is_desynced(&self) -> bool {
        self.write_interrupted
    }

    /// Write `request` as one line and wait for one response line.
    ///
    /// Replies owed to abandoned earlier requests are discarded first. Blank
    /// lines before the reply are skipped; anything else on the line must
    /// decode as a [`RpcResponse`].
    ///
    /// # Errors
    ///
    /// - [`AppError::TransportWrite`] if the request cannot be written or
    ///   flushed (child exited, pipe broken), or an earlier write was
    ///   interrupted.
    /// - [`AppError::TransportRead`] if stdout closes or fails before a
    ///   complete line arrives.
    /// - [`AppError::ProtocolDecode`] if the line is not a response envelope
    ///   or exceeds the codec's line limit.
    pub async fn send(&mut self, request: &RpcRequest) -> Result<RpcResponse> {
        if self.write_interrupted {
            return Err(AppError::TransportWrite(
                "channel desynchronised: an earlier request was only partly written".into(),
            ));
        }

        self.discard_stale_replies().await?;
        self.write_line(request).await?;
        self.unread_replies += 1;
        let line = self.next_reply().await?;

        serde_json::from_str(&line).map_err(|e| {
            warn!(
                session_key = self.session_key.as_str(),
                error = %e,
                raw_line = %line,
                "channel: response line is not a valid envelope"
            );
            AppError::ProtocolDecode(format!("malformed response: {e}"))
        })
    }

    async fn discard_stale_replies(&mut self) -> Result<()> {
        while self.unread_replies > 0 {
            match self.next_reply().await {
                Ok(line) => {
                    warn!(
                        session_key = self.session_key.as_str(),
                        raw_line = %line,
                        "channel: discarding late reply to an abandoned request"
                    );
                }
                Err(AppError::ProtocolDecode(msg)) => {
                    warn!(
                        session_key = self.session_key.as_str(),
                        error = msg.as_str(),
                        "channel: discarding late oversized reply"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn write_line(&mut self, request: &RpcRequest) -> Result<()> {
        let mut bytes = serde_json::to_vec(request)
            .map_err(|e| AppError::TransportWrite(format!("failed to serialise request: {e}")))?;

        // Raw members keep the caller's whitespace; line breaks between
        // tokens are insignificant and would split the frame.
        for byte in &mut bytes {
            if *byte == b'\n' || *byte == b'\r' {
                *byte = b' ';
            }
        }

        // NDJSON: append the newline delimiter.
        bytes.push(b'\n');

        self.write_interrupted = true;
        self.writer
            .write_all(&bytes)
            .await
            .map_err(|e| AppError::TransportWrite(format!("write failed: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| AppError::TransportWrite(format!("flush failed: {e}")))?;
        self.write_interrupted = false;

        debug!(
            session_key = self.session_key.as_str(),
            bytes = bytes.len(),
            "channel: request written"
        );
        Ok(())
    }

    /// Read the next non-blank line, settling one owed reply.
    async fn next_reply(&mut self) -> Result<String> {
        loop {
            match self.reader.next_line().await {
                Ok(None) => {
                    return Err(AppError::TransportRead(
                        "stream closed before a response line arrived".into(),
                    ));
                }
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    self.unread_replies = self.unread_replies.saturating_sub(1);
                    return Ok(line);
                }
                Err(err @ AppError::ProtocolDecode(_)) => {
                    self.unread_replies = self.unread_replies.saturating_sub(1);
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Shut down the write half so the child observes EOF on stdin.
    pub async fn shutdown(&mut self) {
        if let Err(err) = self.writer.shutdown().await {
            debug!(
                session_key = self.session_key.as_str(),
                %err,
                "channel: stdin shutdown failed"
            );
        }
    }
}
