//! Newline-delimited JSON framing for child stdio streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a configurable maximum line
//! length so a child that never emits a newline cannot make the bridge
//! buffer without bound.
//!
//! # Usage
//!
//! Hand a [`LineCodec`] to
//! [`LineReader`](crate::session::channel::LineReader) over a child's stdout
//! or stderr.
//!
//! ```rust,ignore
//! use stdio_bridge::protocol::codec::LineCodec;
//! use stdio_bridge::session::channel::LineReader;
//!
//! let mut lines = LineReader::new(child_stdout, LineCodec::new());
//! while let Some(line) = lines.next_line().await? { /* ... */ }
//! ```

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default maximum line length accepted by [`LineCodec::new`]: 16 MiB.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Line decoder for newline-delimited JSON streams.
///
/// Each `\n`-terminated UTF-8 string is one complete message; a trailing
/// `\r` is stripped.
///
/// Inbound lines longer than the configured limit return
/// [`AppError::ProtocolDecode`]`("line too long: …")`. The codec then
/// discards input up to the next newline, so the stream stays aligned on
/// message boundaries. I/O errors are mapped to [`AppError::TransportRead`].
#[derive(Debug)]
pub struct LineCodec {
    inner: LinesCodec,
    max_line_bytes: usize,
}

impl LineCodec {
    /// Create a codec with the [`DEFAULT_MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max_line_bytes: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_line_bytes),
            max_line_bytes,
        }
    }

    /// Configured maximum line length in bytes.
    #[must_use]
    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    fn map_error(&self, e: LinesCodecError) -> AppError {
        match e {
            LinesCodecError::MaxLineLengthExceeded => AppError::ProtocolDecode(format!(
                "line too long: exceeded {} bytes",
                self.max_line_bytes
            )),
            LinesCodecError::Io(io_err) => AppError::TransportRead(io_err.to_string()),
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = AppError;

    /// Decode the next newline-terminated line from `src`.
    ///
    /// Returns `Ok(None)` while `src` holds no complete line yet.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let decoded = self.inner.decode(src);
        decoded.map_err(|e| self.map_error(e))
    }

    /// Decode at EOF. Complete lines are still yielded; a trailing fragment
    /// without its newline is an error, never a message.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None if src.is_empty() => Ok(None),
            None => {
                let pending = src.len();
                src.clear();
                Err(AppError::TransportRead(format!(
                    "stream closed inside an unterminated line ({pending} bytes)"
                )))
            }
        }
    }
}
