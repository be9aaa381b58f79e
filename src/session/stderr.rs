//! Supervised drain of a child's stderr.
//!
//! stderr carries diagnostics only. Each line is logged at `INFO` with the
//! session key and never parsed. Draining continuously keeps the child from
//! blocking on a full stderr pipe.

use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::codec::LineCodec;
use crate::session::channel::LineReader;
use crate::AppError;

/// Spawn the drain task for `stderr`.
///
/// The task ends on EOF, on a non-recoverable read error, or when `cancel`
/// fires. The owning session keeps the [`JoinHandle`] and awaits it on close.
#[must_use]
pub fn spawn_drain<R>(
    session_key: String,
    stderr: R,
    codec: LineCodec,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineReader::new(stderr, codec);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!(session_key = session_key.as_str(), "stderr drain: cancellation received, stopping");
                    break;
                }

                item = lines.next_line() => {
                    match item {
                        Ok(None) => {
                            debug!(session_key = session_key.as_str(), "stderr drain: EOF detected");
                            break;
                        }
                        Ok(Some(line)) if line.trim().is_empty() => {}
                        Ok(Some(line)) => {
                            info!(session_key = session_key.as_str(), line = %line, "child stderr");
                        }
                        Err(AppError::ProtocolDecode(ref msg)) => {
                            warn!(session_key = session_key.as_str(), error = msg.as_str(), "stderr drain: skipping oversized line");
                        }
                        Err(e) => {
                            warn!(session_key = session_key.as_str(), error = %e, "stderr drain: read error, stopping");
                            break;
                        }
                    }
                }
            }
        }
    })
}
