//! One session: a child process, its line channel, and its stderr drain.
//!
//! All exchanges go through a single async mutex held for the full
//! write + read round trip, so two callers sharing a session key can never
//! interleave bytes on the same pipe.
//!
//! Closing is idempotent. The first [`Session::close`] cancels the session
//! token, which makes any exchange blocked on the pipe return
//! [`AppError::SessionClosed`], then closes stdin and reaps the child. The
//! stderr drain keeps running until the child is gone so its last words are
//! logged. Later calls return immediately.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::PoisonError;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::codec::LineCodec;
use crate::protocol::envelope::{RpcRequest, RpcResponse};
use crate::session::channel::LineChannel;
use crate::session::spawner::{SpawnConfig, SESSION_KEY_ENV};
use crate::session::stderr;
use crate::{AppError, Result};

/// A live session bound to one session key.
#[derive(Debug)]
pub struct Session {
    key: String,
    pid: Option<u32>,
    channel: Mutex<Option<LineChannel>>,
    child: Mutex<Option<Child>>,
    drain: Mutex<Option<JoinHandle<()>>>,
    drain_cancel: CancellationToken,
    cancel: CancellationToken,
    closed: AtomicBool,
    broken: AtomicBool,
    shutdown_grace: Duration,
    created_at: Instant,
    last_activity: std::sync::Mutex<Instant>,
}

impl Session {
    /// Spawn `config.command` for `key` with stdin, stdout and stderr piped.
    ///
    /// The child gets `kill_on_drop(true)` and the session key in
    /// [`SESSION_KEY_ENV`]. stderr is drained by a supervised background
    /// task owned by the returned session.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ProcessStart`] if the executable cannot be
    /// launched or one of its pipes cannot be captured.
    pub fn start(key: &str, config: &SpawnConfig) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .env(SESSION_KEY_ENV, key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::ProcessStart(format!("failed to spawn `{}`: {err}", config.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::ProcessStart("failed to capture child stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::ProcessStart("failed to capture child stdout".into()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| AppError::ProcessStart("failed to capture child stderr".into()))?;

        let pid = child.id();
        info!(
            session_key = key,
            pid = pid.unwrap_or(0),
            command = config.command.as_str(),
            "child process spawned"
        );

        let drain_cancel = CancellationToken::new();
        let drain = stderr::spawn_drain(
            key.to_owned(),
            stderr_pipe,
            LineCodec::with_max_length(config.max_line_bytes),
            drain_cancel.clone(),
        );
        let channel = LineChannel::new(
            key,
            Box::pin(stdin),
            Box::pin(stdout),
            LineCodec::with_max_length(config.max_line_bytes),
        );

        let mut session = Self::assemble(key, channel, config.shutdown_grace);
        session.pid = pid;
        session.drain_cancel = drain_cancel;
        session.child = Mutex::new(Some(child));
        session.drain = Mutex::new(Some(drain));
        Ok(session)
    }

    /// Build a session over arbitrary streams with no backing process.
    ///
    /// Used for in-process peers; `close` drops the streams and has nothing
    /// to reap.
    pub fn from_streams<W, R>(key: &str, writer: W, reader: R, codec: LineCodec) -> Self
    where
        W: AsyncWrite + Send + 'static,
        R: AsyncRead + Send + 'static,
    {
        let channel = LineChannel::new(key, Box::pin(writer), Box::pin(reader), codec);
        Self::assemble(key, channel, Duration::ZERO)
    }

    fn assemble(key: &str, channel: LineChannel, shutdown_grace: Duration) -> Self {
        let now = Instant::now();
        Self {
            key: key.to_owned(),
            pid: None,
            channel: Mutex::new(Some(channel)),
            child: Mutex::new(None),
            drain: Mutex::new(None),
            drain_cancel: CancellationToken::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            shutdown_grace,
            created_at: now,
            last_activity: std::sync::Mutex::new(now),
        }
    }

    /// Session key this session was created for.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// OS process id of the child, if the session is process-backed.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether [`Session::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether an abandoned exchange left the child's stdin mid-line.
    ///
    /// A broken session fails every later exchange and should be discarded.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Whether an exchange currently holds the channel.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.channel.try_lock().is_err()
    }

    /// Instant the session was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Instant of the most recent exchange start or finish.
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Relay one request and return the child's response.
    ///
    /// Holds the session lock for the whole round trip. `timeout` bounds the
    /// round trip itself, not the wait for the lock. A failed exchange leaves
    /// the session open; deciding whether to discard it is up to the caller.
    ///
    /// # Errors
    ///
    /// - [`AppError::SessionClosed`] if the session is or becomes closed.
    /// - [`AppError::TransportTimeout`] if `timeout` elapses first.
    /// - Any channel error (`TransportWrite`, `TransportRead`,
    ///   `ProtocolDecode`).
    pub async fn exchange(
        &self,
        request: &RpcRequest,
        timeout: Option<Duration>,
    ) -> Result<RpcResponse> {
        let mut guard = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                return Err(AppError::SessionClosed(format!("session `{}` is closed", self.key)));
            }
            guard = self.channel.lock() => guard,
        };

        let Some(channel) = guard.as_mut() else {
            return Err(AppError::SessionClosed(format!(
                "session `{}` is closed",
                self.key
            )));
        };

        self.touch();
        let outcome = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(AppError::SessionClosed(format!(
                "session `{}` closed during exchange",
                self.key
            ))),
            result = bounded(channel.send(request), timeout) => result,
        };
        self.touch();

        if channel.is_desynced() && !self.broken.swap(true, Ordering::AcqRel) {
            warn!(
                session_key = self.key.as_str(),
                "request write was interrupted, session is no longer usable"
            );
        }

        if let Err(ref err) = outcome {
            debug!(session_key = self.key.as_str(), %err, "exchange failed");
        }
        outcome
    }

    /// Tear the session down: close stdin, wait for the child to exit
    /// (killing it after the grace period), then stop the stderr drain.
    ///
    /// Safe to call repeatedly and concurrently; only the first call acts.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if waiting for or killing the child fails.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();

        // Any exchange holding the lock has observed the token and released it.
        if let Some(mut channel) = self.channel.lock().await.take() {
            channel.shutdown().await;
        }

        let reaped = self.reap_child().await;
        self.finish_drain().await;

        if reaped.is_ok() {
            debug!(session_key = self.key.as_str(), "session closed");
        }
        reaped
    }

    async fn reap_child(&self) -> Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(session_key = self.key.as_str(), %status, "child process exited");
                Ok(())
            }
            Ok(Err(err)) => {
                self.drain_cancel.cancel();
                Err(AppError::Io(format!("failed to wait for child: {err}")))
            }
            Err(_elapsed) => {
                warn!(
                    session_key = self.key.as_str(),
                    grace = ?self.shutdown_grace,
                    "child did not exit after stdin closed, killing"
                );
                self.drain_cancel.cancel();
                child
                    .kill()
                    .await
                    .map_err(|err| AppError::Io(format!("failed to kill child: {err}")))
            }
        }
    }

    /// Let the stderr drain reach EOF, cancelling it if a descendant still
    /// holds the pipe open after the grace period.
    async fn finish_drain(&self) {
        let Some(mut handle) = self.drain.lock().await.take() else {
            return;
        };

        let joined = match tokio::time::timeout(self.shutdown_grace, &mut handle).await {
            Ok(joined) => joined,
            Err(_elapsed) => {
                debug!(
                    session_key = self.key.as_str(),
                    "stderr still open after child exit, stopping drain"
                );
                self.drain_cancel.cancel();
                handle.await
            }
        };

        if let Err(err) = joined {
            warn!(session_key = self.key.as_str(), %err, "stderr drain task failed");
        }
    }
}

/// Await `fut`, failing with [`AppError::TransportTimeout`] after `limit`.
async fn bounded<F>(fut: F, limit: Option<Duration>) -> Result<RpcResponse>
where
    F: std::future::Future<Output = Result<RpcResponse>>,
{
    match limit {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
            AppError::TransportTimeout(format!("no response within {limit:?}"))
        })?,
    }
}
