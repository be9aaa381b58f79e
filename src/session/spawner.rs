//! Child process launching.
//!
//! [`Launcher`] is the seam between the registry and the operating system:
//! production code uses [`ProcessLauncher`], which starts one process per
//! session through [`Session::start`].

use std::time::Duration;

use crate::protocol::codec::DEFAULT_MAX_LINE_BYTES;
use crate::session::instance::Session;
use crate::Result;

/// Environment variable carrying the session key into the child.
pub const SESSION_KEY_ENV: &str = "STDIO_BRIDGE_SESSION_KEY";

/// Parameters for spawning one child per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Executable name or path; bare names are resolved through `PATH`.
    pub command: String,
    /// Arguments passed to every child.
    pub args: Vec<String>,
    /// Longest stdout/stderr line accepted from the child.
    pub max_line_bytes: usize,
    /// How long `close` waits for the child to exit before killing it.
    pub shutdown_grace: Duration,
}

impl SpawnConfig {
    /// Config for `command` with no arguments and default limits.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Creates the session backing a previously unseen key.
///
/// Called by the registry while it holds its map lock, so implementations
/// must not block; spawning a process or wiring in-memory pipes is fine.
pub trait Launcher: Send + Sync {
    /// Start a new session for `session_key`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::ProcessStart`](crate::AppError::ProcessStart) if the session cannot be started.
    fn launch(&self, session_key: &str) -> Result<Session>;
}

/// [`Launcher`] that spawns an operating-system process per session.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: SpawnConfig,
}

impl ProcessLauncher {
    /// Create a launcher for `config`.
    #[must_use]
    pub fn new(config: SpawnConfig) -> Self {
        Self { config }
    }

    /// Spawn parameters used for every session.
    #[must_use]
    pub fn config(&self) -> &SpawnConfig {
        &self.config
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, session_key: &str) -> Result<Session> {
        Session::start(session_key, &self.config)
    }
}
