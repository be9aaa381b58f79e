//! Bridge configuration parsing, defaults, and environment overrides.

use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::session::registry::{EvictionPolicy, TimeoutPolicy};
use crate::session::spawner::SpawnConfig;
use crate::{AppError, Result};

/// Environment variable selecting the HTTP listen port.
pub const PORT_ENV: &str = "PORT";

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_http_port() -> u16 {
    8080
}

fn default_command() -> String {
    "har-mcp".into()
}

fn default_session_ttl_seconds() -> u64 {
    1800
}

fn default_exchange_timeout_seconds() -> u64 {
    300
}

fn default_shutdown_grace_seconds() -> u64 {
    5
}

fn default_max_line_bytes() -> usize {
    16 * 1024 * 1024
}

/// Bridge configuration parsed from an optional `config.toml`.
///
/// Every key has a default, so an empty document is a valid configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BridgeConfig {
    /// Address the HTTP listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// HTTP listen port; overridden by the `PORT` environment variable.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Child executable, resolved from `PATH` when not absolute.
    #[serde(default = "default_command")]
    pub command: String,
    /// Arguments passed to every spawned child.
    #[serde(default)]
    pub command_args: Vec<String>,
    /// Session lifetime (or idle window, see `eviction`).
    #[serde(default = "default_session_ttl_seconds")]
    pub session_ttl_seconds: u64,
    /// Eviction timer semantics.
    #[serde(default)]
    pub eviction: EvictionPolicy,
    /// Bound on one request/response round trip; 0 means no timeout.
    #[serde(default = "default_exchange_timeout_seconds")]
    pub exchange_timeout_seconds: u64,
    /// What to do with a session whose exchange timed out.
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    /// How long `close` waits for a child to exit before killing it.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    /// Longest response line accepted from a child.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            http_port: default_http_port(),
            command: default_command(),
            command_args: Vec::new(),
            session_ttl_seconds: default_session_ttl_seconds(),
            eviction: EvictionPolicy::default(),
            exchange_timeout_seconds: default_exchange_timeout_seconds(),
            on_timeout: TimeoutPolicy::default(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl BridgeConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the `PORT` environment variable on top of the parsed values.
    ///
    /// An unset or empty variable leaves `http_port` untouched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `PORT` is set but not a valid port.
    pub fn apply_env(&mut self) -> Result<()> {
        match env::var(PORT_ENV) {
            Ok(raw) if raw.trim().is_empty() => {}
            Ok(raw) => {
                self.http_port = raw.trim().parse().map_err(|err| {
                    AppError::Config(format!("{PORT_ENV}={raw:?} is not a valid port: {err}"))
                })?;
            }
            Err(env::VarError::NotPresent) => {}
            Err(err) => {
                warn!(%err, "ignoring unreadable {PORT_ENV} variable");
            }
        }
        Ok(())
    }

    /// Socket address the HTTP listener binds to.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.http_port)
    }

    /// Session lifetime / idle window.
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_seconds)
    }

    /// Exchange timeout, `None` when disabled.
    #[must_use]
    pub fn exchange_timeout(&self) -> Option<Duration> {
        (self.exchange_timeout_seconds > 0).then(|| Duration::from_secs(self.exchange_timeout_seconds))
    }

    /// Child launch parameters derived from this configuration.
    #[must_use]
    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            command: self.command.clone(),
            args: self.command_args.clone(),
            max_line_bytes: self.max_line_bytes,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(AppError::Config("command must not be empty".into()));
        }

        if self.session_ttl_seconds == 0 {
            return Err(AppError::Config(
                "session_ttl_seconds must be greater than zero".into(),
            ));
        }

        if self.max_line_bytes == 0 {
            return Err(AppError::Config(
                "max_line_bytes must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
