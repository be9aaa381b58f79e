//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all bridge failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The child executable could not be launched.
    ProcessStart(String),
    /// Writing a request line to the child's stdin failed.
    TransportWrite(String),
    /// Reading a response line from the child's stdout failed or hit EOF.
    TransportRead(String),
    /// The child did not answer within the exchange timeout.
    TransportTimeout(String),
    /// The child's response line is not a valid response envelope.
    ProtocolDecode(String),
    /// The inbound HTTP body is not a valid request envelope.
    RequestDecode(String),
    /// The session was closed before or during the exchange.
    SessionClosed(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::ProcessStart(msg) => write!(f, "process start: {msg}"),
            Self::TransportWrite(msg) => write!(f, "transport write: {msg}"),
            Self::TransportRead(msg) => write!(f, "transport read: {msg}"),
            Self::TransportTimeout(msg) => write!(f, "transport timeout: {msg}"),
            Self::ProtocolDecode(msg) => write!(f, "protocol decode: {msg}"),
            Self::RequestDecode(msg) => write!(f, "request decode: {msg}"),
            Self::SessionClosed(msg) => write!(f, "session closed: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}
