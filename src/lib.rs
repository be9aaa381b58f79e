#![forbid(unsafe_code)]

//! `stdio-bridge` relays JSON-RPC requests received over HTTP to
//! long-lived child processes speaking line-delimited JSON-RPC on stdio.

pub mod config;
pub mod errors;
pub mod gateway;
pub mod protocol;
pub mod session;

pub use config::BridgeConfig;
pub use errors::{AppError, Result};
