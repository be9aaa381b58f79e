//! Per-client child process sessions.
//!
//! Each session key owns one long-lived child process speaking
//! line-delimited JSON-RPC over its standard streams.
//!
//! Submodules:
//! - `channel`: one-line-out / one-line-in transport over the child's pipes.
//! - `instance`: [`Session`](instance::Session), the serialised owner of a
//!   child and its channel.
//! - `registry`: lazily populated key → session map with eviction.
//! - `spawner`: the [`Launcher`](spawner::Launcher) seam and its process-backed
//!   implementation.
//! - `stderr`: supervised drain of the child's diagnostic stream.

pub mod channel;
pub mod instance;
pub mod registry;
pub mod spawner;
pub mod stderr;

pub use instance::Session;
pub use registry::{EvictionPolicy, SessionRegistry, TimeoutPolicy};
