//! HTTP boundary of the bridge.

pub mod http;
