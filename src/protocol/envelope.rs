//! JSON-RPC request and response envelopes relayed by the bridge.
//!
//! The bridge never interprets payloads. `id`, `params`, `result` and
//! `error` are kept as raw JSON text, so numbers, key order and spacing
//! reach the other side exactly as they were sent. Optional members keep
//! their presence across a decode/encode cycle: an absent `id` stays absent
//! and an explicit `"id": null` stays `null`.
//!
//! `jsonrpc` and `method` are not checked either; a document missing them
//! is relayed without them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

/// Raw JSON text of one member.
pub type RawJson = Box<RawValue>;

/// Request envelope forwarded from HTTP to the child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Protocol version string, relayed verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Correlation token; `Some("null")` is an explicit `null`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<RawJson>,
    /// Method name, relayed verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Opaque parameters.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<RawJson>,
}

/// Response envelope read from the child's stdout and returned over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Protocol version string, relayed verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Echoed correlation token.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<RawJson>,
    /// Success payload.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<RawJson>,
    /// Failure payload.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<RawJson>,
}

impl RpcRequest {
    /// Build a `"2.0"` request with the given raw id and params.
    #[must_use]
    pub fn new(id: Option<RawJson>, method: impl Into<String>, params: Option<RawJson>) -> Self {
        Self {
            jsonrpc: Some("2.0".into()),
            id,
            method: Some(method.into()),
            params,
        }
    }

    /// Method name for logging; empty when absent.
    #[must_use]
    pub fn method_name(&self) -> &str {
        self.method.as_deref().unwrap_or_default()
    }

    /// Raw JSON text of `id`, if present.
    #[must_use]
    pub fn id_json(&self) -> Option<&str> {
        self.id.as_deref().map(RawValue::get)
    }
}

impl RpcResponse {
    /// Raw JSON text of `id`, if present.
    #[must_use]
    pub fn id_json(&self) -> Option<&str> {
        self.id.as_deref().map(RawValue::get)
    }

    /// Raw JSON text of `result`, if present.
    #[must_use]
    pub fn result_json(&self) -> Option<&str> {
        self.result.as_deref().map(RawValue::get)
    }

    /// Raw JSON text of `error`, if present.
    #[must_use]
    pub fn error_json(&self) -> Option<&str> {
        self.error.as_deref().map(RawValue::get)
    }
}

/// Deserialize a member that is present in the document, keeping `null`.
///
/// Paired with `#[serde(default)]`, a missing member becomes `None` while a
/// present one (including `null`) becomes `Some`.
fn present<'de, D>(deserializer: D) -> Result<Option<RawJson>, D::Error>
where
    D: Deserializer<'de>,
{
    RawJson::deserialize(deserializer).map(Some)
}
