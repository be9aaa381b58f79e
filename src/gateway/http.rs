//! HTTP request gateway.
//!
//! Mounts two routes on an axum router:
//!
//! | Route          | Behaviour                                              |
//! |----------------|--------------------------------------------------------|
//! | `POST /mcp`    | Relay one JSON-RPC request to the caller's session     |
//! | `* /health`    | Liveness probe, always `200 OK` with body `OK`         |
//!
//! Other methods on `/mcp` get `405 Method Not Allowed` from the router
//! before any session is touched.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::protocol::envelope::{RpcRequest, RpcResponse};
use crate::session::{SessionRegistry, TimeoutPolicy};
use crate::{AppError, Result};

/// Header selecting the caller's session.
pub const SESSION_HEADER: &str = "x-session-id";

/// Session key used when [`SESSION_HEADER`] is absent or empty.
pub const DEFAULT_SESSION_KEY: &str = "default";

/// Shared state handed to every request handler.
#[derive(Debug)]
pub struct GatewayState {
    /// Registry resolving session keys to live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Bound on one child round trip; `None` waits indefinitely.
    pub exchange_timeout: Option<Duration>,
    /// What to do with a session whose exchange timed out.
    pub on_timeout: TimeoutPolicy,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl GatewayState {
    /// State for `registry` with the timeouts and limits from `config`.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: &BridgeConfig) -> Self {
        Self {
            registry,
            exchange_timeout: config.exchange_timeout(),
            on_timeout: config.on_timeout,
            max_body_bytes: config.max_line_bytes,
        }
    }
}

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        .route("/mcp", post(handle_rpc))
        .route("/health", any(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Bind `addr` and serve the gateway until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Config` if the listener cannot bind, or `AppError::Io`
/// if the server fails while running.
pub async fn serve(addr: SocketAddr, state: Arc<GatewayState>, ct: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind HTTP on {addr}: {err}")))?;
    serve_on(listener, state, ct).await
}

/// Serve the gateway on an already bound `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Io` if the server fails while running.
pub async fn serve_on(
    listener: TcpListener,
    state: Arc<GatewayState>,
    ct: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Io(format!("listener has no local address: {err}")))?;
    info!(addr = %local, "starting HTTP gateway");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Io(format!("HTTP server error: {err}")))?;

    info!("HTTP gateway shut down");
    Ok(())
}

/// Handler for `/health`, any method.
async fn health() -> &'static str {
    "OK"
}

/// Handler for `POST /mcp`.
async fn handle_rpc(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let key = session_key(&headers);

    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            let err = AppError::RequestDecode(format!("invalid JSON: {err}"));
            warn!(session_key = key.as_str(), %err, "rejecting request body");
            return error_response(StatusCode::BAD_REQUEST, &err);
        }
    };

    debug!(
        session_key = key.as_str(),
        method = request.method_name(),
        "relaying request"
    );

    // The exchange runs detached: a client disconnect must not abort a round
    // trip between its write and its read, and a panic stays inside the task.
    let task_key = key.clone();
    let task = tokio::spawn(async move { forward(&state, &task_key, &request).await });

    match task.await {
        Ok(Ok(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Err(err)) => {
            error!(session_key = key.as_str(), %err, "request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err)
        }
        Err(join_err) => {
            error!(session_key = key.as_str(), error = %join_err, "request task aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error while relaying request",
            )
                .into_response()
        }
    }
}

/// Resolve the caller's session and relay `request` through it.
async fn forward(state: &GatewayState, key: &str, request: &RpcRequest) -> Result<RpcResponse> {
    let session = state.registry.resolve(key).await?;

    match session.exchange(request, state.exchange_timeout).await {
        Err(err @ AppError::TransportTimeout(_)) => {
            // A retained session stays usable unless the timeout cut a write short.
            if state.on_timeout == TimeoutPolicy::Evict || session.is_broken() {
                warn!(session_key = key, "discarding session after exchange timeout");
                if let Err(close_err) = state.registry.discard(&session).await {
                    warn!(session_key = key, error = %close_err, "failed to close timed-out session");
                }
            }
            Err(err)
        }
        other => other,
    }
}

/// Read the session key from [`SESSION_HEADER`], defaulting when absent or empty.
///
/// The key is opaque: bytes outside UTF-8 are replaced rather than rejected.
#[must_use]
pub fn session_key(headers: &HeaderMap) -> String {
    match headers.get(SESSION_HEADER) {
        Some(value) if !value.is_empty() => {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        }
        _ => DEFAULT_SESSION_KEY.to_owned(),
    }
}

fn error_response(status: StatusCode, err: &AppError) -> Response {
    (status, err.to_string()).into_response()
}
