//! HTTP front-end for the proxy's server mode
//!
//! Exposes SSE and Streamable HTTP ingress endpoints plus a status report
//! on one `host:port`:
//!
//! | Path                       | Methods     | Purpose                                  |
//! |----------------------------|-------------|------------------------------------------|
//! | `/sse`                     | GET         | SSE stream, default server               |
//! | `/messages/`               | POST        | Companion POST endpoint, default server  |
//! | `/mcp`                     | POST/DELETE | Streamable HTTP, default server          |
//! | `/servers/:name/sse`       | GET         | SSE stream, named server                 |
//! | `/servers/:name/messages/` | POST        | Companion POST endpoint, named server    |
//! | `/servers/:name/mcp`       | POST/DELETE | Streamable HTTP, named server            |
//! | `/status`                  | GET         | Liveness report                          |
//!
//! Every ingress session resolves its entry from the path (404 for
//! unknown or disabled names), checks the `Origin` header against the
//! allow-list (403 before anything is spawned), maps configured headers
//! into child environment variables, spawns one child per session, and
//! runs a [`Bridge`](crate::bridge::Bridge) until completion.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::Message;
use crate::config::{NamedServerEntry, NamedServerRegistry, DEFAULT_SERVER_KEY};
use crate::error::{ProxyError, Result};
use crate::server::status::StatusBoard;
use crate::server::streamable::StreamableSessionHandle;
use crate::transport::stdio::StdioTransport;

pub mod sse;
pub mod status;
pub mod streamable;

/// Routing table for live SSE sessions: session id -> ingress sender.
pub(crate) type SseSessionMap = Arc<Mutex<HashMap<Uuid, mpsc::Sender<Message>>>>;

/// Routing table for live Streamable HTTP sessions.
pub(crate) type StreamableSessionMap = Arc<Mutex<HashMap<String, StreamableSessionHandle>>>;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    /// The immutable named-server registry.
    pub registry: Arc<NamedServerRegistry>,
    /// Per-entry live-session counters.
    pub status: Arc<StatusBoard>,
    /// Live SSE sessions.
    pub(crate) sse_sessions: SseSessionMap,
    /// Live Streamable HTTP sessions (stateful mode).
    pub(crate) streamable_sessions: StreamableSessionMap,
    /// Allowed `Origin` values; empty denies all cross-origin requests.
    pub allow_origin: Arc<Vec<String>>,
    /// Stateless Streamable HTTP mode.
    pub stateless: bool,
    /// Global shutdown token; every bridge token is a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Assemble the state for a registry.
    pub fn new(
        registry: Arc<NamedServerRegistry>,
        allow_origin: Vec<String>,
        stateless: bool,
        shutdown: CancellationToken,
    ) -> Self {
        let status = Arc::new(StatusBoard::new(registry.status_names()));
        Self {
            registry,
            status,
            sse_sessions: Arc::new(Mutex::new(HashMap::new())),
            streamable_sessions: Arc::new(Mutex::new(HashMap::new())),
            allow_origin: Arc::new(allow_origin),
            stateless,
            shutdown,
        }
    }
}

/// Error responses for the HTTP surface.
#[derive(Debug)]
pub(crate) enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Forbidden(message) => (StatusCode::FORBIDDEN, message),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        let body = Json(serde_json::json!({ "error": message }));
        (status, body).into_response()
    }
}

/// Build the router for the full URL surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sse", get(sse::default_sse_handler))
        .route("/messages/", post(sse::default_messages_handler))
        .route(
            "/mcp",
            post(streamable::default_mcp_handler).delete(streamable::default_delete_handler),
        )
        .route("/servers/:name/sse", get(sse::named_sse_handler))
        .route("/servers/:name/messages/", post(sse::named_messages_handler))
        .route(
            "/servers/:name/mcp",
            post(streamable::named_mcp_handler).delete(streamable::named_delete_handler),
        )
        .route("/status", get(status::status_handler))
        .with_state(state)
}

/// Bind and serve until the shutdown token flips.
///
/// Returns the bound address via the `on_bound` callback so callers (and
/// tests) can use an ephemeral port.
pub async fn serve(
    state: AppState,
    host: &str,
    port: u16,
    on_bound: impl FnOnce(SocketAddr),
) -> Result<()> {
    let listener = TcpListener::bind((host, port))
        .await
        .map_err(|e| ProxyError::Config(format!("failed to bind {host}:{port}: {e}")))?;
    let addr = listener
        .local_addr()
        .map_err(|e| ProxyError::Transport(format!("failed to read bound address: {e}")))?;
    tracing::info!(%addr, "HTTP front-end listening");
    on_bound(addr);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| ProxyError::Transport(format!("HTTP server failed: {e}")))?;
    Ok(())
}

/// Reject disallowed cross-origin requests before any child is spawned.
///
/// Same-origin requests carry no `Origin` header and always pass. An
/// empty allow-list denies every cross-origin request; a `*` entry
/// allows any origin.
pub(crate) fn check_origin(headers: &HeaderMap, allow_origin: &[String]) -> std::result::Result<(), ApiError> {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return Ok(());
    };
    let allowed = allow_origin
        .iter()
        .any(|a| a == "*" || a.eq_ignore_ascii_case(origin));
    if allowed {
        Ok(())
    } else {
        Err(ApiError::Forbidden(format!("origin `{origin}` is not allowed")))
    }
}

/// Resolve the entry for a path: `None` is the default server.
pub(crate) fn resolve_entry(
    state: &AppState,
    name: Option<&str>,
) -> std::result::Result<NamedServerEntry, ApiError> {
    let entry = match name {
        Some(name) => state.registry.get(name),
        None => state.registry.default_server(),
    };
    entry.cloned().ok_or_else(|| match name {
        Some(name) => ApiError::NotFound(format!("no server named `{name}`")),
        None => ApiError::NotFound("no default server configured".to_string()),
    })
}

/// The status-board key for a path name.
pub(crate) fn status_key(name: Option<&str>) -> String {
    name.unwrap_or(DEFAULT_SERVER_KEY).to_string()
}

/// Map configured request headers into child environment variables.
/// Header-name matching is case-insensitive; absent headers contribute
/// nothing.
pub(crate) fn header_derived_env(
    entry: &NamedServerEntry,
    headers: &HeaderMap,
) -> HashMap<String, String> {
    entry
        .header_to_env
        .iter()
        .filter_map(|(header_name, env_var)| {
            headers
                .get(header_name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|value| (env_var.clone(), value.to_string()))
        })
        .collect()
}

/// Spawn the per-session child for an entry, translating failures into a
/// 500 response.
pub(crate) fn spawn_child(
    state: &AppState,
    entry: &NamedServerEntry,
    headers: &HeaderMap,
) -> std::result::Result<StdioTransport, ApiError> {
    let header_env = header_derived_env(entry, headers);
    let descriptor = entry.spawn_descriptor(&header_env, state.registry.pass_environment());
    StdioTransport::spawn(&descriptor).map_err(|e| {
        tracing::error!(server = %entry.name, "spawn failed: {e}");
        ApiError::Internal(format!("failed to spawn server `{}`", entry.name))
    })
}
