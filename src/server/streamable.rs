//! Streamable HTTP ingress: single-endpoint request/response + streaming
//!
//! POSTs on `/mcp` (or `/servers/:name/mcp`) carry one envelope each.
//!
//! **Stateful mode** (the default): an `initialize` POST without an
//! `Mcp-Session-Id` header spawns the entry's child and a persistent
//! bridge, and the response carries a fresh session id header. Subsequent
//! POSTs route into the live session by that header. A request POST is
//! answered with an SSE stream carrying, in order, any server-to-client
//! messages and finally the matching response; notification and response
//! POSTs are acknowledged `202 Accepted`. DELETE with the session header
//! tears the session down.
//!
//! **Stateless mode** (`--stateless`): every POST builds and tears down a
//! whole bridge with its own child spawn. This is expensive by design;
//! the operator opted into it. `initialize` is answered from a fresh
//! upstream handshake without being forwarded, other requests are
//! forwarded after a fabricated handshake under the proxy's own identity.
//!
//! Server-initiated messages that arrive while no request stream is open
//! have nowhere to be delivered in a pure POST model; they are logged and
//! dropped. Peers needing unsolicited notifications should use the SSE
//! ingress instead.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::{mirrored_initialize_result, Bridge};
use crate::codec::{Message, MessageId};
use crate::error::Result;
use crate::server::status::SessionGuard;
use crate::server::{
    check_origin, resolve_entry, spawn_child, status_key, ApiError, AppState,
};
use crate::session::{proxy_initialize_params, SessionEndpoint};
use crate::transport::{Transport, INBOUND_CAPACITY};

/// Header carrying the session identifier, both directions.
const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Per-request stream capacity: a response plus a handful of progress
/// notifications in flight.
const REQUEST_STREAM_CAPACITY: usize = 8;

/// Routes upstream-originated messages to the open request streams.
#[derive(Debug, Default)]
struct ResponseRouter {
    /// Request id -> the per-request stream feeding that POST's response.
    waiters: HashMap<MessageId, mpsc::Sender<Message>>,
    /// Open request ids, oldest first; notifications go to the oldest.
    order: Vec<MessageId>,
}

/// The ingress half of a Streamable HTTP session, as seen by the bridge.
#[derive(Debug)]
pub(crate) struct StreamableServerTransport {
    /// Messages pushed in by the POST handlers.
    inbound: Mutex<mpsc::Receiver<Message>>,
    /// Outbound routing state, shared with the session handle.
    router: Arc<Mutex<ResponseRouter>>,
    /// Flipped on close.
    cancel: CancellationToken,
}

/// The handler-facing side of a live session.
#[derive(Debug, Clone)]
pub(crate) struct StreamableSessionHandle {
    inbound_tx: mpsc::Sender<Message>,
    router: Arc<Mutex<ResponseRouter>>,
    cancel: CancellationToken,
}

impl StreamableServerTransport {
    /// Build the transport plus its session handle.
    pub(crate) fn channels() -> (Self, StreamableSessionHandle) {
        let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_CAPACITY);
        let router = Arc::new(Mutex::new(ResponseRouter::default()));
        let cancel = CancellationToken::new();
        (
            Self {
                inbound: Mutex::new(inbound_rx),
                router: Arc::clone(&router),
                cancel: cancel.clone(),
            },
            StreamableSessionHandle {
                inbound_tx,
                router,
                cancel,
            },
        )
    }
}

impl StreamableSessionHandle {
    /// Open a per-request stream for `id`; messages routed to it end with
    /// the matching response.
    async fn register(&self, id: MessageId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel::<Message>(REQUEST_STREAM_CAPACITY);
        let mut router = self.router.lock().await;
        router.order.push(id.clone());
        router.waiters.insert(id, tx);
        rx
    }

    /// Feed one client message into the bridge. Fails when the session
    /// has ended.
    async fn push(&self, message: Message) -> std::result::Result<(), ()> {
        self.inbound_tx.send(message).await.map_err(|_| ())
    }

    /// Tear the session down (DELETE, or server shutdown).
    fn close(&self) {
        self.cancel.cancel();
    }
}

#[async_trait::async_trait]
impl Transport for StreamableServerTransport {
    /// Route an upstream message: responses to their waiting request
    /// stream (which then ends), everything else to the oldest open
    /// request stream.
    async fn send(&self, message: Message) -> Result<()> {
        let waiter = {
            let mut router = self.router.lock().await;
            match message.id() {
                Some(id) if matches!(message, Message::Response { .. }) => {
                    let waiter = router.waiters.remove(id);
                    if waiter.is_some() {
                        let id = id.clone();
                        router.order.retain(|open| *open != id);
                    }
                    waiter
                }
                _ => router
                    .order
                    .first()
                    .and_then(|oldest| router.waiters.get(oldest).cloned()),
            }
        };

        match waiter {
            Some(tx) => {
                // The receiving POST handler may have disconnected; that
                // only loses this stream, not the session.
                let _ = tx.send(message).await;
            }
            None => {
                tracing::debug!(
                    "no open request stream for server-initiated message; dropping"
                );
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Message> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            message = inbound.recv() => message,
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        // Dropping the waiters ends every open request stream.
        let mut router = self.router.lock().await;
        router.waiters.clear();
        router.order.clear();
    }
}

/// `POST /mcp`
pub(crate) async fn default_mcp_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> std::result::Result<Response, ApiError> {
    handle_post(state, None, headers, body).await
}

/// `POST /servers/:name/mcp`
pub(crate) async fn named_mcp_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: String,
) -> std::result::Result<Response, ApiError> {
    handle_post(state, Some(name), headers, body).await
}

/// `DELETE /mcp`
pub(crate) async fn default_delete_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<StatusCode, ApiError> {
    handle_delete(state, headers).await
}

/// `DELETE /servers/:name/mcp`
pub(crate) async fn named_delete_handler(
    State(state): State<AppState>,
    Path(_name): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<StatusCode, ApiError> {
    handle_delete(state, headers).await
}

/// Shared POST flow.
async fn handle_post(
    state: AppState,
    name: Option<String>,
    headers: HeaderMap,
    body: String,
) -> std::result::Result<Response, ApiError> {
    check_origin(&headers, &state.allow_origin)?;
    let message = Message::decode(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if state.stateless {
        return stateless_exchange(state, name, headers, message).await;
    }

    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    match session_id {
        None => open_session(state, name, headers, message).await,
        Some(session_id) => continue_session(state, session_id, message).await,
    }
}

/// First POST of a stateful session: must be `initialize`.
async fn open_session(
    state: AppState,
    name: Option<String>,
    headers: HeaderMap,
    message: Message,
) -> std::result::Result<Response, ApiError> {
    if !message.is_initialize() {
        return Err(ApiError::BadRequest(format!(
            "a new session must start with initialize (or send {SESSION_ID_HEADER})"
        )));
    }
    let Some(request_id) = message.id().cloned() else {
        return Err(ApiError::BadRequest("initialize request has no id".to_string()));
    };

    let entry = resolve_entry(&state, name.as_deref())?;
    let child = spawn_child(&state, &entry, &headers)?;

    let (ingress, handle) = StreamableServerTransport::channels();
    let session_id = Uuid::new_v4().to_string();
    state
        .streamable_sessions
        .lock()
        .await
        .insert(session_id.clone(), handle.clone());

    let guard = SessionGuard::new(Arc::clone(&state.status), status_key(name.as_deref()));
    let bridge = Bridge::new(Arc::new(ingress), Arc::new(child), &state.shutdown);
    let sessions = Arc::clone(&state.streamable_sessions);
    let cleanup_id = session_id.clone();
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = bridge.run().await {
            tracing::warn!(session = %cleanup_id, "bridge ended with error: {e}");
        }
        sessions.lock().await.remove(&cleanup_id);
    });

    let stream = handle.register(request_id).await;
    if handle.push(message).await.is_err() {
        return Err(ApiError::Internal("session closed during initialize".to_string()));
    }

    let mut response = request_stream_response(stream);
    match HeaderValue::from_str(&session_id) {
        Ok(value) => {
            response.headers_mut().insert(SESSION_ID_HEADER, value);
        }
        Err(_) => {
            tracing::error!("generated session id is not a valid header value");
        }
    }
    Ok(response)
}

/// A later POST routed into a live session by its id header.
async fn continue_session(
    state: AppState,
    session_id: String,
    message: Message,
) -> std::result::Result<Response, ApiError> {
    let handle = state.streamable_sessions.lock().await.get(&session_id).cloned();
    let Some(handle) = handle else {
        return Err(ApiError::NotFound(format!("unknown session {session_id}")));
    };

    match &message {
        Message::Request { id, .. } => {
            let stream = handle.register(id.clone()).await;
            if handle.push(message).await.is_err() {
                return Err(ApiError::NotFound(format!("session {session_id} has closed")));
            }
            Ok(request_stream_response(stream))
        }
        _ => {
            if handle.push(message).await.is_err() {
                return Err(ApiError::NotFound(format!("session {session_id} has closed")));
            }
            Ok(StatusCode::ACCEPTED.into_response())
        }
    }
}

/// Shared DELETE flow: explicit session termination.
async fn handle_delete(
    state: AppState,
    headers: HeaderMap,
) -> std::result::Result<StatusCode, ApiError> {
    let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
    else {
        return Err(ApiError::BadRequest(format!("missing {SESSION_ID_HEADER} header")));
    };

    let handle = state.streamable_sessions.lock().await.remove(&session_id);
    let Some(handle) = handle else {
        return Err(ApiError::NotFound(format!("unknown session {session_id}")));
    };
    handle.close();
    Ok(StatusCode::OK)
}

/// Answer a request POST with an SSE stream that carries intermediate
/// messages and ends with the matching response.
fn request_stream_response(stream: mpsc::Receiver<Message>) -> Response {
    let events = ReceiverStream::new(stream).map(|message| {
        Ok::<Event, std::convert::Infallible>(
            Event::default().event("message").data(message.encode()),
        )
    });
    Sse::new(events).keep_alive(KeepAlive::default()).into_response()
}

/// Stateless mode: one whole bridge (and child) per POST.
async fn stateless_exchange(
    state: AppState,
    name: Option<String>,
    headers: HeaderMap,
    message: Message,
) -> std::result::Result<Response, ApiError> {
    let entry = resolve_entry(&state, name.as_deref())?;
    let child = spawn_child(&state, &entry, &headers)?;
    let guard = SessionGuard::new(Arc::clone(&state.status), status_key(name.as_deref()));
    let mut session = SessionEndpoint::new(Arc::new(child));

    if message.is_initialize() {
        // Answered from a fresh upstream handshake; the client's params
        // are forwarded so identity and capabilities stay truthful.
        let Some(request_id) = message.id().cloned() else {
            return Err(ApiError::BadRequest("initialize request has no id".to_string()));
        };
        let params = message.params().cloned().unwrap_or_else(|| json!({}));
        let peer = session.initiate(params).await.map_err(|e| {
            tracing::warn!("stateless initialize failed: {e}");
            ApiError::Internal("upstream handshake failed".to_string())
        })?;
        let result = mirrored_initialize_result(&peer);
        session.close().await;
        drop(guard);

        let body = Message::response(request_id, result).encode();
        return Ok((
            StatusCode::OK,
            [("content-type", "application/json")],
            body,
        )
            .into_response());
    }

    // Fabricate the handshake under the proxy's own identity, then
    // forward the posted message.
    session.initiate(proxy_initialize_params()).await.map_err(|e| {
        tracing::warn!("stateless handshake failed: {e}");
        ApiError::Internal("upstream handshake failed".to_string())
    })?;

    match &message {
        Message::Request { id, .. } => {
            let request_id = id.clone();
            session.send(message.clone()).await.map_err(|e| {
                tracing::warn!("stateless forward failed: {e}");
                ApiError::Internal("failed to forward request".to_string())
            })?;

            // Relay everything until the matching response, then tear the
            // whole session (and child) down.
            let (tx, rx) = mpsc::channel::<Message>(REQUEST_STREAM_CAPACITY);
            tokio::spawn(async move {
                let _guard = guard;
                loop {
                    let Some(reply) = session.recv().await else { break };
                    let done = matches!(&reply, Message::Response { id, .. } if *id == request_id);
                    if tx.send(reply).await.is_err() {
                        break;
                    }
                    if done {
                        break;
                    }
                }
                session.close().await;
            });
            Ok(request_stream_response(rx))
        }
        _ => {
            let send_result = session.send(message).await;
            session.close().await;
            drop(guard);
            send_result.map_err(|e| {
                tracing::warn!("stateless forward failed: {e}");
                ApiError::Internal("failed to forward message".to_string())
            })?;
            Ok(StatusCode::ACCEPTED.into_response())
        }
    }
}
