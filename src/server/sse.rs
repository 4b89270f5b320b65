//! SSE ingress: the server side of the classic two-channel transport
//!
//! A GET on `/sse` (or `/servers/:name/sse`) spawns the entry's child,
//! wires a bridge, and answers with a `text/event-stream` whose first
//! event is `endpoint` (the companion POST path, carrying a fresh
//! `session_id`) followed by one `message` event per server-to-client
//! envelope. Client-to-server messages arrive as POSTs on the companion
//! endpoint and are routed to the session by id; each is acknowledged
//! with `202 Accepted`.
//!
//! The SSE response stream ends when the bridge ends, so ingress peers
//! observe lifecycle coupling as their stream closing.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bridge::Bridge;
use crate::codec::Message;
use crate::error::{ProxyError, Result};
use crate::server::status::SessionGuard;
use crate::server::{
    check_origin, resolve_entry, spawn_child, status_key, ApiError, AppState,
};
use crate::transport::{Transport, INBOUND_CAPACITY};

/// The ingress half of an SSE session, as seen by the bridge.
///
/// Outbound (`send`) messages become SSE `message` events; inbound
/// messages are fed by the companion POST handler.
#[derive(Debug)]
pub(crate) struct SseServerTransport {
    /// Feeds the SSE response stream; `None` once closed.
    events_tx: Mutex<Option<mpsc::Sender<Message>>>,
    /// Messages routed in from the POST handler.
    inbound: Mutex<mpsc::Receiver<Message>>,
    /// Flipped on close to unblock a pending `recv`.
    cancel: CancellationToken,
}

impl SseServerTransport {
    /// Build the transport plus its two far ends: the POST-side sender
    /// and the SSE-stream receiver.
    pub(crate) fn channels() -> (Self, mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        let (post_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel::<Message>(INBOUND_CAPACITY);
        (
            Self {
                events_tx: Mutex::new(Some(events_tx)),
                inbound: Mutex::new(inbound_rx),
                cancel: CancellationToken::new(),
            },
            post_tx,
            events_rx,
        )
    }
}

#[async_trait::async_trait]
impl Transport for SseServerTransport {
    async fn send(&self, message: Message) -> Result<()> {
        let guard = self.events_tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(ProxyError::TransportClosed.into());
        };
        tx.send(message)
            .await
            .map_err(|_| ProxyError::TransportClosed.into())
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
        // Dropping the sender ends the SSE response stream.
        self.events_tx.lock().await.take();
    }
}

/// `GET /sse`
pub(crate) async fn default_sse_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    open_sse_session(state, None, headers).await
}

/// `GET /servers/:name/sse`
pub(crate) async fn named_sse_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    open_sse_session(state, Some(name), headers).await
}

/// Shared GET flow: origin check, entry lookup, child spawn, bridge
/// launch, SSE response assembly.
async fn open_sse_session(
    state: AppState,
    name: Option<String>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    check_origin(&headers, &state.allow_origin)?;
    let entry = resolve_entry(&state, name.as_deref())?;
    let child = spawn_child(&state, &entry, &headers)?;

    let (ingress, post_tx, events_rx) = SseServerTransport::channels();
    let session_id = Uuid::new_v4();
    state.sse_sessions.lock().await.insert(session_id, post_tx);

    let endpoint = match &name {
        Some(name) => format!("/servers/{name}/messages/?session_id={session_id}"),
        None => format!("/messages/?session_id={session_id}"),
    };

    let guard = SessionGuard::new(Arc::clone(&state.status), status_key(name.as_deref()));
    let bridge = Bridge::new(Arc::new(ingress), Arc::new(child), &state.shutdown);
    let sessions = Arc::clone(&state.sse_sessions);
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = bridge.run().await {
            tracing::warn!(session = %session_id, "bridge ended with error: {e}");
        }
        sessions.lock().await.remove(&session_id);
    });

    let first = futures::stream::once(async move {
        Ok::<Event, Infallible>(Event::default().event("endpoint").data(endpoint))
    });
    let rest = ReceiverStream::new(events_rx)
        .map(|message| Ok::<Event, Infallible>(Event::default().event("message").data(message.encode())));

    Ok(Sse::new(first.chain(rest))
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Query parameters of the companion POST endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct MessagesQuery {
    session_id: Uuid,
}

/// `POST /messages/`
pub(crate) async fn default_messages_handler(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    body: String,
) -> std::result::Result<StatusCode, ApiError> {
    post_message(state, query, body).await
}

/// `POST /servers/:name/messages/`
///
/// The session id alone identifies the session; the name segment only
/// keeps the URL surface symmetric.
pub(crate) async fn named_messages_handler(
    State(state): State<AppState>,
    Path(_name): Path<String>,
    Query(query): Query<MessagesQuery>,
    body: String,
) -> std::result::Result<StatusCode, ApiError> {
    post_message(state, query, body).await
}

/// Shared POST flow: decode, route by session id, acknowledge.
async fn post_message(
    state: AppState,
    query: MessagesQuery,
    body: String,
) -> std::result::Result<StatusCode, ApiError> {
    let message =
        Message::decode(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let tx = state.sse_sessions.lock().await.get(&query.session_id).cloned();
    let Some(tx) = tx else {
        return Err(ApiError::NotFound(format!("unknown session {}", query.session_id)));
    };
    tx.send(message)
        .await
        .map_err(|_| ApiError::NotFound(format!("session {} has closed", query.session_id)))?;
    Ok(StatusCode::ACCEPTED)
}
