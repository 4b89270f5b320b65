//! Streamable HTTP client transport (single-endpoint MCP)
//!
//! Every outbound message is an HTTP POST to one endpoint. The server may
//! reply with:
//!
//! - `application/json` -- a direct JSON envelope
//! - `text/event-stream` -- an SSE stream carrying one or more envelopes
//! - `202 Accepted` -- an acknowledgement with no body (notifications)
//!
//! # Session management
//!
//! In stateful mode the server may return an `Mcp-Session-Id` header on
//! the first successful response; when present it is stored and attached
//! to every subsequent POST, and a best-effort DELETE with the same header
//! is issued on `close`. A `404` while a session is active means the
//! session expired and terminates the transport. In stateless mode no
//! session identifier is ever retained.
//!
//! # Authentication
//!
//! Same contract as the SSE transport: static headers on every request,
//! optional OAuth client-credentials bearer with a single refresh retry
//! after a `401`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::ClientCredentials;
use crate::codec::Message;
use crate::error::{ProxyError, Result};
use crate::transport::sse::{parse_sse_stream, SseEvent};
use crate::transport::{decode_inbound, Transport, INBOUND_CAPACITY};

/// Header carrying the server-assigned session identifier.
const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Timeout for the best-effort session DELETE on close.
const SESSION_DELETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Streamable HTTP client transport.
#[derive(Debug)]
pub struct StreamableHttpTransport {
    /// Shared HTTP client (TLS policy applied by the caller).
    http: reqwest::Client,
    /// The MCP endpoint URL (POST target).
    endpoint: Url,
    /// Static extra headers merged into every request.
    headers: HashMap<String, String>,
    /// Optional OAuth client-credentials token source.
    auth: Option<Arc<ClientCredentials>>,
    /// Stateless mode: never retain a session identifier.
    stateless: bool,
    /// Active session ID (stateful mode only).
    session_id: RwLock<Option<String>>,
    /// Sender for inbound messages; cloned into SSE parser tasks.
    inbound_tx: mpsc::Sender<Message>,
    /// Shared receiver exposed via `recv`.
    inbound: Mutex<mpsc::Receiver<Message>>,
    /// Flipped on close.
    cancel: CancellationToken,
}

impl StreamableHttpTransport {
    /// Construct a transport targeting `endpoint`. No network I/O happens
    /// until the first `send`.
    pub fn new(
        http: reqwest::Client,
        endpoint: Url,
        headers: HashMap<String, String>,
        auth: Option<Arc<ClientCredentials>>,
        stateless: bool,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_CAPACITY);
        Self {
            http,
            endpoint,
            headers,
            auth,
            stateless,
            session_id: RwLock::new(None),
            inbound_tx,
            inbound: Mutex::new(inbound_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Issue one POST attempt; `refresh_auth` forces a token refresh first.
    async fn post_once(&self, body: &str, refresh_auth: bool) -> Result<reqwest::Response> {
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body.to_string());

        {
            let sid = self.session_id.read().await;
            if let Some(id) = sid.as_ref() {
                req = req.header(SESSION_ID_HEADER, id.as_str());
            }
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(auth) = &self.auth {
            let token = if refresh_auth { auth.refresh().await? } else { auth.bearer().await? };
            req = req.bearer_auth(token);
        }

        req.send()
            .await
            .map_err(|e| ProxyError::Transport(format!("HTTP POST failed: {e}")).into())
    }

    /// Dispatch a successful response by content type.
    async fn dispatch_response(&self, response: reqwest::Response) -> Result<()> {
        // Capture the session ID the server assigned (stateful mode only,
        // first assignment wins).
        if !self.stateless {
            if let Some(new_id) = response
                .headers()
                .get(SESSION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
            {
                let mut sid = self.session_id.write().await;
                if sid.is_none() {
                    *sid = Some(new_id);
                }
            }
        }

        if response.status() == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            // Stream the body in the background; each event becomes one
            // inbound message.
            let byte_stream = response.bytes_stream();
            let inbound_tx = self.inbound_tx.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let (events_tx, mut events_rx) = mpsc::channel::<SseEvent>(INBOUND_CAPACITY);
                let parser = tokio::spawn(parse_sse_stream(byte_stream, events_tx));
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events_rx.recv() => match event {
                            Some(event) => event,
                            None => break,
                        },
                    };
                    let Some(message) = decode_inbound(&event.data) else {
                        continue;
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = inbound_tx.send(message) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                parser.abort();
            });
            return Ok(());
        }

        // application/json or anything else with a body: one envelope.
        let body = response
            .text()
            .await
            .map_err(|e| ProxyError::Transport(format!("failed to read response body: {e}")))?;
        if !body.trim().is_empty() {
            if let Some(message) = decode_inbound(&body) {
                let _ = self.inbound_tx.send(message).await;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for StreamableHttpTransport {
    /// POST one message and dispatch whatever the server answers with.
    async fn send(&self, message: Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProxyError::TransportClosed.into());
        }
        let body = message.encode();

        for attempt in 0..2 {
            let response = self.post_once(&body, attempt > 0).await?;
            let status = response.status();

            if status == reqwest::StatusCode::UNAUTHORIZED {
                if self.auth.is_some() && attempt == 0 {
                    continue;
                }
                self.cancel.cancel();
                return Err(
                    ProxyError::AuthFailure(format!("endpoint returned HTTP {status}")).into()
                );
            }

            if status == reqwest::StatusCode::NOT_FOUND {
                let had_session = {
                    let mut sid = self.session_id.write().await;
                    sid.take().is_some()
                };
                if had_session {
                    // The server forgot the session; the bridge observes
                    // end-of-stream and tears down.
                    self.cancel.cancel();
                    return Err(ProxyError::Transport("MCP session expired".to_string()).into());
                }
                return Err(ProxyError::Transport("HTTP 404 Not Found".to_string()).into());
            }

            if !status.is_success() {
                return Err(
                    ProxyError::Transport(format!("endpoint returned HTTP {status}")).into()
                );
            }

            return self.dispatch_response(response).await;
        }
        Err(ProxyError::AuthFailure("endpoint rejected request after token refresh".to_string())
            .into())
    }

    async fn recv(&self) -> Option<Message> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            message = inbound.recv() => message,
        }
    }

    /// Cancel streaming tasks and, in stateful mode, terminate the session
    /// with a best-effort DELETE.
    async fn close(&self) {
        self.cancel.cancel();

        let session_id = self.session_id.write().await.take();
        if let Some(sid) = session_id {
            let mut req = self
                .http
                .delete(self.endpoint.clone())
                .header(SESSION_ID_HEADER, sid)
                .timeout(SESSION_DELETE_TIMEOUT);
            for (k, v) in &self.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Err(e) = req.send().await {
                tracing::debug!("session DELETE failed (ignored): {e}");
            }
        }
    }
}
