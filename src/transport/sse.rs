//! SSE client transport (GET event stream + companion POST endpoint)
//!
//! This is the classic two-channel MCP HTTP transport: a long-lived GET
//! returns a `text/event-stream` carrying server-to-client messages, and
//! client-to-server messages are POSTed to a companion endpoint. The
//! companion URL is not known up front: the server announces it in the
//! first SSE event, which has type `endpoint` and a URL (usually relative)
//! as its data. Subsequent events have type `message` and carry one JSON
//! envelope each.
//!
//! # SSE framing
//!
//! Events are separated by blank lines. Within an event, `event:` names
//! the type, `data:` lines carry the payload (joined with `\n` when
//! repeated), and `id:`/`retry:` fields are ignored. Ping events
//! (`event: ping` or `data: [PING]`) are discarded silently.
//!
//! # Authentication
//!
//! The static header map is merged into every request. When OAuth
//! client-credentials are configured, a bearer token is attached and a
//! single refresh retry is performed after a `401`; a second `401` fails
//! the operation with an authentication failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::ClientCredentials;
use crate::codec::Message;
use crate::error::{ProxyError, Result};
use crate::transport::{decode_inbound, Transport, INBOUND_CAPACITY};

/// How long `send` waits for the server to announce the POST endpoint.
const ENDPOINT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// SSE event type announcing the companion POST endpoint.
const EVENT_ENDPOINT: &str = "endpoint";

/// One parsed SSE event: the optional `event:` type and the joined `data:`
/// payload. Ping frames and empty events are filtered out by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    /// The `event:` field, when present. Absent means the default type
    /// (`message`).
    pub event: Option<String>,
    /// The joined `data:` lines.
    pub data: String,
}

/// Parse an SSE byte stream and forward complete events to `events_tx`.
///
/// Intended to run inside a `tokio::spawn`; consumes the stream until it
/// ends or errors. Ping events and events with empty data are discarded.
pub(crate) async fn parse_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    events_tx: mpsc::Sender<SseEvent>,
) {
    use futures::StreamExt;

    // Accumulates raw text between `\n\n` boundaries.
    let mut buffer = String::new();

    tokio::pin!(byte_stream);

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(_) => break,
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        buffer.push_str(text);

        while let Some(pos) = buffer.find("\n\n") {
            let event_block = buffer[..pos].to_string();
            buffer = buffer[pos + 2..].to_string();
            if let Some(event) = parse_sse_event(&event_block) {
                if events_tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    }

    // A final event may be terminated by stream end instead of a blank line.
    if !buffer.is_empty() {
        if let Some(event) = parse_sse_event(&buffer) {
            let _ = events_tx.send(event).await;
        }
    }
}

/// Parse a single SSE event block (the text between two blank lines).
///
/// Returns `None` for ping frames, comment-only blocks, and events with no
/// data.
fn parse_sse_event(event_block: &str) -> Option<SseEvent> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<&str> = None;

    for line in event_block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        }
        // `id:` and `retry:` are ignored; `:` lines are SSE comments.
    }

    if let Some(et) = event_type {
        if et.eq_ignore_ascii_case("ping") {
            return None;
        }
    }

    let data = data_lines.join("\n");
    if data.is_empty() || data.eq_ignore_ascii_case("[ping]") {
        return None;
    }

    Some(SseEvent {
        event: event_type.map(String::from),
        data,
    })
}

/// SSE client transport.
///
/// Created with [`SseTransport::connect`], which opens the GET stream
/// before returning. Outbound messages wait until the `endpoint` event has
/// been observed.
#[derive(Debug)]
pub struct SseTransport {
    /// Shared HTTP client (TLS policy applied by the caller).
    http: reqwest::Client,
    /// Static extra headers merged into every request.
    headers: HashMap<String, String>,
    /// Optional OAuth client-credentials token source.
    auth: Option<Arc<ClientCredentials>>,
    /// Companion POST endpoint, populated by the first `endpoint` event.
    endpoint: watch::Receiver<Option<Url>>,
    /// Inbound message channel fed by the SSE reader.
    inbound: Mutex<mpsc::Receiver<Message>>,
    /// Flipped on close; stops the reader and dispatcher tasks.
    cancel: CancellationToken,
}

impl SseTransport {
    /// Open the SSE stream and start the background reader.
    ///
    /// Performs the GET immediately (with one auth-refresh retry on `401`)
    /// so that connection errors surface synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::AuthFailure`] after a second `401`, or
    /// [`ProxyError::Transport`] for any other non-success status or
    /// connection failure.
    pub async fn connect(
        http: reqwest::Client,
        sse_url: Url,
        headers: HashMap<String, String>,
        auth: Option<Arc<ClientCredentials>>,
    ) -> Result<Self> {
        let response = open_stream(&http, &sse_url, &headers, auth.as_deref()).await?;

        let (endpoint_tx, endpoint_rx) = watch::channel::<Option<Url>>(None);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_CAPACITY);
        let (events_tx, mut events_rx) = mpsc::channel::<SseEvent>(INBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        // Reader: raw bytes -> parsed SSE events.
        let byte_stream = response.bytes_stream();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = reader_cancel.cancelled() => {}
                _ = parse_sse_stream(byte_stream, events_tx) => {}
            }
        });

        // Dispatcher: endpoint discovery and message delivery.
        let dispatch_cancel = cancel.clone();
        let base_url = sse_url.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = dispatch_cancel.cancelled() => break,
                    event = events_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                if event.event.as_deref() == Some(EVENT_ENDPOINT) {
                    match base_url.join(&event.data) {
                        Ok(url) => {
                            let _ = endpoint_tx.send(Some(url));
                        }
                        Err(e) => {
                            tracing::warn!("ignoring unparsable endpoint event `{}`: {e}", event.data);
                        }
                    }
                    continue;
                }

                let Some(message) = decode_inbound(&event.data) else {
                    continue;
                };
                tokio::select! {
                    _ = dispatch_cancel.cancelled() => break,
                    sent = inbound_tx.send(message) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self {
            http,
            headers,
            auth,
            endpoint: endpoint_rx,
            inbound: Mutex::new(inbound_rx),
            cancel,
        })
    }

    /// Wait until the server has announced the companion POST endpoint.
    async fn await_endpoint(&self) -> Result<Url> {
        let mut watcher = self.endpoint.clone();
        let wait = async {
            loop {
                if let Some(url) = watcher.borrow().clone() {
                    return Ok(url);
                }
                if watcher.changed().await.is_err() {
                    return Err(ProxyError::TransportClosed.into());
                }
            }
        };
        tokio::time::timeout(ENDPOINT_DISCOVERY_TIMEOUT, wait)
            .await
            .map_err(|_| {
                ProxyError::Transport("server never announced the SSE POST endpoint".to_string())
            })?
    }
}

/// GET the SSE URL with the configured headers, retrying once through an
/// auth refresh on `401`.
async fn open_stream(
    http: &reqwest::Client,
    sse_url: &Url,
    headers: &HashMap<String, String>,
    auth: Option<&ClientCredentials>,
) -> Result<reqwest::Response> {
    for attempt in 0..2 {
        let mut req = http
            .get(sse_url.clone())
            .header("Accept", "text/event-stream");
        for (k, v) in headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(auth) = auth {
            let token = if attempt == 0 { auth.bearer().await? } else { auth.refresh().await? };
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("SSE GET failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            if auth.is_some() && attempt == 0 {
                continue;
            }
            return Err(ProxyError::AuthFailure(format!("SSE GET returned HTTP {status}")).into());
        }
        if !status.is_success() {
            return Err(ProxyError::Transport(format!("SSE GET returned HTTP {status}")).into());
        }
        return Ok(response);
    }
    Err(ProxyError::AuthFailure("SSE GET rejected after token refresh".to_string()).into())
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    /// POST one message to the companion endpoint.
    async fn send(&self, message: Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProxyError::TransportClosed.into());
        }
        let endpoint = self.await_endpoint().await?;
        let body = message.encode();

        for attempt in 0..2 {
            let mut req = self
                .http
                .post(endpoint.clone())
                .header("Content-Type", "application/json")
                .body(body.clone());
            for (k, v) in &self.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(auth) = &self.auth {
                let token = if attempt == 0 { auth.bearer().await? } else { auth.refresh().await? };
                req = req.bearer_auth(token);
            }

            let response = req
                .send()
                .await
                .map_err(|e| ProxyError::Transport(format!("SSE POST failed: {e}")))?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                if self.auth.is_some() && attempt == 0 {
                    continue;
                }
                self.cancel.cancel();
                return Err(
                    ProxyError::AuthFailure(format!("SSE POST returned HTTP {status}")).into()
                );
            }
            if !status.is_success() {
                return Err(ProxyError::Transport(format!("SSE POST returned HTTP {status}")).into());
            }
            return Ok(());
        }
        Err(ProxyError::AuthFailure("SSE POST rejected after token refresh".to_string()).into())
    }

    async fn recv(&self) -> Option<Message> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}
