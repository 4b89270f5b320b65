//! MCP session endpoints: a transport plus handshake state
//!
//! A [`SessionEndpoint`] wraps a [`Transport`] and drives the MCP
//! initialization handshake in one of two roles:
//!
//! - **Initiator** (we act as the MCP client toward the peer):
//!   [`SessionEndpoint::initiate`] sends `initialize`, awaits the matching
//!   response, records the peer's identity, and fires the
//!   `notifications/initialized` notification.
//! - **Responder** (we act as the MCP server toward the peer): the
//!   split-phase API [`SessionEndpoint::await_initialize`] /
//!   [`SessionEndpoint::send_initialize_result`] /
//!   [`SessionEndpoint::await_initialized`] lets the bridge learn the
//!   client's identity, initialize its own upstream, and only then answer.
//!
//! Non-handshake messages that arrive before the session is ready are held
//! in an in-order queue (bound [`HANDSHAKE_QUEUE_LIMIT`]) and delivered
//! after readiness; overflowing the queue or exceeding
//! [`HANDSHAKE_TIMEOUT`] closes the session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::codec::{Message, MessageId, METHOD_INITIALIZE, METHOD_INITIALIZED};
use crate::error::{ProxyError, Result};
use crate::transport::Transport;

/// Upper bound on the whole handshake, either role.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of early messages held while the handshake runs.
pub const HANDSHAKE_QUEUE_LIMIT: usize = 64;

/// Protocol revision offered when the proxy fabricates its own handshake
/// (stateless mode); everywhere else the downstream client's requested
/// revision is forwarded untouched.
pub const FALLBACK_PROTOCOL_VERSION: &str = "2025-03-26";

/// Request id reserved for the proxy's own upstream `initialize`. It never
/// collides with relayed traffic because the upstream handshake completes
/// before any client message is forwarded.
const INITIALIZE_REQUEST_ID: i64 = 0;

/// What the counterpart declared during initialization.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The negotiated protocol revision.
    pub protocol_version: String,
    /// The peer's capability object, verbatim.
    pub capabilities: Value,
    /// The peer's `serverInfo` (initiator role) or `clientInfo`
    /// (responder role), verbatim.
    pub implementation: Value,
    /// The complete raw `initialize` result (initiator role) or params
    /// (responder role); kept so mirroring preserves unknown fields.
    pub raw: Value,
}

impl PeerInfo {
    fn from_object(raw: Value, implementation_key: &str) -> Self {
        let protocol_version = raw
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or(FALLBACK_PROTOCOL_VERSION)
            .to_string();
        let capabilities = raw.get("capabilities").cloned().unwrap_or_else(|| json!({}));
        let implementation = raw
            .get(implementation_key)
            .cloned()
            .unwrap_or_else(|| json!({}));
        Self {
            protocol_version,
            capabilities,
            implementation,
            raw,
        }
    }
}

/// The client half of an incoming `initialize` request, captured by the
/// responder role.
#[derive(Debug, Clone)]
pub struct InitializeRequest {
    /// The request id to answer with.
    pub id: MessageId,
    /// The request params, verbatim (forwarded upstream untouched).
    pub params: Value,
}

/// Initialize params the proxy presents when no downstream client identity
/// is available (fabricated handshakes in stateless mode).
pub fn proxy_initialize_params() -> Value {
    json!({
        "protocolVersion": FALLBACK_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "mcp-proxy",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// A transport wrapped with MCP handshake state.
#[derive(Debug)]
pub struct SessionEndpoint {
    transport: Arc<dyn Transport>,
    /// Early non-handshake messages, delivered in order after readiness.
    pending: VecDeque<Message>,
    /// The counterpart's declared identity, set during the handshake.
    peer: Option<PeerInfo>,
}

impl SessionEndpoint {
    /// Wrap a transport; the session starts unconfigured.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: VecDeque::new(),
            peer: None,
        }
    }

    /// The counterpart's identity, available once the handshake has
    /// progressed far enough to learn it.
    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    /// Run the initiator-role handshake with the given `initialize`
    /// params and return the peer's identity.
    ///
    /// # Errors
    ///
    /// [`ProxyError::HandshakeTimeout`] after [`HANDSHAKE_TIMEOUT`],
    /// [`ProxyError::HandshakeOverflow`] if too many early messages
    /// arrive, [`ProxyError::TransportClosed`] if the peer disconnects
    /// mid-handshake, or [`ProxyError::Transport`] when the peer answers
    /// `initialize` with an error. The session is closed on every failure
    /// path.
    pub async fn initiate(&mut self, params: Value) -> Result<PeerInfo> {
        let transport = Arc::clone(&self.transport);
        let outcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.initiate_inner(params)).await;
        finish_phase(transport, outcome).await
    }

    async fn initiate_inner(&mut self, params: Value) -> Result<PeerInfo> {
        let request = Message::request(
            MessageId::Number(INITIALIZE_REQUEST_ID),
            METHOD_INITIALIZE,
            params,
        );
        self.transport.send(request).await?;

        let result = loop {
            let message = self
                .transport
                .recv()
                .await
                .ok_or(ProxyError::TransportClosed)?;
            match message {
                Message::Response { ref id, ref payload }
                    if *id == MessageId::Number(INITIALIZE_REQUEST_ID) =>
                {
                    if let Some(error) = payload.get("error") {
                        return Err(ProxyError::Transport(format!(
                            "peer rejected initialize: {error}"
                        ))
                        .into());
                    }
                    break payload.get("result").cloned().unwrap_or_else(|| json!({}));
                }
                other => hold(&mut self.pending, other)?,
            }
        };

        let peer = PeerInfo::from_object(result, "serverInfo");
        self.peer = Some(peer.clone());
        self.transport
            .send(Message::notification(METHOD_INITIALIZED, None))
            .await?;
        Ok(peer)
    }

    /// Responder role, phase 1: wait for the client's `initialize` request
    /// and record its identity.
    pub async fn await_initialize(&mut self) -> Result<InitializeRequest> {
        let transport = Arc::clone(&self.transport);
        let outcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.await_initialize_inner()).await;
        finish_phase(transport, outcome).await
    }

    async fn await_initialize_inner(&mut self) -> Result<InitializeRequest> {
        loop {
            let message = self
                .transport
                .recv()
                .await
                .ok_or(ProxyError::TransportClosed)?;
            match message {
                Message::Request { ref id, ref method, ref payload }
                    if method == METHOD_INITIALIZE =>
                {
                    let params = payload.get("params").cloned().unwrap_or_else(|| json!({}));
                    self.peer = Some(PeerInfo::from_object(params.clone(), "clientInfo"));
                    return Ok(InitializeRequest { id: id.clone(), params });
                }
                other => hold(&mut self.pending, other)?,
            }
        }
    }

    /// Responder role, phase 2: answer the `initialize` request.
    pub async fn send_initialize_result(&self, id: MessageId, result: Value) -> Result<()> {
        self.transport.send(Message::response(id, result)).await
    }

    /// Responder role, phase 3: wait for `notifications/initialized`.
    pub async fn await_initialized(&mut self) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        let outcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.await_initialized_inner()).await;
        finish_phase(transport, outcome).await
    }

    async fn await_initialized_inner(&mut self) -> Result<()> {
        loop {
            let message = self
                .transport
                .recv()
                .await
                .ok_or(ProxyError::TransportClosed)?;
            if message.is_initialized_notification() {
                return Ok(());
            }
            hold(&mut self.pending, message)?;
        }
    }

    /// Send a message on the session's transport.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.transport.send(message).await
    }

    /// Receive the next message, draining held early messages first.
    pub async fn recv(&mut self) -> Option<Message> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        self.transport.recv().await
    }

    /// Close the underlying transport.
    pub async fn close(&self) {
        self.transport.close().await;
    }

    /// Split into a reader (held queue + transport) and the shared
    /// transport handle, for the bridge's two forwarder tasks.
    pub fn into_parts(self) -> (SessionReader, Arc<dyn Transport>) {
        let transport = Arc::clone(&self.transport);
        (
            SessionReader {
                pending: self.pending,
                transport: self.transport,
            },
            transport,
        )
    }

}

/// Resolve a deadline-wrapped handshake phase, closing the transport on
/// failure or timeout.
async fn finish_phase<T>(
    transport: Arc<dyn Transport>,
    outcome: std::result::Result<Result<T>, tokio::time::error::Elapsed>,
) -> Result<T> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            transport.close().await;
            Err(e)
        }
        Err(_) => {
            transport.close().await;
            Err(ProxyError::HandshakeTimeout(HANDSHAKE_TIMEOUT).into())
        }
    }
}

/// Queue an early message, enforcing the handshake queue bound.
fn hold(pending: &mut VecDeque<Message>, message: Message) -> Result<()> {
    if pending.len() >= HANDSHAKE_QUEUE_LIMIT {
        return Err(ProxyError::HandshakeOverflow(HANDSHAKE_QUEUE_LIMIT).into());
    }
    pending.push_back(message);
    Ok(())
}

/// The receive half of a ready session: drains held messages, then the
/// transport.
#[derive(Debug)]
pub struct SessionReader {
    pending: VecDeque<Message>,
    transport: Arc<dyn Transport>,
}

impl SessionReader {
    /// Next message in arrival order; `None` on end-of-stream.
    pub async fn recv(&mut self) -> Option<Message> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        self.transport.recv().await
    }
}
