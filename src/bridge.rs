//! The bridge engine: couples two session endpoints
//!
//! A [`Bridge`] owns a *downstream* session (the ingress peer, responder
//! role) and an *upstream* session (the side being proxied to, initiator
//! role). Running it performs handshake mirroring and then relays every
//! message between the two until either side disconnects.
//!
//! # Handshake mirroring
//!
//! The `initialize` / `initialized` traffic is not forwarded verbatim.
//! Instead:
//!
//! 1. The downstream client's `initialize` request is captured.
//! 2. Its params (protocol version, capabilities, client identity,
//!    unknown fields included) are replayed upstream as the proxy's own
//!    `initialize`.
//! 3. The upstream's result is mirrored back downstream with `serverInfo`
//!    rewritten to identify the proxy while carrying the upstream's
//!    version. Capabilities pass through unchanged: the proxy can
//!    transparently forward every non-transport capability, so the
//!    intersection is the identity.
//! 4. The downstream `initialized` notification completes the mirror.
//!
//! # Relay loop
//!
//! Two forwarder tasks run concurrently, one per direction, each
//! preserving FIFO order. There is no buffering beyond the single
//! in-flight message a transport holds, so a slow sink stops the source
//! being read. IDs are never rewritten; correlation is implicit.
//!
//! # Lifetime coupling
//!
//! End-of-stream or a fatal send error on either side cancels the shared
//! token; the bridge then closes both transports, waits up to
//! [`BRIDGE_DRAIN_DEADLINE`] for the forwarders to wind down, and
//! returns. In-flight requests whose response never arrives are dropped;
//! the originator observes its own transport closing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::session::{PeerInfo, SessionEndpoint, SessionReader};
use crate::transport::Transport;

/// How long the forwarders get to drain after the first close.
pub const BRIDGE_DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// The name the proxy advertises in mirrored `serverInfo`.
pub const PROXY_SERVER_NAME: &str = "mcp-proxy";

/// Build the mirrored `initialize` result presented downstream.
///
/// Starts from the upstream's raw result so unknown fields survive, then
/// rewrites `serverInfo` to the proxy's name with the upstream's version.
pub fn mirrored_initialize_result(upstream: &PeerInfo) -> Value {
    let upstream_version = upstream
        .implementation
        .get("version")
        .and_then(|v| v.as_str())
        .unwrap_or(env!("CARGO_PKG_VERSION"));

    let mut result = upstream.raw.clone();
    if !result.is_object() {
        result = json!({});
    }
    result["serverInfo"] = json!({
        "name": PROXY_SERVER_NAME,
        "version": upstream_version,
    });
    result
}

/// A pair of session endpoints plus the cancellation token that bounds
/// their shared lifetime.
#[derive(Debug)]
pub struct Bridge {
    downstream: SessionEndpoint,
    upstream: SessionEndpoint,
    cancel: CancellationToken,
}

impl Bridge {
    /// Wire a bridge over two transports. The token is a child of
    /// `parent`, so a global shutdown cancels every live bridge.
    pub fn new(
        downstream: Arc<dyn Transport>,
        upstream: Arc<dyn Transport>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            downstream: SessionEndpoint::new(downstream),
            upstream: SessionEndpoint::new(upstream),
            cancel: parent.child_token(),
        }
    }

    /// Run the bridge to completion: mirror the handshake, relay until
    /// either side goes away, then close both sides.
    ///
    /// # Errors
    ///
    /// Handshake failures (timeout, overflow, peer rejection, early
    /// disconnect) are returned after both transports have been closed.
    /// A relay-phase disconnect is normal termination and returns `Ok`.
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = self.handshake().await {
            self.downstream.close().await;
            self.upstream.close().await;
            return Err(e);
        }
        self.relay().await;
        Ok(())
    }

    /// Handshake mirroring, downstream-first (see module docs).
    async fn handshake(&mut self) -> Result<()> {
        let init = self.downstream.await_initialize().await?;
        tracing::debug!(
            client = %init.params.get("clientInfo").map(|c| c.to_string()).unwrap_or_default(),
            "mirroring initialize upstream"
        );

        let upstream_peer = self.upstream.initiate(init.params.clone()).await?;
        let result = mirrored_initialize_result(&upstream_peer);

        self.downstream.send_initialize_result(init.id, result).await?;
        self.downstream.await_initialized().await?;

        tracing::debug!(
            upstream = %upstream_peer.implementation,
            protocol = %upstream_peer.protocol_version,
            "bridge ready"
        );
        Ok(())
    }

    /// The relay loop: two forwarders, one token, bounded drain.
    async fn relay(self) {
        let Bridge { downstream, upstream, cancel } = self;
        let (down_reader, down_transport) = downstream.into_parts();
        let (up_reader, up_transport) = upstream.into_parts();

        let ingress = tokio::spawn(forward(
            down_reader,
            Arc::clone(&up_transport),
            cancel.clone(),
            "ingress->upstream",
        ));
        let egress = tokio::spawn(forward(
            up_reader,
            Arc::clone(&down_transport),
            cancel.clone(),
            "upstream->ingress",
        ));

        // First end-of-stream (or global shutdown) flips the token.
        cancel.cancelled().await;

        // Close both sides immediately so blocked forwarders unwind, then
        // give them the drain deadline.
        down_transport.close().await;
        up_transport.close().await;

        let drained = tokio::time::timeout(BRIDGE_DRAIN_DEADLINE, async {
            let _ = ingress.await;
            let _ = egress.await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!("bridge forwarders did not drain within {BRIDGE_DRAIN_DEADLINE:?}");
        }
    }
}

/// Forward messages from `source` to `sink` until end-of-stream, a send
/// failure, or cancellation. Flips the token on exit so the sibling
/// forwarder unwinds too.
async fn forward(
    mut source: SessionReader,
    sink: Arc<dyn Transport>,
    cancel: CancellationToken,
    direction: &'static str,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = source.recv() => match message {
                Some(message) => message,
                None => {
                    tracing::debug!(direction, "end of stream");
                    break;
                }
            },
        };
        if let Err(e) = sink.send(message).await {
            tracing::debug!(direction, "forwarding stopped: {e}");
            break;
        }
    }
    cancel.cancel();
}
