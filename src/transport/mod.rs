//! MCP transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that all MCP transport
//! implementations must satisfy. Concrete implementations live in
//! submodules:
//!
//! - [`stdio::StdioTransport`] -- spawns a child process and communicates
//!   over its stdin/stdout pipes (newline-delimited JSON).
//! - [`stdio::ParentStdioTransport`] -- the proxy's own stdin/stdout,
//!   used when a parent MCP client launched the proxy itself.
//! - [`sse::SseTransport`] -- SSE client transport (GET event stream plus
//!   a companion POST endpoint).
//! - [`streamable::StreamableHttpTransport`] -- Streamable HTTP client
//!   transport (single endpoint, POST per message).
//! - [`fake::FakeTransport`] -- in-process pair used in tests (cfg(test)
//!   only).
//!
//! # Design
//!
//! The [`Transport`] trait is intentionally minimal: `send` one decoded
//! [`Message`], `recv` the next inbound [`Message`] (or end-of-stream), and
//! `close`. Framing, session headers, and authentication are the
//! responsibility of each concrete implementation.
//!
//! Inbound delivery is a bounded channel of capacity 1: a sink that stops
//! accepting messages stops the source being read, which propagates
//! backpressure to the originating peer. Each transport supports at most
//! one concurrent sender and one concurrent receiver.
//!
//! Malformed inbound frames are logged at WARN and dropped inside the
//! transport; the stream continues.

use std::fmt;

use crate::codec::Message;
use crate::error::Result;

/// Inbound channel capacity. One in-flight message per direction is the
/// whole buffering budget of a bridge.
pub(crate) const INBOUND_CAPACITY: usize = 1;

/// Abstraction over MCP transport implementations.
///
/// All methods are `async` so that implementations can drive I/O without
/// blocking the Tokio executor. Implementations are used polymorphically
/// through `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Send a message to the remote peer.
    ///
    /// The transport applies whatever framing the medium requires (newline
    /// for stdio, HTTP POST for the web transports). The call completes
    /// when the message has been handed to the OS or the HTTP request has
    /// been accepted, not when the peer has processed it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ProxyError::TransportClosed`] after `close`,
    /// or a transport-level error if the underlying I/O fails.
    async fn send(&self, message: Message) -> Result<()>;

    /// Receive the next inbound message.
    ///
    /// Returns `None` on end-of-stream: the peer disconnected, the child
    /// exited, or `close` was called. Once `None` is returned no further
    /// `send` will succeed.
    async fn recv(&self) -> Option<Message>;

    /// Close the transport.
    ///
    /// Idempotent. Unblocks any pending `recv` with end-of-stream and
    /// releases the underlying resources (for the stdio transport this
    /// terminates and reaps the child process).
    async fn close(&self);
}

/// Decode one inbound frame, dropping malformed input with a warning.
///
/// Per-message parse failures must not take the session down; the offending
/// frame is logged and skipped.
pub(crate) fn decode_inbound(raw: &str) -> Option<Message> {
    if raw.trim().is_empty() {
        return None;
    }
    match Message::decode(raw) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!("dropping malformed inbound message: {e}");
            None
        }
    }
}

pub mod sse;
pub mod stdio;
pub mod streamable;

#[cfg(test)]
pub mod fake;
