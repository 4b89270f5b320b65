//! mcp-proxy - bidirectional MCP transport bridge library
//!
//! This library implements a session-bridging engine for the Model
//! Context Protocol: for every logical peering it opens two transport
//! endpoints, runs the MCP handshake on each, and relays every message
//! between them while preserving correlation, ordering, and lifecycle.
//!
//! # Architecture
//!
//! - `codec`: JSON-RPC envelope classification with lossless round-trips
//! - `transport`: the `Transport` trait and its stdio, SSE, and
//!   Streamable HTTP implementations (plus the child supervisor)
//! - `session`: the MCP initialization handshake over a transport
//! - `bridge`: the relay engine coupling two sessions
//! - `server`: the axum HTTP front-end (SSE + Streamable HTTP ingress,
//!   status endpoint)
//! - `config`: the named-server registry and spawn descriptors
//! - `auth`: outbound bearer/OAuth2 handling and TLS policy
//! - `cli`: command-line surface
//! - `error`: error types and result alias

pub mod auth;
pub mod bridge;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod server;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use bridge::Bridge;
pub use cli::Cli;
pub use codec::{Message, MessageId};
pub use config::{NamedServerEntry, NamedServerRegistry, SpawnDescriptor};
pub use error::{ProxyError, Result};
pub use session::SessionEndpoint;
pub use transport::Transport;
