//! Error types for the MCP proxy
//!
//! This module defines all error types used throughout the application,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for proxy operations
///
/// This enum encompasses all possible errors that can occur during
/// configuration loading, transport I/O, session handshakes, and
/// bridge execution.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration-related errors (startup-fatal, exit code 2)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A message that could not be parsed as a JSON-RPC envelope
    #[error("Malformed MCP message: {0}")]
    MalformedMessage(String),

    /// Transport-level I/O failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation attempted on a transport that has already been closed
    #[error("Transport closed")]
    TransportClosed,

    /// A child MCP server could not be spawned
    #[error("Failed to spawn MCP server `{command}`: {source}")]
    SpawnFailed {
        /// The executable that failed to start
        command: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// OAuth token acquisition failed, or the peer rejected our
    /// credentials after a refresh retry
    #[error("Authentication failure: {0}")]
    AuthFailure(String),

    /// The MCP initialization handshake did not complete in time
    #[error("Handshake did not complete within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// Too many non-handshake messages arrived before the session
    /// became ready
    #[error("Handshake overflow: more than {0} messages held before the session became ready")]
    HandshakeOverflow(usize),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for proxy operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Returns `true` when `error` is (or wraps) a [`ProxyError::Config`].
///
/// Used by `main` to select the exit code: configuration errors exit with
/// code 2, all other runtime errors with code 1.
pub fn is_config_error(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<ProxyError>(), Some(ProxyError::Config(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = ProxyError::Config("missing command".to_string());
        assert_eq!(error.to_string(), "Configuration error: missing command");
    }

    #[test]
    fn test_malformed_message_error_display() {
        let error = ProxyError::MalformedMessage("not a JSON object".to_string());
        assert_eq!(error.to_string(), "Malformed MCP message: not a JSON object");
    }

    #[test]
    fn test_spawn_failed_error_display() {
        let error = ProxyError::SpawnFailed {
            command: "/does/not/exist".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        let msg = error.to_string();
        assert!(msg.contains("/does/not/exist"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_handshake_overflow_error_display() {
        let error = ProxyError::HandshakeOverflow(64);
        assert!(error.to_string().contains("64"));
    }

    #[test]
    fn test_handshake_timeout_error_display() {
        let error = ProxyError::HandshakeTimeout(std::time::Duration::from_secs(30));
        assert!(error.to_string().contains("30"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let error: ProxyError = io_error.into();
        assert!(matches!(error, ProxyError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{oops}").unwrap_err();
        let error: ProxyError = json_error.into();
        assert!(matches!(error, ProxyError::Serialization(_)));
    }

    #[test]
    fn test_is_config_error_detects_wrapped_config_errors() {
        let error: anyhow::Error = ProxyError::Config("bad flag".to_string()).into();
        assert!(is_config_error(&error));

        let other: anyhow::Error = ProxyError::TransportClosed.into();
        assert!(!is_config_error(&other));

        let plain = anyhow::anyhow!("something else");
        assert!(!is_config_error(&plain));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProxyError>();
    }
}
