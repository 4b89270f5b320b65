//! Echo MCP server binary for integration tests
//!
//! A minimal stdio MCP server used to exercise the proxy end-to-end
//! without any external dependency. It speaks newline-delimited JSON on
//! stdin/stdout.
//!
//! # Handled methods
//!
//! - `initialize` -- answers with protocol version `2025-03-26`, a
//!   `tools` capability, and `serverInfo {"mcp-echo-server", "0.1.0"}`.
//! - `notifications/initialized` -- swallowed silently.
//! - `ping` -- answers `{}`.
//! - `test/env` -- answers `{"value": <env var named by params.name>}`
//!   (or `null` when unset); used to observe header-to-env injection
//!   through the relay.
//! - `test/crash` -- exits the process with code 1 without answering;
//!   used to test crash propagation.
//! - anything else -- JSON-RPC `-32601 Method not found`.

use std::io::{self, BufRead, Write};

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {"code": -32700, "message": "Parse error"}
                });
                let _ = writeln!(out, "{}", response);
                let _ = out.flush();
                continue;
            }
        };

        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");
        let id = request.get("id").cloned().unwrap_or(serde_json::Value::Null);

        // Notifications get no reply.
        if id.is_null() {
            continue;
        }

        let response = match method {
            "initialize" => handle_initialize(&id),
            "ping" => serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}}),
            "test/env" => handle_env(&id, &request),
            "test/crash" => std::process::exit(1),
            _ => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("Method not found: {}", method)}
            }),
        };

        if writeln!(out, "{}", response).is_err() {
            break;
        }
        if out.flush().is_err() {
            break;
        }
    }
}

/// A valid `initialize` result advertising the `tools` capability.
fn handle_initialize(id: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": "2025-03-26",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mcp-echo-server", "version": "0.1.0"}
        }
    })
}

/// Report the value of the environment variable named in `params.name`.
fn handle_env(id: &serde_json::Value, request: &serde_json::Value) -> serde_json::Value {
    let name = request
        .get("params")
        .and_then(|p| p.get("name"))
        .and_then(|n| n.as_str())
        .unwrap_or("");
    let value = std::env::var(name).ok();
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {"value": value}
    })
}
