//! HTTP front-end integration tests
//!
//! These tests run the real axum front-end on an ephemeral port with the
//! `mcp_echo_server` helper binary as the child, then drive it with the
//! proxy's own SSE client transport (dogfooding both halves of the
//! bridge) and with plain `reqwest` calls for the error paths.
//!
//! The helper binary must be built before running these tests; the
//! harness locates it via the `CARGO_BIN_EXE_mcp_echo_server` environment
//! variable that Cargo injects automatically.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use url::Url;

use mcp_proxy::codec::{Message, MessageId};
use mcp_proxy::config::{NamedServerEntry, NamedServerRegistry};
use mcp_proxy::server::{serve, AppState};
use mcp_proxy::session::{PeerInfo, SessionEndpoint};
use mcp_proxy::transport::sse::SseTransport;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Path to the `mcp_echo_server` helper binary.
fn echo_server_exe() -> String {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_mcp_echo_server") {
        return path;
    }
    // Fallback for manual runs.
    "mcp_echo_server".to_string()
}

/// A named entry backed by the echo helper.
fn echo_entry(name: &str) -> NamedServerEntry {
    NamedServerEntry {
        name: name.to_string(),
        command: echo_server_exe(),
        args: Vec::new(),
        env: HashMap::new(),
        header_to_env: HashMap::new(),
        cwd: None,
    }
}

/// Start the front-end on an ephemeral port. Returns the bound address,
/// a state clone (for status assertions), and the shutdown token.
async fn start_proxy(
    entries: Vec<NamedServerEntry>,
    allow_origin: Vec<String>,
    stateless: bool,
) -> (SocketAddr, AppState, CancellationToken) {
    let registry =
        Arc::new(NamedServerRegistry::new(None, entries, false).expect("registry build failed"));
    let shutdown = CancellationToken::new();
    let state = AppState::new(registry, allow_origin, stateless, shutdown.clone());

    let (addr_tx, addr_rx) = tokio::sync::oneshot::channel();
    let serve_state = state.clone();
    tokio::spawn(async move {
        serve(serve_state, "127.0.0.1", 0, move |addr| {
            let _ = addr_tx.send(addr);
        })
        .await
        .expect("serve failed");
    });

    let addr = tokio::time::timeout(Duration::from_secs(5), addr_rx)
        .await
        .expect("server did not bind in time")
        .expect("bind address channel dropped");
    (addr, state, shutdown)
}

/// Open an SSE client session through the proxy and complete the MCP
/// handshake.
async fn open_client_session(
    addr: SocketAddr,
    path: &str,
    headers: HashMap<String, String>,
) -> (SessionEndpoint, PeerInfo) {
    let url = Url::parse(&format!("http://{addr}{path}")).expect("bad url");
    let transport = SseTransport::connect(reqwest::Client::new(), url, headers, None)
        .await
        .expect("SSE connect failed");

    let mut session = SessionEndpoint::new(Arc::new(transport));
    let peer = tokio::time::timeout(
        Duration::from_secs(10),
        session.initiate(json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "0.0.0"}
        })),
    )
    .await
    .expect("handshake timed out")
    .expect("handshake failed");
    (session, peer)
}

/// Extract the `data:` payloads of an SSE body.
fn sse_data_payloads(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: ").map(str::to_string))
        .collect()
}

// ---------------------------------------------------------------------------
// SSE ingress scenarios
// ---------------------------------------------------------------------------

/// Scenario: echo relay. A ping POSTed to the companion endpoint comes
/// back on the SSE stream with the same id and an empty result, and the
/// mirrored handshake identifies the proxy with the upstream's version.
#[tokio::test]
async fn test_sse_echo_relay() {
    let (addr, _state, shutdown) = start_proxy(vec![echo_entry("echo")], Vec::new(), false).await;

    let (mut session, peer) =
        open_client_session(addr, "/servers/echo/sse", HashMap::new()).await;
    assert_eq!(peer.implementation["name"], "mcp-proxy");
    assert_eq!(peer.implementation["version"], "0.1.0");
    assert_eq!(peer.capabilities["tools"], json!({}));

    session
        .send(Message::request(MessageId::Number(1), "ping", json!({})))
        .await
        .expect("send failed");

    let response = tokio::time::timeout(Duration::from_secs(10), session.recv())
        .await
        .expect("timed out waiting for response")
        .expect("stream ended unexpectedly");
    assert_eq!(response.id(), Some(&MessageId::Number(1)));
    assert_eq!(response.to_value()["result"], json!({}));

    session.close().await;
    shutdown.cancel();
}

/// Scenario: unknown name. No child is spawned and the GET answers 404.
#[tokio::test]
async fn test_unknown_name_is_404() {
    let (addr, state, shutdown) = start_proxy(vec![echo_entry("echo")], Vec::new(), false).await;

    let response = reqwest::get(format!("http://{addr}/servers/does-not-exist/sse"))
        .await
        .expect("request failed");
    assert_eq!(response.status(), 404);
    assert_eq!(state.status.total_live(), 0, "no session may have started");

    shutdown.cancel();
}

/// Scenario: disabled entry. A config-file entry with `enabled: false`
/// is dropped and 404s.
#[tokio::test]
async fn test_disabled_entry_is_404() {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().expect("tempfile");
    file.write_all(br#"{"mcpServers": {"x": {"command": "true", "enabled": false}}}"#)
        .expect("write config");

    let entries = NamedServerRegistry::load_config_file(file.path()).expect("load failed");
    let (addr, _state, shutdown) = start_proxy(entries, Vec::new(), false).await;

    let response = reqwest::get(format!("http://{addr}/servers/x/sse"))
        .await
        .expect("request failed");
    assert_eq!(response.status(), 404);

    shutdown.cancel();
}

/// Scenario: header-to-env injection. `X-Token: abc` with a
/// `X-Token -> TOK` mapping materializes as `TOK=abc` in the child.
#[tokio::test]
async fn test_header_to_env_injection() {
    let mut entry = echo_entry("e");
    entry
        .header_to_env
        .insert("X-Token".to_string(), "TOK".to_string());
    let (addr, _state, shutdown) = start_proxy(vec![entry], Vec::new(), false).await;

    let mut headers = HashMap::new();
    headers.insert("X-Token".to_string(), "abc".to_string());
    let (mut session, _peer) = open_client_session(addr, "/servers/e/sse", headers).await;

    session
        .send(Message::request(
            MessageId::Number(1),
            "test/env",
            json!({"name": "TOK"}),
        ))
        .await
        .expect("send failed");

    let response = tokio::time::timeout(Duration::from_secs(10), session.recv())
        .await
        .expect("timed out")
        .expect("stream ended");
    assert_eq!(response.to_value()["result"]["value"], json!("abc"));

    session.close().await;
    shutdown.cancel();
}

/// Absent header: the variable is absent in the child.
#[tokio::test]
async fn test_absent_header_leaves_env_absent() {
    let mut entry = echo_entry("e");
    entry
        .header_to_env
        .insert("X-Token".to_string(), "TOK".to_string());
    let (addr, _state, shutdown) = start_proxy(vec![entry], Vec::new(), false).await;

    let (mut session, _peer) = open_client_session(addr, "/servers/e/sse", HashMap::new()).await;
    session
        .send(Message::request(
            MessageId::Number(1),
            "test/env",
            json!({"name": "TOK"}),
        ))
        .await
        .expect("send failed");

    let response = tokio::time::timeout(Duration::from_secs(10), session.recv())
        .await
        .expect("timed out")
        .expect("stream ended");
    assert_eq!(response.to_value()["result"]["value"], json!(null));

    session.close().await;
    shutdown.cancel();
}

/// Scenario: crash propagation. When the child exits mid-session the
/// ingress stream closes within the drain deadline and the live-session
/// count returns to zero.
#[tokio::test]
async fn test_child_crash_closes_ingress_and_clears_status() {
    let (addr, state, shutdown) =
        start_proxy(vec![echo_entry("crash")], Vec::new(), false).await;

    let (mut session, _peer) =
        open_client_session(addr, "/servers/crash/sse", HashMap::new()).await;
    assert_eq!(
        state.status.snapshot()["servers"]["crash"]["live_sessions"],
        1
    );

    // The child exits with code 1 without answering.
    session
        .send(Message::request(MessageId::Number(9), "test/crash", json!({})))
        .await
        .expect("send failed");

    let end = tokio::time::timeout(Duration::from_secs(4), session.recv())
        .await
        .expect("ingress stream did not close after the child crashed");
    assert!(end.is_none(), "expected end-of-stream, got {end:?}");

    // The status counter drains once the bridge task finishes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    loop {
        if state.status.snapshot()["servers"]["crash"]["live_sessions"] == json!(0) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "live_sessions never returned to 0"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();
}

/// Scenario: CORS deny. A disallowed Origin is rejected with 403 before
/// any spawn; an allowed one proceeds.
#[tokio::test]
async fn test_cors_deny_and_allow() {
    let (addr, state, shutdown) = start_proxy(
        vec![echo_entry("echo")],
        vec!["https://ok.example".to_string()],
        false,
    )
    .await;
    let client = reqwest::Client::new();

    let denied = client
        .get(format!("http://{addr}/servers/echo/sse"))
        .header("Origin", "https://evil.example")
        .send()
        .await
        .expect("request failed");
    assert_eq!(denied.status(), 403);
    assert_eq!(state.status.total_live(), 0, "denied request must not spawn");

    let allowed = client
        .get(format!("http://{addr}/servers/echo/sse"))
        .header("Origin", "https://ok.example")
        .send()
        .await
        .expect("request failed");
    assert_eq!(allowed.status(), 200);

    shutdown.cancel();
}

/// Malformed POST bodies answer 400; unknown sessions answer 404.
#[tokio::test]
async fn test_messages_endpoint_error_paths() {
    let (addr, _state, shutdown) = start_proxy(vec![echo_entry("echo")], Vec::new(), false).await;
    let client = reqwest::Client::new();

    let missing = client
        .post(format!(
            "http://{addr}/messages/?session_id=00000000-0000-0000-0000-000000000000"
        ))
        .body(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
        .send()
        .await
        .expect("request failed");
    assert_eq!(missing.status(), 404);

    let malformed = client
        .post(format!(
            "http://{addr}/messages/?session_id=00000000-0000-0000-0000-000000000000"
        ))
        .body("{not json")
        .send()
        .await
        .expect("request failed");
    assert_eq!(malformed.status(), 400);

    shutdown.cancel();
}

/// `/status` reports every configured entry with `running: true` and a
/// stable entry set across concurrent requests.
#[tokio::test]
async fn test_status_endpoint_shape() {
    let (addr, _state, shutdown) = start_proxy(
        vec![echo_entry("alpha"), echo_entry("beta")],
        Vec::new(),
        false,
    )
    .await;

    let (first, second) = tokio::join!(
        reqwest::get(format!("http://{addr}/status")),
        reqwest::get(format!("http://{addr}/status")),
    );
    let first: serde_json::Value = first.expect("request failed").json().await.expect("json");
    let second: serde_json::Value = second.expect("request failed").json().await.expect("json");

    for body in [&first, &second] {
        assert_eq!(body["servers"]["alpha"]["running"], true);
        assert_eq!(body["servers"]["beta"]["running"], true);
        assert_eq!(body["servers"]["alpha"]["live_sessions"], 0);
        assert!(body["uptime_s"].is_u64());
    }
    assert_eq!(
        first["servers"].as_object().map(|s| s.len()),
        second["servers"].as_object().map(|s| s.len())
    );

    shutdown.cancel();
}

// ---------------------------------------------------------------------------
// Streamable HTTP ingress scenarios
// ---------------------------------------------------------------------------

/// Stateful flow: initialize opens a session (id header returned, result
/// mirrored), initialized is acknowledged, a request round-trips, DELETE
/// tears down.
#[tokio::test]
async fn test_streamable_stateful_session_flow() {
    let (addr, _state, shutdown) = start_proxy(vec![echo_entry("echo")], Vec::new(), false).await;
    let client = reqwest::Client::new();
    let endpoint = format!("http://{addr}/servers/echo/mcp");

    // 1. initialize (no session header yet).
    let response = client
        .post(&endpoint)
        .body(
            json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "0.0.0"}
                }
            })
            .to_string(),
        )
        .send()
        .await
        .expect("initialize POST failed");
    assert_eq!(response.status(), 200);
    let session_id = response
        .headers()
        .get("Mcp-Session-Id")
        .and_then(|v| v.to_str().ok())
        .expect("missing session id header")
        .to_string();

    let body = tokio::time::timeout(Duration::from_secs(10), response.text())
        .await
        .expect("initialize stream did not finish")
        .expect("body read failed");
    let payloads = sse_data_payloads(&body);
    assert_eq!(payloads.len(), 1, "expected exactly the initialize result: {body}");
    let init_result: serde_json::Value = serde_json::from_str(&payloads[0]).expect("json");
    assert_eq!(init_result["result"]["serverInfo"]["name"], "mcp-proxy");

    // 2. initialized notification -> 202.
    let ack = client
        .post(&endpoint)
        .header("Mcp-Session-Id", &session_id)
        .body(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string())
        .send()
        .await
        .expect("initialized POST failed");
    assert_eq!(ack.status(), 202);

    // 3. ping round-trips through the live session.
    let response = client
        .post(&endpoint)
        .header("Mcp-Session-Id", &session_id)
        .body(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}).to_string())
        .send()
        .await
        .expect("ping POST failed");
    assert_eq!(response.status(), 200);
    let body = tokio::time::timeout(Duration::from_secs(10), response.text())
        .await
        .expect("ping stream did not finish")
        .expect("body read failed");
    let payloads = sse_data_payloads(&body);
    let ping_result: serde_json::Value =
        serde_json::from_str(payloads.last().expect("no payloads")).expect("json");
    assert_eq!(ping_result["id"], 2);
    assert_eq!(ping_result["result"], json!({}));

    // 4. DELETE terminates; the session id stops resolving.
    let deleted = client
        .delete(&endpoint)
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await
        .expect("DELETE failed");
    assert_eq!(deleted.status(), 200);

    let gone = client
        .post(&endpoint)
        .header("Mcp-Session-Id", &session_id)
        .body(json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}).to_string())
        .send()
        .await
        .expect("post-delete POST failed");
    assert_eq!(gone.status(), 404);

    shutdown.cancel();
}

/// A non-initialize first POST without a session header is rejected.
#[tokio::test]
async fn test_streamable_stateful_requires_initialize_first() {
    let (addr, _state, shutdown) = start_proxy(vec![echo_entry("echo")], Vec::new(), false).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/servers/echo/mcp"))
        .body(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}).to_string())
        .send()
        .await
        .expect("POST failed");
    assert_eq!(response.status(), 400);

    shutdown.cancel();
}

/// Stateless flow: initialize answers a single JSON envelope; a request
/// gets a one-shot bridge and still round-trips.
#[tokio::test]
async fn test_streamable_stateless_exchanges() {
    let (addr, _state, shutdown) = start_proxy(vec![echo_entry("echo")], Vec::new(), true).await;
    let client = reqwest::Client::new();
    let endpoint = format!("http://{addr}/servers/echo/mcp");

    let response = client
        .post(&endpoint)
        .body(
            json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "0.0.0"}
                }
            })
            .to_string(),
        )
        .send()
        .await
        .expect("initialize POST failed");
    assert_eq!(response.status(), 200);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .contains("application/json"));
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["result"]["serverInfo"]["name"], "mcp-proxy");

    let response = client
        .post(&endpoint)
        .body(json!({"jsonrpc": "2.0", "id": 5, "method": "ping"}).to_string())
        .send()
        .await
        .expect("ping POST failed");
    assert_eq!(response.status(), 200);
    let body = tokio::time::timeout(Duration::from_secs(10), response.text())
        .await
        .expect("stream did not finish")
        .expect("body read failed");
    let payloads = sse_data_payloads(&body);
    let result: serde_json::Value =
        serde_json::from_str(payloads.last().expect("no payloads")).expect("json");
    assert_eq!(result["id"], 5);

    shutdown.cancel();
}
