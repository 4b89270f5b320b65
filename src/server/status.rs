//! Liveness reporting for the HTTP front-end
//!
//! `GET /status` returns global uptime and, per configured server, whether
//! the entry is enabled and how many bridges currently reference it. The
//! counter set is fixed at startup (the registry is immutable), so updates
//! are single atomic increments with no locking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::server::AppState;

/// Per-server live-session counters plus process uptime.
#[derive(Debug)]
pub struct StatusBoard {
    started_at: Instant,
    counters: HashMap<String, AtomicUsize>,
}

impl StatusBoard {
    /// Create counters for the given entry names. Names not listed here
    /// are silently ignored by `increment`/`decrement`; the key set never
    /// changes after construction.
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            started_at: Instant::now(),
            counters: names.into_iter().map(|n| (n, AtomicUsize::new(0))).collect(),
        }
    }

    /// Record a bridge starting for `name`.
    pub fn increment(&self, name: &str) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Record a bridge ending for `name`.
    pub fn decrement(&self, name: &str) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Total live bridges across every entry.
    pub fn total_live(&self) -> usize {
        self.counters.values().map(|c| c.load(Ordering::SeqCst)).sum()
    }

    /// The `/status` response body.
    pub fn snapshot(&self) -> Value {
        let servers: serde_json::Map<String, Value> = self
            .counters
            .iter()
            .map(|(name, counter)| {
                (
                    name.clone(),
                    json!({
                        "running": true,
                        "live_sessions": counter.load(Ordering::SeqCst),
                    }),
                )
            })
            .collect();
        json!({
            "servers": servers,
            "uptime_s": self.started_at.elapsed().as_secs(),
        })
    }
}

/// RAII guard pairing one `increment` with exactly one `decrement`.
#[derive(Debug)]
pub struct SessionGuard {
    board: Arc<StatusBoard>,
    name: String,
}

impl SessionGuard {
    /// Register a live session for `name`.
    pub fn new(board: Arc<StatusBoard>, name: String) -> Self {
        board.increment(&name);
        Self { board, name }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.board.decrement(&self.name);
    }
}

/// `GET /status`
pub async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    Json(state.status.snapshot())
}
