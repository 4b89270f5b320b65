//! Stdio transports: child-process servers and the proxy's own stdio
//!
//! [`StdioTransport`] spawns a child process from a [`SpawnDescriptor`] and
//! communicates with it over its stdin/stdout pipes using newline-delimited
//! JSON framing. This is the standard transport for locally-installed MCP
//! servers, and it doubles as the child supervisor: the transport owns the
//! process, terminates it gracefully on `close`, and always reaps it.
//!
//! [`ParentStdioTransport`] is the mirror image: when a parent MCP client
//! launched the proxy itself, the proxy's own stdin/stdout form the ingress
//! transport.
//!
//! # Protocol
//!
//! - Outbound messages are written as a single JSON object followed by a
//!   newline (`\n`), flushed per message.
//! - Inbound messages are read one JSON object per line. Malformed lines
//!   are logged and dropped; the stream continues.
//! - Child stderr is forwarded to the log sink line-by-line and never
//!   parsed as MCP.
//!
//! # Lifecycle
//!
//! `close` drops the child's stdin, sends SIGTERM (Unix) or `start_kill`
//! (elsewhere), waits up to [`CHILD_GRACE_PERIOD`] for the child to exit,
//! force-kills on timeout, and always `wait()`s so no zombie remains. The
//! child is spawned into its own process group so terminal signals aimed at
//! the proxy do not reach it.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::codec::Message;
use crate::config::SpawnDescriptor;
use crate::error::{ProxyError, Result};
use crate::transport::{decode_inbound, Transport, INBOUND_CAPACITY};

/// How long a child gets between SIGTERM and SIGKILL.
pub const CHILD_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Stdio-based MCP transport that owns a child process.
///
/// Communication happens over the child's stdin (outbound) and stdout
/// (inbound). The child's stderr is drained to the log sink at DEBUG.
#[derive(Debug)]
pub struct StdioTransport {
    /// Child stdin; `None` once the transport has been closed.
    stdin: Mutex<Option<ChildStdin>>,
    /// Inbound message channel fed by the stdout reader task.
    inbound: Mutex<mpsc::Receiver<Message>>,
    /// The child process handle; taken by `close` for termination and reap.
    child: Mutex<Option<Child>>,
    /// Executable name, kept for log context.
    command: String,
}

impl StdioTransport {
    /// Spawn a child process and wire up stdio pipes.
    ///
    /// The child's environment is exactly `descriptor.env`: the inherited
    /// environment is cleared first, so environment composition (static
    /// entries, header-derived entries, optional parent passthrough) happens
    /// entirely in [`SpawnDescriptor`] construction. On Unix the child is
    /// placed in its own process group.
    ///
    /// Two background tasks are started immediately: a stdout reader that
    /// decodes one message per line, and a stderr reader that forwards
    /// diagnostics to the log sink.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::SpawnFailed`] if the executable cannot be
    /// started (not found, permission denied), surfaced synchronously.
    pub fn spawn(descriptor: &SpawnDescriptor) -> Result<Self> {
        let mut cmd = Command::new(&descriptor.program);
        cmd.args(&descriptor.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.env_clear().envs(&descriptor.env);
        cmd.kill_on_drop(true);
        if let Some(dir) = &descriptor.cwd {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProxyError::SpawnFailed {
            command: descriptor.program.clone(),
            source,
        })?;

        // All three handles are Some because we requested piped stdio above.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Transport("child stdin unavailable after spawn".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Transport("child stdout unavailable after spawn".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProxyError::Transport("child stderr unavailable after spawn".into()))?;

        let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_CAPACITY);

        // Background task: drain child stdout -> inbound channel. The send
        // blocks while the bridge's sink is busy, which stops us reading
        // more lines and lets the pipe fill up: backpressure reaches the
        // child. On EOF the sender is dropped and recv() observes
        // end-of-stream after the buffered messages drain.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(message) = decode_inbound(&line) else {
                    continue;
                };
                if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Background task: forward child stderr to the log sink. Diagnostic
        // only, never parsed as MCP.
        let command = descriptor.program.clone();
        let stderr_command = command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(command = %stderr_command, "child stderr: {line}");
            }
        });

        Ok(Self {
            stdin: Mutex::new(Some(stdin)),
            inbound: Mutex::new(inbound_rx),
            child: Mutex::new(Some(child)),
            command,
        })
    }

    /// Terminate the child: SIGTERM, bounded grace, force kill, reap.
    ///
    /// Must run with the child already taken out of `self.child`, so a
    /// second `close` is a no-op.
    async fn terminate(&self, mut child: Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SAFETY: pid is a live process ID obtained from tokio::process::Child.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        let _ = child.start_kill();

        match tokio::time::timeout(CHILD_GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(command = %self.command, %status, "child exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(command = %self.command, "failed to await child exit: {e}");
            }
            Err(_) => {
                tracing::warn!(
                    command = %self.command,
                    "child did not exit within {CHILD_GRACE_PERIOD:?}, killing"
                );
                let _ = child.start_kill();
                if let Ok(status) = child.wait().await {
                    tracing::debug!(command = %self.command, %status, "child killed");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    /// Write one message to the child's stdin, newline-terminated, flushed.
    async fn send(&self, message: Message) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(ProxyError::TransportClosed.into());
        };
        let mut line = message.encode();
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProxyError::Transport(format!("write to child stdin failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ProxyError::Transport(format!("flush to child stdin failed: {e}")))?;
        Ok(())
    }

    /// Next message from the child's stdout; `None` once the child has
    /// exited and all buffered lines have been delivered.
    async fn recv(&self) -> Option<Message> {
        self.inbound.lock().await.recv().await
    }

    /// Terminate and reap the child. Idempotent.
    ///
    /// The child is killed before stdin is taken so that a sender blocked
    /// on a full pipe is unblocked (broken pipe) rather than deadlocking
    /// against the stdin lock.
    async fn close(&self) {
        let child = self.child.lock().await.take();
        if let Some(child) = child {
            self.terminate(child).await;
        }
        self.stdin.lock().await.take();
    }
}

impl Drop for StdioTransport {
    /// Best-effort SIGTERM if the transport is dropped without `close`.
    ///
    /// `kill_on_drop(true)` on the command is the backstop that guarantees
    /// the child never outlives the proxy even when this lock is contended.
    fn drop(&mut self) {
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    // SAFETY: pid is a valid process ID obtained from tokio::process::Child.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
                #[cfg(not(unix))]
                let _ = child.start_kill();
            }
        }
    }
}

/// The proxy's own stdin/stdout as a transport.
///
/// Used in stdio-to-remote mode, where a parent MCP client spawned the
/// proxy and speaks newline-delimited JSON over its pipes.
#[derive(Debug)]
pub struct ParentStdioTransport {
    /// Process stdout; `None` once closed.
    stdout: Mutex<Option<tokio::io::Stdout>>,
    /// Inbound message channel fed by the stdin reader task.
    inbound: Mutex<mpsc::Receiver<Message>>,
    /// Stops the stdin reader task on close.
    cancel: CancellationToken,
}

impl ParentStdioTransport {
    /// Wire up the process's stdin/stdout and start the stdin reader task.
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_CAPACITY);
        let cancel = CancellationToken::new();

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    next = lines.next_line() => {
                        let Ok(Some(line)) = next else { break };
                        let Some(message) = decode_inbound(&line) else { continue };
                        if inbound_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            stdout: Mutex::new(Some(tokio::io::stdout())),
            inbound: Mutex::new(inbound_rx),
            cancel,
        }
    }
}

impl Default for ParentStdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for ParentStdioTransport {
    async fn send(&self, message: Message) -> Result<()> {
        let mut guard = self.stdout.lock().await;
        let Some(stdout) = guard.as_mut() else {
            return Err(ProxyError::TransportClosed.into());
        };
        let mut line = message.encode();
        line.push('\n');
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ProxyError::Transport(format!("write to stdout failed: {e}")))?;
        stdout
            .flush()
            .await
            .map_err(|e| ProxyError::Transport(format!("flush to stdout failed: {e}")))?;
        Ok(())
    }

    async fn recv(&self) -> Option<Message> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.stdout.lock().await.take();
    }
}
