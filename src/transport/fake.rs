//! In-process fake transport pair for unit and integration tests
//!
//! [`FakeTransport::pair`] returns two connected transports: whatever one
//! side sends, the other side receives. A bridge under test takes one end
//! of each pair while the test drives the far ends, replacing real
//! processes and network I/O with in-memory channels.

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::codec::Message;
use crate::error::{ProxyError, Result};
use crate::transport::Transport;

/// Channel capacity for the fake pair. Generous on purpose: tests drive
/// both ends from one task and must not deadlock on backpressure.
const FAKE_CAPACITY: usize = 64;

/// One end of an in-memory transport pair.
#[derive(Debug)]
pub struct FakeTransport {
    /// Sends to the peer; `None` once closed.
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    /// Receives from the peer.
    rx: Mutex<mpsc::Receiver<Message>>,
    /// Flipped by `close` to unblock a pending `recv` on this end.
    closed: CancellationToken,
}

impl FakeTransport {
    /// Create two connected ends.
    pub fn pair() -> (FakeTransport, FakeTransport) {
        let (a_tx, b_rx) = mpsc::channel::<Message>(FAKE_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel::<Message>(FAKE_CAPACITY);
        (
            FakeTransport {
                tx: Mutex::new(Some(a_tx)),
                rx: Mutex::new(a_rx),
                closed: CancellationToken::new(),
            },
            FakeTransport {
                tx: Mutex::new(Some(b_tx)),
                rx: Mutex::new(b_rx),
                closed: CancellationToken::new(),
            },
        )
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn send(&self, message: Message) -> Result<()> {
        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(ProxyError::TransportClosed.into());
        };
        tx.send(message)
            .await
            .map_err(|_| ProxyError::TransportClosed.into())
    }

    async fn recv(&self) -> Option<Message> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => None,
            message = rx.recv() => message,
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        // Dropping our sender gives the peer end-of-stream.
        self.tx.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessageId;
    use serde_json::json;

    #[tokio::test]
    async fn test_pair_relays_both_directions() {
        let (a, b) = FakeTransport::pair();

        let ping = Message::request(MessageId::Number(1), "ping", json!({}));
        a.send(ping.clone()).await.unwrap();
        assert_eq!(b.recv().await, Some(ping));

        let pong = Message::response(MessageId::Number(1), json!({}));
        b.send(pong.clone()).await.unwrap();
        assert_eq!(a.recv().await, Some(pong));
    }

    #[tokio::test]
    async fn test_close_gives_peer_end_of_stream() {
        let (a, b) = FakeTransport::pair();
        a.close().await;
        assert!(b.recv().await.is_none());
        assert!(a.recv().await.is_none(), "own recv must unblock too");
        assert!(a.send(Message::notification("x", None)).await.is_err());
    }
}
