//! The pairing tunnel.
//!
//! Two mirrored state machines — one per role — exchange a closed set of
//! JSON messages over a single bridged connection and come out the other
//! side holding the same master key. See [`machine`] for the drivers and
//! [`messages`] for the wire shapes.

pub mod machine;
pub mod messages;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::PairingError;

pub use machine::{
    run_creator_tunnel, run_creator_tunnel_with, run_joiner_tunnel, run_joiner_tunnel_with,
    MESSAGE_TIMEOUT,
};
pub use messages::TunnelMessage;

/// A reliable, ordered, bidirectional message link the tunnel runs over.
///
/// Implemented by the relay transport and by in-memory pairs for tests.
/// The `&mut self` receivers encode the single-waiter rule: at most one
/// in-flight receive per connection, ever.
#[async_trait]
pub trait TunnelLink: Send {
    /// Send one payload. Dropped (not queued) when the link is not open.
    async fn send(&mut self, payload: &[u8]);

    /// Wait for the next inbound payload, bounded by `wait`.
    async fn receive_once(&mut self, wait: Duration) -> Result<Vec<u8>, PairingError>;

    /// Tear the link down. Idempotent.
    async fn close(&mut self);
}

/// One end of an in-memory link pair.
pub struct MemoryLink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Build a connected pair of in-memory links — the mock channel the tunnel
/// tests run the full handshake over.
pub fn memory_link() -> (MemoryLink, MemoryLink) {
    let (tx_a, rx_a) = mpsc::channel(16);
    let (tx_b, rx_b) = mpsc::channel(16);
    (
        MemoryLink {
            tx: Some(tx_a),
            rx: rx_b,
        },
        MemoryLink {
            tx: Some(tx_b),
            rx: rx_a,
        },
    )
}

#[async_trait]
impl TunnelLink for MemoryLink {
    async fn send(&mut self, payload: &[u8]) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(payload.to_vec()).await;
        }
    }

    async fn receive_once(&mut self, wait: Duration) -> Result<Vec<u8>, PairingError> {
        match timeout(wait, self.rx.recv()).await {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(PairingError::ConnectionClosed),
            Err(_) => Err(PairingError::MessageTimeout),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_link_roundtrip() {
        let (mut a, mut b) = memory_link();
        a.send(b"ping").await;
        let data = b.receive_once(Duration::from_secs(1)).await.unwrap();
        assert_eq!(data, b"ping");
    }

    #[tokio::test]
    async fn test_memory_link_timeout() {
        let (_a, mut b) = memory_link();
        let result = b.receive_once(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PairingError::MessageTimeout)));
    }

    #[tokio::test]
    async fn test_memory_link_send_after_close_is_noop() {
        let (mut a, mut b) = memory_link();
        a.close().await;
        a.send(b"dropped").await;
        let result = b.receive_once(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PairingError::ConnectionClosed)));
    }
}
