//! Transport seam for the control channel
//!
//! The tunnel engine rides on a single pre-established duplex message
//! channel between two peers. Anything that can carry ordered, lossless
//! string frames can implement [`Transport`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Transport errors
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The carrier is gone; nothing further can be sent or received
    #[error("Transport closed")]
    Closed,

    #[error("Transport error: {0}")]
    Other(String),
}

/// A reliable, in-order duplex message channel between two managers
///
/// The engine assumes the carrier never reorders or drops frames. `recv`
/// returning `Ok(None)` means the carrier ended; the manager treats that as
/// its own closure.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one framed message to the peer
    async fn send(&self, message: String) -> Result<(), TransportError>;

    /// Receive the next framed message, or `None` when the carrier ended
    async fn recv(&self) -> Result<Option<String>, TransportError>;
}

/// In-process transport backed by a pair of unbounded channels
///
/// Useful for tests and for pairing two managers inside one process; real
/// deployments wrap their duplex carrier in a [`Transport`] instead.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl ChannelTransport {
    /// Create two connected transport endpoints
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (left_tx, right_rx) = mpsc::unbounded_channel();
        let (right_tx, left_rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                tx: left_tx,
                rx: Mutex::new(left_rx),
            },
            ChannelTransport {
                tx: right_tx,
                rx: Mutex::new(right_rx),
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: String) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }

    async fn recv(&self) -> Result<Option<String>, TransportError> {
        Ok(self.rx.lock().await.recv().await)
    }
}
