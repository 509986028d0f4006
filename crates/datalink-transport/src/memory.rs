//! In-process link pair.
//!
//! Both ends exchange fully encoded frames, so the codec is exercised exactly
//! as on a real transport. Used for tests and for wiring two buses in one
//! process.

use async_trait::async_trait;
use bytes::Bytes;
use datalink_protocol::{codec, Envelope};
use tokio::sync::mpsc;
use tracing::trace;

use crate::traits::{Link, TransportError};

/// One end of an in-memory link.
pub struct MemoryLink {
    name: String,
    tx: mpsc::UnboundedSender<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    is_open: bool,
}

impl MemoryLink {
    /// Create two connected ends.
    #[must_use]
    pub fn pair(a: impl Into<String>, b: impl Into<String>) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self {
                name: a.into(),
                tx: a_tx,
                rx: a_rx,
                is_open: true,
            },
            Self {
                name: b.into(),
                tx: b_tx,
                rx: b_rx,
                is_open: true,
            },
        )
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        match self.rx.recv().await {
            Some(frame) => Ok(Some(codec::decode(&frame)?)),
            None => {
                self.is_open = false;
                Ok(None)
            }
        }
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        trace!(link = %self.name, bytes = data.len(), "Memory send");
        if self.tx.send(data).is_err() {
            self.is_open = false;
            return Err(TransportError::ConnectionClosed);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
