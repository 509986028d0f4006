//! Link abstraction for datalink gateways.
//!
//! A link moves encoded envelopes over one physical transport. Framing is the
//! link's concern; routing and topic handling belong to the gateway.

use async_trait::async_trait;
use bytes::Bytes;
use datalink_protocol::{codec, Envelope};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Link was closed.
    #[error("Link closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] datalink_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the link is unusable after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed)
    }
}

/// A bidirectional envelope link.
///
/// `recv` must be cancellation safe: gateways poll it inside `select!`
/// alongside their timers and relay queue.
#[async_trait]
pub trait Link: Send {
    /// Get the link name (e.g., "serial", "wireless").
    fn name(&self) -> &str;

    /// Receive the next envelope.
    ///
    /// Returns `None` if the link is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError>;

    /// Send an envelope.
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let data = codec::encode(envelope)?;
        self.send_raw(data).await
    }

    /// Send one pre-encoded frame.
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Check if the link is still open.
    fn is_open(&self) -> bool;
}
