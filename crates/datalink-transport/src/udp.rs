//! UDP link implementation.
//!
//! Each datagram carries exactly one length-prefixed envelope. Used for the
//! wireless link to the peer node.

use async_trait::async_trait;
use bytes::Bytes;
use datalink_protocol::codec::{self, LENGTH_PREFIX_SIZE, MAX_ENVELOPE_SIZE};
use datalink_protocol::Envelope;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace};

use crate::traits::{Link, TransportError};

/// UDP link configuration.
#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Local address to bind to.
    pub bind_addr: SocketAddr,
    /// Peer address envelopes are sent to.
    pub peer_addr: SocketAddr,
    /// Drop datagrams that do not come from `peer_addr`.
    pub peer_only: bool,
}

/// A UDP datagram link.
pub struct UdpLink {
    name: String,
    socket: UdpSocket,
    config: UdpConfig,
    recv_buffer: Vec<u8>,
}

impl UdpLink {
    /// Bind a UDP link.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn bind(name: impl Into<String>, config: UdpConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let name = name.into();

        info!(link = %name, bind = %config.bind_addr, peer = %config.peer_addr, "UDP link bound");

        Ok(Self {
            name,
            socket,
            config,
            recv_buffer: vec![0u8; LENGTH_PREFIX_SIZE + MAX_ENVELOPE_SIZE],
        })
    }

    /// Get the local address this link is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

#[async_trait]
impl Link for UdpLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            let (len, from) = self.socket.recv_from(&mut self.recv_buffer).await?;

            if self.config.peer_only && from != self.config.peer_addr {
                debug!(link = %self.name, %from, "Ignoring datagram from unknown sender");
                continue;
            }

            trace!(link = %self.name, %from, bytes = len, "Datagram received");
            return Ok(Some(codec::decode(&self.recv_buffer[..len])?));
        }
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        let sent = self.socket.send_to(&data, self.config.peer_addr).await?;
        if sent != data.len() {
            return Err(TransportError::SendFailed(format!(
                "short datagram: {sent} of {} bytes",
                data.len()
            )));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}
