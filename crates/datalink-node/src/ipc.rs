//! Local estimation process channels.
//!
//! One datagram channel per message kind. All operations are non-blocking so
//! the bridge tick never waits on the estimation process.

use bytes::Bytes;
use datalink_protocol::Payload;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::config::IpcConfig;

/// Datagrams drained per channel and tick at most.
const MAX_DRAIN: usize = 64;

/// Largest datagram accepted from the estimation process.
const MAX_DATAGRAM: usize = 1024;

/// Process channel errors.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Socket failure.
    #[error("I/O error on channel {channel}: {source}")]
    Io {
        channel: u16,
        #[source]
        source: io::Error,
    },

    /// The other end went away.
    #[error("Channel {0} closed")]
    Closed(u16),
}

/// A non-blocking datagram channel to the estimation process.
pub trait ProcessChannel: Send {
    /// Channel number.
    fn channel(&self) -> u16;

    /// Take one pending datagram, if any.
    fn try_recv_raw(&mut self) -> Result<Option<Bytes>, IpcError>;

    /// Send one datagram without waiting.
    fn try_send_raw(&mut self, data: &[u8]) -> Result<(), IpcError>;
}

/// UDP channel on the loopback interface.
pub struct UdpChannel {
    channel: u16,
    socket: UdpSocket,
    peer: SocketAddr,
    buffer: Vec<u8>,
}

impl UdpChannel {
    /// Bind channel `channel` as described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the local port cannot be bound.
    pub async fn bind(channel: u16, config: &IpcConfig) -> Result<Self, IpcError> {
        let local = config.bridge_addr(channel);
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|source| IpcError::Io { channel, source })?;
        let peer = config.process_addr(channel);

        info!(channel, %local, %peer, "Process channel bound");

        Ok(Self {
            channel,
            socket,
            peer,
            buffer: vec![0u8; MAX_DATAGRAM],
        })
    }
}

impl ProcessChannel for UdpChannel {
    fn channel(&self) -> u16 {
        self.channel
    }

    fn try_recv_raw(&mut self) -> Result<Option<Bytes>, IpcError> {
        match self.socket.try_recv_from(&mut self.buffer) {
            Ok((len, from)) => {
                trace!(channel = self.channel, %from, bytes = len, "Datagram from process");
                Ok(Some(Bytes::copy_from_slice(&self.buffer[..len])))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            // An earlier send found nobody listening.
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(None),
            Err(source) => Err(IpcError::Io {
                channel: self.channel,
                source,
            }),
        }
    }

    fn try_send_raw(&mut self, data: &[u8]) -> Result<(), IpcError> {
        match self.socket.try_send_to(data, self.peer) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(IpcError::Closed(self.channel))
            }
            Err(source) => Err(IpcError::Io {
                channel: self.channel,
                source,
            }),
        }
    }
}

/// A typed endpoint over a process channel.
pub struct Endpoint<T> {
    channel: Box<dyn ProcessChannel>,
    _payload: PhantomData<fn() -> T>,
}

impl<T: Payload> Endpoint<T> {
    /// Wrap a channel.
    #[must_use]
    pub fn new(channel: impl ProcessChannel + 'static) -> Self {
        Self {
            channel: Box::new(channel),
            _payload: PhantomData,
        }
    }

    /// Channel number.
    #[must_use]
    pub fn channel(&self) -> u16 {
        self.channel.channel()
    }

    /// Drain pending datagrams and return the newest valid value.
    ///
    /// Older values in the same drain are superseded. Malformed datagrams are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails.
    pub fn try_recv_latest(&mut self) -> Result<Option<T>, IpcError> {
        let mut latest = None;
        for _ in 0..MAX_DRAIN {
            let Some(data) = self.channel.try_recv_raw()? else {
                break;
            };
            match T::decode(&data) {
                Ok(value) => latest = Some(value),
                Err(e) => {
                    warn!(channel = self.channel(), kind = T::KIND, error = %e, "Malformed datagram from process");
                }
            }
        }
        Ok(latest)
    }

    /// Send a value to the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram cannot be sent right now.
    pub fn try_send(&mut self, value: &T) -> Result<(), IpcError> {
        self.channel.try_send_raw(&value.to_bytes())?;
        debug!(channel = self.channel(), kind = T::KIND, "Sent to process");
        Ok(())
    }
}

/// In-memory channel pair for tests.
#[cfg(test)]
pub struct MemoryChannel {
    channel: u16,
    tx: tokio::sync::mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Bytes>,
}

#[cfg(test)]
impl MemoryChannel {
    /// Create the bridge end and the process end of channel `channel`.
    pub fn pair(channel: u16) -> (Self, Self) {
        let (a_tx, b_rx) = tokio::sync::mpsc::unbounded_channel();
        let (b_tx, a_rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Self {
                channel,
                tx: a_tx,
                rx: a_rx,
            },
            Self {
                channel,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }
}

#[cfg(test)]
impl ProcessChannel for MemoryChannel {
    fn channel(&self) -> u16 {
        self.channel
    }

    fn try_recv_raw(&mut self) -> Result<Option<Bytes>, IpcError> {
        use tokio::sync::mpsc::error::TryRecvError;

        match self.rx.try_recv() {
            Ok(data) => Ok(Some(data)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(IpcError::Closed(self.channel)),
        }
    }

    fn try_send_raw(&mut self, data: &[u8]) -> Result<(), IpcError> {
        self.tx
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| IpcError::Closed(self.channel))
    }
}
