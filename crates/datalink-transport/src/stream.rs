//! Byte-stream link implementation.
//!
//! Carries length-prefixed envelopes over any async byte stream. The serial
//! link to the flight computer opens the tty device twice, once for reading
//! and once for writing, so a pending read never stalls a write. Line
//! settings (baud rate, raw mode) are expected to be configured on the device
//! beforehand.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use datalink_protocol::{codec, Envelope, ProtocolError};
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::traits::{Link, TransportError};

/// A link over a reader/writer pair.
pub struct StreamLink<R, W> {
    name: String,
    reader: R,
    writer: W,
    read_buffer: BytesMut,
    is_open: bool,
}

impl<R, W> StreamLink<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Create a link from a reader and a writer.
    #[must_use]
    pub fn new(name: impl Into<String>, reader: R, writer: W) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
            read_buffer: BytesMut::with_capacity(4096),
            is_open: true,
        }
    }
}

impl StreamLink<File, File> {
    /// Open a serial device (or any character device) as a link.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened.
    pub async fn open_serial(
        name: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let reader = OpenOptions::new().read(true).open(path).await?;
        let writer = OpenOptions::new().write(true).open(path).await?;
        let name = name.into();

        info!(link = %name, device = %path.display(), "Serial link opened");
        Ok(Self::new(name, reader, writer))
    }
}

#[async_trait]
impl<R, W> Link for StreamLink<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        loop {
            match codec::decode_from(&mut self.read_buffer) {
                Ok(Some(envelope)) => return Ok(Some(envelope)),
                Ok(None) => {}
                Err(ProtocolError::FrameTooLarge(len)) => {
                    // A bogus length prefix means the stream is out of sync.
                    warn!(link = %self.name, len, "Oversized frame, discarding buffered bytes");
                    self.read_buffer.clear();
                    return Err(ProtocolError::FrameTooLarge(len).into());
                }
                Err(e) => return Err(e.into()),
            }

            let n = self.reader.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                debug!(link = %self.name, "Stream ended");
                self.is_open = false;
                return Ok(None);
            }
        }
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
