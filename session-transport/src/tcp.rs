//! Newline-delimited TCP transport
//!
//! Used by devices that speak line-oriented protocols over a plain socket
//! (JSON-RPC on the Kodi TCP port, many serial-over-IP gateways). Each frame
//! is one line; the delimiter is stripped on receive and appended on send.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::{Link, LinkReceiver, LinkSender, Transport, TransportError};

const DELIMITER: u8 = b'\n';

/// Opens newline-framed TCP links
#[derive(Debug, Clone)]
pub struct TcpLineTransport {
    max_frame_len: usize,
    nodelay: bool,
}

impl TcpLineTransport {
    /// Default upper bound on a single inbound frame
    pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

    pub fn new() -> Self {
        Self {
            max_frame_len: Self::DEFAULT_MAX_FRAME_LEN,
            nodelay: true,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpLineTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpLineTransport {
    async fn open(&self, address: &str, timeout: Duration) -> Result<Link, TransportError> {
        if address.rsplit_once(':').map_or(true, |(host, port)| {
            host.is_empty() || port.parse::<u16>().is_err()
        }) {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Unreachable {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    address: address.to_string(),
                    timeout,
                })
            }
        };
        stream.set_nodelay(self.nodelay)?;

        tracing::debug!("TCP link opened to {}", address);

        let (read_half, write_half) = stream.into_split();
        Ok(Link::new(
            Box::new(TcpLineSender {
                writer: write_half,
                closed: false,
            }),
            Box::new(TcpLineReceiver {
                reader: BufReader::new(read_half),
                max_frame_len: self.max_frame_len,
            }),
        ))
    }

    fn name(&self) -> &'static str {
        "tcp-line"
    }
}

struct TcpLineSender {
    writer: OwnedWriteHalf,
    closed: bool,
}

#[async_trait]
impl LinkSender for TcpLineSender {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut line = BytesMut::with_capacity(frame.len() + 1);
        line.put_slice(&frame);
        line.put_u8(DELIMITER);
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.writer.shutdown().await?;
        Ok(())
    }
}

struct TcpLineReceiver {
    reader: BufReader<OwnedReadHalf>,
    max_frame_len: usize,
}

#[async_trait]
impl LinkReceiver for TcpLineReceiver {
    async fn receive(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            let mut buf = Vec::new();
            // One byte of headroom for the delimiter
            let limit = (self.max_frame_len + 1) as u64;
            let read = (&mut self.reader)
                .take(limit)
                .read_until(DELIMITER, &mut buf)
                .await?;

            if read == 0 {
                return Ok(None);
            }

            let terminated = buf.last() == Some(&DELIMITER);
            if !terminated && buf.len() > self.max_frame_len {
                return Err(TransportError::FrameTooLarge {
                    len: buf.len(),
                    max: self.max_frame_len,
                });
            }

            while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
                buf.pop();
            }
            if buf.is_empty() {
                // Keep-alive blank lines carry no frame
                continue;
            }
            return Ok(Some(Bytes::from(buf)));
        }
    }
}
