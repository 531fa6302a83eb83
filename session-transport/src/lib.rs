//! Raw frame transports for device sessions
//!
//! A transport knows how to open a channel to one device and move opaque
//! frames across it. It has no protocol knowledge: encoding and request
//! correlation live in the codec and session crates.
//!
//! Opening a transport yields a [`Link`], split into a [`LinkSender`] and a
//! [`LinkReceiver`] so that the session can read and write from separate
//! tasks.

mod error;
pub mod memory;
pub mod tcp;

pub use error::TransportError;
pub use memory::{MemoryDevice, MemoryDeviceAcceptor, MemoryTransport};
pub use tcp::TcpLineTransport;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Opens links to devices
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a link to `address`, giving up after `timeout`.
    async fn open(&self, address: &str, timeout: Duration) -> Result<Link, TransportError>;

    /// Short name used in log output
    fn name(&self) -> &'static str;
}

/// Outbound half of a link
#[async_trait]
pub trait LinkSender: Send + 'static {
    /// Send one complete frame
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the link. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Inbound half of a link
#[async_trait]
pub trait LinkReceiver: Send + 'static {
    /// Receive the next frame. `Ok(None)` means the peer closed the link.
    async fn receive(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// An open channel to one device
pub struct Link {
    pub sender: Box<dyn LinkSender>,
    pub receiver: Box<dyn LinkReceiver>,
}

impl Link {
    pub fn new(sender: Box<dyn LinkSender>, receiver: Box<dyn LinkReceiver>) -> Self {
        Self { sender, receiver }
    }

    /// Split the link into its halves
    pub fn split(self) -> (Box<dyn LinkSender>, Box<dyn LinkReceiver>) {
        (self.sender, self.receiver)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}
