//! In-process transport
//!
//! Every successful [`MemoryTransport::open`] hands the device side of the
//! new link to the paired [`MemoryDeviceAcceptor`]. Tests and simulators use
//! the resulting [`MemoryDevice`] to script device behavior: reading the
//! frames the session sent, answering them in any order, pushing
//! notifications, or dropping the link.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{Link, LinkReceiver, LinkSender, Transport, TransportError};

#[derive(Debug)]
struct MemoryInner {
    devices: mpsc::UnboundedSender<MemoryDevice>,
    reachable: AtomicBool,
    opens: AtomicUsize,
    failed_opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Transport whose links terminate inside the current process
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

/// Receives the device side of every link opened through a [`MemoryTransport`]
#[derive(Debug)]
pub struct MemoryDeviceAcceptor {
    devices: mpsc::UnboundedReceiver<MemoryDevice>,
}

impl MemoryTransport {
    pub fn new() -> (Self, MemoryDeviceAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(MemoryInner {
                devices: tx,
                reachable: AtomicBool::new(true),
                opens: AtomicUsize::new(0),
                failed_opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }),
        };
        (transport, MemoryDeviceAcceptor { devices: rx })
    }

    /// Simulate the device going off the network (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of links successfully opened
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Number of open attempts rejected because the device was unreachable
    pub fn failed_open_count(&self) -> usize {
        self.inner.failed_opens.load(Ordering::SeqCst)
    }

    /// Number of links closed from the session side
    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, address: &str, _timeout: Duration) -> Result<Link, TransportError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            self.inner.failed_opens.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Unreachable {
                address: address.to_string(),
                reason: "device marked unreachable".to_string(),
            });
        }

        let (to_device_tx, to_device_rx) = mpsc::unbounded_channel();
        let (to_session_tx, to_session_rx) = mpsc::unbounded_channel();

        let device = MemoryDevice {
            address: address.to_string(),
            inbound: to_device_rx,
            outbound: Some(to_session_tx),
        };
        if self.inner.devices.send(device).is_err() {
            self.inner.failed_opens.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Unreachable {
                address: address.to_string(),
                reason: "no device accepting links".to_string(),
            });
        }

        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Link::new(
            Box::new(MemorySender {
                tx: Some(to_device_tx),
                inner: Arc::clone(&self.inner),
            }),
            Box::new(MemoryReceiver { rx: to_session_rx }),
        ))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl MemoryDeviceAcceptor {
    /// Wait for the next link to be opened
    pub async fn accept(&mut self) -> Option<MemoryDevice> {
        self.devices.recv().await
    }

    /// Take an already opened link without waiting
    pub fn try_accept(&mut self) -> Option<MemoryDevice> {
        self.devices.try_recv().ok()
    }
}

/// Device side of an in-memory link
#[derive(Debug)]
pub struct MemoryDevice {
    address: String,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
}

impl MemoryDevice {
    /// Address the session dialed
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Next frame sent by the session; `None` once the session closed the link
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Frame already sent by the session, if any
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.inbound.try_recv().ok()
    }

    /// Push a frame to the session. Returns false if the link is gone.
    pub fn send(&self, frame: impl Into<Bytes>) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(frame.into()).is_ok(),
            None => false,
        }
    }

    /// Drop the link from the device side
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

struct MemorySender {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    inner: Arc<MemoryInner>,
}

#[async_trait]
impl LinkSender for MemorySender {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.tx.take().is_some() {
            self.inner.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl LinkReceiver for MemoryReceiver {
    async fn receive(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (transport, mut acceptor) = MemoryTransport::new();
        let (mut tx, mut rx) = transport
            .open("device-1", Duration::from_secs(1))
            .await
            .unwrap()
            .split();
        let mut device = acceptor.accept().await.unwrap();
        assert_eq!(device.address(), "device-1");

        tx.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(device.recv().await.unwrap(), Bytes::from_static(b"ping"));

        assert!(device.send("pong"));
        assert_eq!(rx.receive().await.unwrap().unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn test_device_close_ends_receiver() {
        let (transport, mut acceptor) = MemoryTransport::new();
        let (_tx, mut rx) = transport
            .open("device-1", Duration::from_secs(1))
            .await
            .unwrap()
            .split();
        let mut device = acceptor.accept().await.unwrap();

        device.close();
        assert!(rx.receive().await.unwrap().is_none());
        assert!(!device.send("late"));
    }

    #[tokio::test]
    async fn test_close_counted_once() {
        let (transport, mut acceptor) = MemoryTransport::new();
        let (mut tx, _rx) = transport
            .open("device-1", Duration::from_secs(1))
            .await
            .unwrap()
            .split();
        let mut device = acceptor.accept().await.unwrap();

        tx.close().await.unwrap();
        tx.close().await.unwrap();
        assert_eq!(transport.close_count(), 1);
        assert!(device.recv().await.is_none());
        assert!(matches!(
            tx.send(Bytes::from_static(b"x")).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let (transport, _acceptor) = MemoryTransport::new();
        transport.set_reachable(false);

        let err = transport
            .open("device-1", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.failed_open_count(), 1);
        assert_eq!(transport.open_count(), 0);

        transport.set_reachable(true);
        assert!(transport.open("device-1", Duration::from_secs(1)).await.is_ok());
        assert_eq!(transport.open_count(), 1);
    }
}
