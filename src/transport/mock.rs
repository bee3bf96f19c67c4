//! In-process mock transport.
//!
//! Stands in for the BLE transport in tests: peers are registered up front,
//! links are in-memory queues, and the test side injects inbound payloads or
//! ends a link to simulate a remote close. Usable by downstream crates for
//! their own tests as well.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::addr::BtAddr;
use crate::error::{Error, Result};
use crate::transport::{Transport, TransportLink};

/// Queue depth for mock links.
const MOCK_QUEUE_DEPTH: usize = 16;

#[derive(Default)]
struct MockRegistry {
    /// Peers that `open` will find.
    peers: RwLock<HashSet<BtAddr>>,
    /// Injection side of every currently open link.
    links: RwLock<HashMap<(BtAddr, u8), mpsc::Sender<Bytes>>>,
    /// Links that have been closed through `TransportLink::close`.
    closed: RwLock<Vec<(BtAddr, u8)>>,
}

/// Mock transport over in-memory queues.
#[derive(Clone, Default)]
pub struct MockTransport {
    registry: Arc<MockRegistry>,
}

impl MockTransport {
    /// Create an empty mock transport with no known peers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer so that `open` can find it.
    pub fn add_peer(&self, addr: BtAddr) {
        self.registry.peers.write().insert(addr);
    }

    /// Inject an inbound payload on an open link.
    ///
    /// Returns `false` if no link is open for the address/channel pair or
    /// the link's queue is full.
    pub fn inject(&self, addr: BtAddr, channel: u8, data: impl Into<Bytes>) -> bool {
        let sender = self.registry.links.read().get(&(addr, channel)).cloned();
        match sender {
            Some(tx) => tx.try_send(data.into()).is_ok(),
            None => false,
        }
    }

    /// End an open link, as if the peer had closed it.
    pub fn end_link(&self, addr: BtAddr, channel: u8) {
        self.registry.links.write().remove(&(addr, channel));
    }

    /// Number of links currently open.
    pub fn open_link_count(&self) -> usize {
        self.registry.links.read().len()
    }

    /// Links that were closed through the link's `close`, in order.
    pub fn closed_links(&self) -> Vec<(BtAddr, u8)> {
        self.registry.closed.read().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, addr: BtAddr, channel: u8) -> Result<Box<dyn TransportLink>> {
        if !self.registry.peers.read().contains(&addr) {
            return Err(Error::DeviceNotFound {
                address: addr.to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(MOCK_QUEUE_DEPTH);
        self.registry.links.write().insert((addr, channel), tx);

        Ok(Box::new(MockLink {
            addr,
            channel,
            inbound: rx,
            registry: self.registry.clone(),
        }))
    }
}

/// An open mock link.
pub struct MockLink {
    addr: BtAddr,
    channel: u8,
    inbound: mpsc::Receiver<Bytes>,
    registry: Arc<MockRegistry>,
}

#[async_trait]
impl TransportLink for MockLink {
    async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.registry.links.write().remove(&(self.addr, self.channel));
        self.registry.closed.write().push((self.addr, self.channel));
        Ok(())
    }
}
