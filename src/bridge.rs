//! The bridge: connection registry and the background loop driving links.
//!
//! [`BluetoothBridge`] is the owner of every connection. Starting a
//! connection opens a transport link and spawns a pump task that moves
//! inbound payloads from the link into the connection's fan-out channel.
//! Cleaning up a connection (or stopping the bridge) shuts the pump down
//! and closes the link.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::addr::BtAddr;
use crate::connection::{CallbackHandle, Connection, ConnectionEvent, ConnectionState};
use crate::error::{Error, Result};
use crate::transport::{is_valid_channel, BleTransport, Transport, TransportLink};

/// Maximum number of connections that can be established simultaneously.
pub const MAX_CONNECTIONS: usize = 8;

/// Capacity of the bridge-wide connection event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Central manager for Bluetooth data connections.
pub struct BluetoothBridge {
    /// Transport used to open links.
    transport: Arc<dyn Transport>,
    /// Active connections by peer address.
    connections: Arc<RwLock<HashMap<BtAddr, Arc<Connection>>>>,
    /// Connection event channel.
    event_tx: broadcast::Sender<ConnectionEvent>,
    /// Whether the bridge accepts new connections.
    is_running: Arc<AtomicBool>,
    /// Serializes start and stop so the duplicate/limit checks, the
    /// transport open, and the registry insert form one critical section
    /// per bridge. Without it, two starts for the same peer could both
    /// pass the checks across the open suspension point.
    lifecycle_lock: Mutex<()>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl BluetoothBridge {
    /// Create a bridge over the system BLE transport.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let transport = BleTransport::new().await?;
        Ok(Self::with_transport(Arc::new(transport)))
    }

    /// Create a bridge over a specific transport.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            transport,
            connections: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            is_running: Arc::new(AtomicBool::new(true)),
            lifecycle_lock: Mutex::new(()),
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Start a connection to the peer at `addr` on the given channel.
    ///
    /// Returns the connection handle; take a data receiver from it via
    /// [`Connection::subscribe`] or register a callback with
    /// [`Connection::on_data`]. Starting an address that is already
    /// connected on the same channel returns the existing handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the bridge has been stopped, the channel is out
    /// of range, the peer is already connected on a different channel, the
    /// connection limit is reached, or the transport cannot open the link.
    pub async fn start_connection(&self, addr: BtAddr, channel: u8) -> Result<Arc<Connection>> {
        let _lifecycle = self.lifecycle_lock.lock().await;

        if !self.is_running.load(Ordering::SeqCst) {
            return Err(Error::Stopped);
        }

        if !is_valid_channel(channel) {
            return Err(Error::InvalidChannel { channel });
        }

        if let Some(existing) = self.connections.read().get(&addr).cloned() {
            if existing.channel() == channel {
                debug!("Connection to {} already established", addr);
                return Ok(existing);
            }
            return Err(Error::AlreadyConnected {
                address: addr.to_string(),
                channel: existing.channel(),
            });
        }

        if self.connections.read().len() >= MAX_CONNECTIONS {
            warn!(
                "Maximum connection count ({}) reached, refusing {}",
                MAX_CONNECTIONS, addr
            );
            return Err(Error::MaxConnectionsReached {
                max: MAX_CONNECTIONS,
            });
        }

        info!("Starting connection to {} on channel {}", addr, channel);

        let connection = Arc::new(Connection::new(addr, channel, self.event_tx.clone()));
        connection.set_state(ConnectionState::Connecting);

        let link = match self.transport.open(addr, channel).await {
            Ok(link) => link,
            Err(e) => {
                connection.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.connections.write().insert(addr, connection.clone());
        connection.set_state(ConnectionState::Connected);

        self.spawn_pump(connection.clone(), link);

        Ok(connection)
    }

    /// Tear down the connection to the peer at `addr`.
    ///
    /// Waits until the link is closed and the connection is removed.
    /// Subscribers observe their data channel closing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if no connection exists for
    /// the address.
    pub async fn cleanup_connection(&self, addr: &BtAddr) -> Result<()> {
        let connection = self
            .connections
            .read()
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::ConnectionNotFound {
                address: addr.to_string(),
            })?;

        info!("Cleaning up connection to {}", addr);

        Self::shutdown_connection(&connection).await;

        Ok(())
    }

    /// Stop the bridge: tear down every connection and refuse new ones.
    ///
    /// Idempotent; safe to call before any connection was started.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle_lock.lock().await;

        if !self.is_running.swap(false, Ordering::SeqCst) {
            debug!("Bridge already stopped");
            return Ok(());
        }

        info!("Stopping bridge");

        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        for connection in connections {
            Self::shutdown_connection(&connection).await;
        }

        self.connections.write().clear();

        Ok(())
    }

    /// Get all active connections.
    pub fn connections(&self) -> HashMap<BtAddr, Arc<Connection>> {
        self.connections.read().clone()
    }

    /// Get the connection to a specific peer.
    pub fn get_connection(&self, addr: &BtAddr) -> Option<Arc<Connection>> {
        self.connections.read().get(addr).cloned()
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Check whether the bridge accepts new connections.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Subscribe to connection state events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// Register a callback for connection state events.
    pub fn on_connection_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                callback(event);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Spawn the pump task that drives a connection's link.
    ///
    /// The pump moves inbound payloads into the connection's fan-out
    /// channel until the peer closes the link or a close is requested, then
    /// closes the link and removes the connection from the registry.
    fn spawn_pump(&self, connection: Arc<Connection>, mut link: Box<dyn TransportLink>) {
        let connections = self.connections.clone();
        let close_signal = connection.close_signal();

        let pump_connection = connection.clone();
        let handle = tokio::spawn(async move {
            let connection = pump_connection;
            loop {
                tokio::select! {
                    payload = link.recv() => match payload {
                        Some(data) => connection.dispatch(data),
                        None => {
                            info!("Peer {} closed the link", connection.addr());
                            break;
                        }
                    },
                    _ = close_signal.notified() => {
                        debug!("Close requested for {}", connection.addr());
                        break;
                    }
                }
            }

            connection.set_state(ConnectionState::Disconnecting);

            if let Err(e) = link.close().await {
                warn!("Error closing link to {}: {}", connection.addr(), e);
            }

            connection.close_data_channel();
            connections.write().remove(&connection.addr());
            connection.set_state(ConnectionState::Disconnected);

            debug!("Pump for {} ended", connection.addr());
        });

        connection.set_pump_handle(handle);
    }

    /// Ask a connection's pump to shut down and wait for it to finish.
    async fn shutdown_connection(connection: &Arc<Connection>) {
        connection.close_signal().notify_one();

        if let Some(handle) = connection.take_pump_handle() {
            let _ = handle.await;
        }
    }
}

impl Drop for BluetoothBridge {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use async_trait::async_trait;
    use tokio_test::assert_ok;
    use bytes::Bytes;
    use std::time::Duration;

    fn addr(last: u8) -> BtAddr {
        BtAddr::new([0xAA, 0xBB, 0xCC, 0x00, 0x00, last])
    }

    /// Mock transport whose `open` suspends, widening the window between
    /// the registry checks and the insert.
    struct DelayedTransport {
        inner: MockTransport,
        delay: Duration,
    }

    #[async_trait]
    impl Transport for DelayedTransport {
        async fn open(&self, addr: BtAddr, channel: u8) -> Result<Box<dyn TransportLink>> {
            tokio::time::sleep(self.delay).await;
            self.inner.open(addr, channel).await
        }
    }

    fn bridge_with_peers(peers: &[BtAddr]) -> (BluetoothBridge, MockTransport) {
        let transport = MockTransport::new();
        for &peer in peers {
            transport.add_peer(peer);
        }
        let bridge = BluetoothBridge::with_transport(Arc::new(transport.clone()));
        (bridge, transport)
    }

    #[test]
    fn test_max_connections_constant() {
        assert_eq!(MAX_CONNECTIONS, 8);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_channel() {
        let (bridge, _transport) = bridge_with_peers(&[addr(1)]);

        for channel in [0u8, 31] {
            let err = bridge.start_connection(addr(1), channel).await.err().unwrap();
            assert!(matches!(err, Error::InvalidChannel { .. }));
        }
    }

    #[tokio::test]
    async fn test_start_unknown_peer_fails_and_leaves_no_entry() {
        let (bridge, _transport) = bridge_with_peers(&[]);

        let err = bridge.start_connection(addr(7), 1).await.err().unwrap();
        assert!(matches!(err, Error::DeviceNotFound { .. }));
        assert_eq!(bridge.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_start_same_channel_is_idempotent() {
        let (bridge, _transport) = bridge_with_peers(&[addr(1)]);

        let first = bridge.start_connection(addr(1), 5).await.unwrap();
        let second = bridge.start_connection(addr(1), 5).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(bridge.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_start_different_channel_is_rejected() {
        let (bridge, _transport) = bridge_with_peers(&[addr(1)]);

        bridge.start_connection(addr(1), 5).await.unwrap();
        let err = bridge.start_connection(addr(1), 6).await.err().unwrap();

        assert!(matches!(err, Error::AlreadyConnected { channel: 5, .. }));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let peers: Vec<_> = (0..=MAX_CONNECTIONS as u8).map(addr).collect();
        let (bridge, _transport) = bridge_with_peers(&peers);

        for peer in &peers[..MAX_CONNECTIONS] {
            bridge.start_connection(*peer, 1).await.unwrap();
        }

        let err = bridge
            .start_connection(peers[MAX_CONNECTIONS], 1)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::MaxConnectionsReached {
                max: MAX_CONNECTIONS
            }
        ));
    }

    #[tokio::test]
    async fn test_data_flows_to_subscriber() {
        let (bridge, transport) = bridge_with_peers(&[addr(1)]);

        let connection = bridge.start_connection(addr(1), 3).await.unwrap();
        let mut rx = connection.subscribe();

        assert!(transport.inject(addr(1), 3, &b"inbound"[..]));

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload, Bytes::from_static(b"inbound"));
    }

    #[tokio::test]
    async fn test_cleanup_unknown_address() {
        let (bridge, _transport) = bridge_with_peers(&[]);

        let err = bridge.cleanup_connection(&addr(9)).await.err().unwrap();
        assert!(matches!(err, Error::ConnectionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_closes_link_and_removes_entry() {
        let (bridge, transport) = bridge_with_peers(&[addr(2)]);

        let connection = bridge.start_connection(addr(2), 1).await.unwrap();
        let mut rx = connection.subscribe();

        bridge.cleanup_connection(&addr(2)).await.unwrap();

        assert_eq!(bridge.connection_count(), 0);
        assert_eq!(transport.closed_links(), vec![(addr(2), 1)]);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        // Subscribers see the data channel close.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));

        // A second cleanup finds nothing.
        let err = bridge.cleanup_connection(&addr(2)).await.err().unwrap();
        assert!(matches!(err, Error::ConnectionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_remote_close_removes_connection() {
        let (bridge, transport) = bridge_with_peers(&[addr(3)]);

        let connection = bridge.start_connection(addr(3), 2).await.unwrap();
        let mut events = bridge.subscribe_events();

        transport.end_link(addr(3), 2);

        // Drain events until the disconnect shows up.
        loop {
            let event = events.recv().await.unwrap();
            if event.state == ConnectionState::Disconnected {
                break;
            }
        }

        assert_eq!(bridge.connection_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_safe_before_start() {
        let (bridge, _transport) = bridge_with_peers(&[]);

        tokio_test::assert_ok!(bridge.stop().await);
        tokio_test::assert_ok!(bridge.stop().await);
        assert!(!bridge.is_running());
    }

    #[tokio::test]
    async fn test_stop_tears_down_all_connections() {
        let (bridge, transport) = bridge_with_peers(&[addr(1), addr(2)]);

        bridge.start_connection(addr(1), 1).await.unwrap();
        bridge.start_connection(addr(2), 1).await.unwrap();

        bridge.stop().await.unwrap();

        assert_eq!(bridge.connection_count(), 0);
        assert_eq!(transport.open_link_count(), 0);

        let err = bridge.start_connection(addr(1), 1).await.err().unwrap();
        assert!(matches!(err, Error::Stopped));
    }

    #[tokio::test]
    async fn test_concurrent_starts_share_one_connection() {
        let transport = MockTransport::new();
        transport.add_peer(addr(5));
        let bridge = Arc::new(BluetoothBridge::with_transport(Arc::new(DelayedTransport {
            inner: transport.clone(),
            delay: Duration::from_millis(20),
        })));

        let first_task = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.start_connection(addr(5), 1).await }
        });
        let second_task = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.start_connection(addr(5), 1).await }
        });

        let first = first_task.await.unwrap().unwrap();
        let second = second_task.await.unwrap().unwrap();

        // One peer, one connection, one link - whichever start ran second
        // must get the handle the first one registered.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(bridge.connection_count(), 1);
        assert_eq!(transport.open_link_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_starts_respect_connection_limit() {
        let peers: Vec<_> = (0..=MAX_CONNECTIONS as u8).map(addr).collect();
        let transport = MockTransport::new();
        for &peer in &peers {
            transport.add_peer(peer);
        }
        let bridge = Arc::new(BluetoothBridge::with_transport(Arc::new(DelayedTransport {
            inner: transport.clone(),
            delay: Duration::from_millis(5),
        })));

        let tasks: Vec<_> = peers
            .iter()
            .map(|&peer| {
                let bridge = bridge.clone();
                tokio::spawn(async move { bridge.start_connection(peer, 1).await })
            })
            .collect();

        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => {}
                Err(Error::MaxConnectionsReached { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(rejected, 1);
        assert_eq!(bridge.connection_count(), MAX_CONNECTIONS);
        assert_eq!(transport.open_link_count(), MAX_CONNECTIONS);
    }

    #[tokio::test]
    async fn test_start_racing_stop_leaves_no_live_link() {
        let transport = MockTransport::new();
        transport.add_peer(addr(6));
        let bridge = Arc::new(BluetoothBridge::with_transport(Arc::new(DelayedTransport {
            inner: transport.clone(),
            delay: Duration::from_millis(20),
        })));

        let starter = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.start_connection(addr(6), 1).await }
        });
        tokio::task::yield_now().await;
        bridge.stop().await.unwrap();

        // The start either completed before stop tore everything down, or
        // observed the stopped bridge. Neither outcome may leave a link.
        match starter.await.unwrap() {
            Ok(_) | Err(Error::Stopped) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
        assert_eq!(bridge.connection_count(), 0);
        assert_eq!(transport.open_link_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_events_in_order() {
        let (bridge, _transport) = bridge_with_peers(&[addr(4)]);
        let mut events = bridge.subscribe_events();

        bridge.start_connection(addr(4), 1).await.unwrap();
        bridge.cleanup_connection(&addr(4)).await.unwrap();

        let states: Vec<_> = (0..4).map(|_| events.try_recv().unwrap().state).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected,
            ]
        );
    }
}
