//! Per-peer connection state and data fan-out.
//!
//! A [`Connection`] exists between `start_connection` and
//! `cleanup_connection` on the bridge. Inbound payloads are fanned out on a
//! broadcast channel; applications either take a receiver via
//! [`Connection::subscribe`] or register a callback via
//! [`Connection::on_data`].

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, trace};

use crate::addr::BtAddr;

/// Capacity of the per-connection data broadcast channel.
const DATA_CHANNEL_CAPACITY: usize = 64;

/// Ownership token for a registered callback.
///
/// Returned by [`Connection::on_data`] and the bridge's event registration.
/// The registration lives as long as the handle: dropping it (or calling
/// [`CallbackHandle::unregister`]) stops the forwarder task, after which
/// the callback is never invoked again.
pub struct CallbackHandle {
    id: u64,
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, teardown: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Identifier of this registration, unique per connection or bridge.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Explicitly end the registration.
    ///
    /// Equivalent to dropping the handle; provided so the intent shows up
    /// at the call site.
    pub fn unregister(mut self) {
        self.tear_down();
    }

    fn tear_down(&mut self) {
        if let Some(f) = self.teardown.take() {
            f();
        }
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.tear_down();
    }
}

/// Connection state for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Not connected to the peer.
    #[default]
    Disconnected,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the peer.
    Connected,
    /// Currently disconnecting.
    Disconnecting,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Event emitted on every connection state transition.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionEvent {
    /// The peer address.
    pub addr: BtAddr,
    /// The channel the connection uses.
    pub channel: u8,
    /// The new connection state.
    pub state: ConnectionState,
}

/// A connection to a single peer, keyed by device address.
pub struct Connection {
    /// The peer address.
    addr: BtAddr,
    /// The channel in use.
    channel: u8,
    /// Current connection state.
    state: RwLock<ConnectionState>,
    /// When the connection was started.
    started_at: DateTime<Utc>,
    /// Inbound data fan-out. Taken when the connection closes so that
    /// subscribers observe the channel closing.
    data_tx: RwLock<Option<broadcast::Sender<Bytes>>>,
    /// Bridge-wide connection event channel.
    event_tx: broadcast::Sender<ConnectionEvent>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Signals the pump task to shut the link down.
    close_signal: Arc<Notify>,
    /// Handle to the pump task driving the link.
    pump_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    /// Create a new connection entry. Starts in the default `Disconnected`
    /// state; the bridge drives the transitions so each one emits an event.
    pub(crate) fn new(
        addr: BtAddr,
        channel: u8,
        event_tx: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let (data_tx, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);

        Self {
            addr,
            channel,
            state: RwLock::new(ConnectionState::default()),
            started_at: Utc::now(),
            data_tx: RwLock::new(Some(data_tx)),
            event_tx,
            callback_counter: AtomicU64::new(0),
            close_signal: Arc::new(Notify::new()),
            pump_handle: RwLock::new(None),
        }
    }

    /// Get the peer address.
    pub fn addr(&self) -> BtAddr {
        self.addr
    }

    /// Get the channel number.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// When this connection was started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Subscribe to inbound data.
    ///
    /// Each payload is an owned buffer; cloning is cheap. The channel closes
    /// when the connection is cleaned up or the peer disconnects. A receiver
    /// that falls behind observes `Lagged` and misses the oldest payloads.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        match &*self.data_tx.read() {
            Some(tx) => tx.subscribe(),
            // Already closed; hand out a receiver that reports Closed.
            None => broadcast::channel(1).1,
        }
    }

    /// Register a callback for inbound data.
    ///
    /// The callback runs on a dedicated task, never on the task driving the
    /// link. The slice is valid for exactly the duration of the call; copy
    /// it out to retain the data.
    pub fn on_data<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(payload) = rx.recv().await {
                callback(&payload);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Fan an inbound payload out to subscribers.
    pub(crate) fn dispatch(&self, data: Bytes) {
        trace!(
            "Dispatching {} bytes from {}: {}",
            data.len(),
            self.addr,
            crate::utils::hex_preview(&data, 20)
        );
        // No receivers is fine; the payload is simply dropped.
        if let Some(tx) = &*self.data_tx.read() {
            let _ = tx.send(data);
        }
    }

    /// Close the data channel so subscribers observe `Closed`.
    pub(crate) fn close_data_channel(&self) {
        self.data_tx.write().take();
    }

    /// Update the connection state and emit an event on change.
    pub(crate) fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!(
                "Connection {} state changed: {} -> {}",
                self.addr, old_state, new_state
            );

            let _ = self.event_tx.send(ConnectionEvent {
                addr: self.addr,
                channel: self.channel,
                state: new_state,
            });
        }
    }

    /// The notifier used to ask the pump task to close the link.
    pub(crate) fn close_signal(&self) -> Arc<Notify> {
        self.close_signal.clone()
    }

    /// Store the pump task handle.
    pub(crate) fn set_pump_handle(&self, handle: tokio::task::JoinHandle<()>) {
        *self.pump_handle.write() = Some(handle);
    }

    /// Take the pump task handle, if still present.
    pub(crate) fn take_pump_handle(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.pump_handle.write().take()
    }
}
