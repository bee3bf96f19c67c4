//! BLE transport backed by `btleplug`.
//!
//! Locates a peer by device address, connects, and subscribes to the notify
//! characteristic for the requested channel. Notification values are pumped
//! into the link's inbound queue as owned buffers.

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::addr::BtAddr;
use crate::error::{Error, Result};
use crate::transport::uuids::channel_data_uuid;
use crate::transport::{Transport, TransportLink};

/// How long to scan for a peer before giving up.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Interval between discovery polls of the adapter.
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Upper bound on a single connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Number of connect attempts before reporting failure.
const CONNECT_ATTEMPTS: u32 = 3;
/// Delay between connect attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Inbound queue depth per link.
const INBOUND_QUEUE_DEPTH: usize = 64;

/// BLE transport using the system Bluetooth adapter.
pub struct BleTransport {
    /// The adapter used for discovery and connections.
    adapter: Adapter,
}

impl BleTransport {
    /// Create a transport on the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self { adapter })
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    /// Scan until the peer with the given address shows up.
    async fn find_peripheral(&self, addr: BtAddr) -> Result<Peripheral> {
        debug!("Scanning for peer {}", addr);

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        let deadline = tokio::time::Instant::now() + DISCOVERY_TIMEOUT;
        let found = 'search: loop {
            for peripheral in self.adapter.peripherals().await.map_err(Error::Bluetooth)? {
                if peripheral.address().into_inner() == addr.bytes() {
                    break 'search Some(peripheral);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(DISCOVERY_POLL_INTERVAL).await;
        };

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        found.ok_or_else(|| Error::DeviceNotFound {
            address: addr.to_string(),
        })
    }

    /// Connect to the peripheral with bounded retries.
    async fn connect_peripheral(&self, peripheral: &Peripheral, addr: BtAddr) -> Result<()> {
        if peripheral.is_connected().await.unwrap_or(false) {
            debug!("Peer {} already connected at BLE level", addr);
            return Ok(());
        }

        let mut attempts = 0;
        let mut last_attempt_timed_out = false;
        while attempts < CONNECT_ATTEMPTS {
            attempts += 1;
            debug!(
                "Connect attempt {} of {} to {}",
                attempts, CONNECT_ATTEMPTS, addr
            );

            match tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
                Ok(Ok(())) => {
                    info!("Connected to peer {}", addr);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!("Connect attempt {} to {} failed: {}", attempts, addr, e);
                    last_attempt_timed_out = false;
                }
                Err(_) => {
                    warn!("Connect attempt {} to {} timed out", attempts, addr);
                    last_attempt_timed_out = true;
                }
            }

            if attempts < CONNECT_ATTEMPTS {
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
        }

        if last_attempt_timed_out {
            return Err(Error::Timeout);
        }

        Err(Error::ConnectionFailed {
            reason: format!("failed after {} attempts", CONNECT_ATTEMPTS),
        })
    }

    /// Find the notify characteristic for the given channel.
    fn find_channel_characteristic(
        peripheral: &Peripheral,
        channel: u8,
    ) -> Result<Characteristic> {
        let uuid = channel_data_uuid(channel);

        for service in peripheral.services() {
            for characteristic in service.characteristics {
                trace!(
                    "Found characteristic {} in service {}",
                    characteristic.uuid,
                    service.uuid
                );
                if characteristic.uuid == uuid {
                    return Ok(characteristic);
                }
            }
        }

        Err(Error::CharacteristicNotFound {
            uuid: uuid.to_string(),
        })
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn open(&self, addr: BtAddr, channel: u8) -> Result<Box<dyn TransportLink>> {
        let peripheral = self.find_peripheral(addr).await?;

        self.connect_peripheral(&peripheral, addr).await?;

        peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        let characteristic = Self::find_channel_characteristic(&peripheral, channel)?;

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(Error::Bluetooth)?;

        debug!(
            "Subscribed to channel {} characteristic {} on {}",
            channel, characteristic.uuid, addr
        );

        // Pump notification values for our characteristic into the inbound
        // queue. The stream ends when the peripheral disconnects.
        let mut notifications = peripheral.notifications().await.map_err(Error::Bluetooth)?;
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let data_uuid = characteristic.uuid;

        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != data_uuid {
                    continue;
                }
                trace!(
                    "Inbound {} bytes on characteristic {}: {}",
                    notification.value.len(),
                    data_uuid,
                    crate::utils::hex_preview(&notification.value, 20)
                );
                if inbound_tx.send(Bytes::from(notification.value)).await.is_err() {
                    break;
                }
            }
            debug!("Notification pump for {} ended", data_uuid);
        });

        Ok(Box::new(BleLink {
            peripheral,
            characteristic,
            inbound: inbound_rx,
            pump,
        }))
    }
}

/// An open BLE link to one peer.
struct BleLink {
    peripheral: Peripheral,
    characteristic: Characteristic,
    inbound: mpsc::Receiver<Bytes>,
    pump: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl TransportLink for BleLink {
    async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if let Err(e) = self.peripheral.unsubscribe(&self.characteristic).await {
            debug!("Unsubscribe failed during close: {}", e);
        }

        self.pump.abort();

        self.peripheral
            .disconnect()
            .await
            .map_err(Error::Bluetooth)?;

        debug!("BLE link closed");

        Ok(())
    }
}
