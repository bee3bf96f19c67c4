//! # bt-bridge
//!
//! An async Rust library for managing Bluetooth data connections to peer
//! devices identified by MAC address and a logical channel number.
//!
//! The bridge owns the background tasks that drive each connection. Inbound
//! data is delivered through broadcast channels with owned payloads, or
//! through managed callback registrations with an explicit ownership and
//! threading contract - never through a bare function pointer.
//!
//! ## Features
//!
//! - **Connection management**: Up to 8 concurrent connections, one per peer
//! - **Channel-based delivery**: Subscribe to inbound data as owned `Bytes`
//! - **Managed callbacks**: `on_data` registrations that unregister on drop
//! - **Lifecycle events**: Observe every connection state transition
//! - **Pluggable transport**: BLE by default, in-process mock for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bt_bridge::{BluetoothBridge, BtAddr, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let bridge = BluetoothBridge::new().await?;
//!
//!     let addr: BtAddr = "00:1A:7D:DA:71:13".parse()?;
//!     let connection = bridge.start_connection(addr, 1).await?;
//!
//!     let mut inbound = connection.subscribe();
//!     while let Ok(data) = inbound.recv().await {
//!         println!("Received {} bytes", data.len());
//!     }
//!
//!     bridge.cleanup_connection(&addr).await?;
//!     bridge.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod addr;
pub mod bridge;
pub mod connection;
pub mod error;
pub mod transport;
pub mod utils;

// Re-exports for convenience
pub use addr::BtAddr;
pub use bridge::{BluetoothBridge, MAX_CONNECTIONS};
pub use connection::{CallbackHandle, Connection, ConnectionEvent, ConnectionState};
pub use error::{Error, Result};
pub use transport::{Transport, TransportLink, MAX_CHANNEL, MIN_CHANNEL};

// Re-export commonly used transport implementations
pub use transport::ble::BleTransport;
pub use transport::mock::MockTransport;
