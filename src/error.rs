//! Error types for the bt-bridge crate.

use thiserror::Error;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// The given device address could not be parsed.
    #[error("Invalid Bluetooth address: {address}")]
    InvalidAddress {
        /// The string that failed to parse.
        address: String,
    },

    /// The channel number is outside the supported range.
    #[error("Invalid channel: {channel} (expected 1..=30)")]
    InvalidChannel {
        /// The channel number that was rejected.
        channel: u8,
    },

    /// No peer with the given address was found.
    #[error("Device not found: {address}")]
    DeviceNotFound {
        /// The address that was searched for.
        address: String,
    },

    /// Failed to establish a connection to the peer.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// No connection exists for the given address.
    #[error("No connection for address: {address}")]
    ConnectionNotFound {
        /// The address that has no registered connection.
        address: String,
    },

    /// A connection to this peer already exists on a different channel.
    #[error("Peer {address} already connected on channel {channel}")]
    AlreadyConnected {
        /// The address of the connected peer.
        address: String,
        /// The channel the existing connection uses.
        channel: u8,
    },

    /// The maximum number of concurrent connections has been reached.
    #[error("Maximum connections ({max}) already established")]
    MaxConnectionsReached {
        /// The maximum number of connections allowed.
        max: usize,
    },

    /// Characteristic not found on the peer device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID of the characteristic that was not found.
        uuid: String,
    },

    /// An operation did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// The bridge has been stopped and accepts no new connections.
    #[error("Bridge has been stopped")]
    Stopped,
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidChannel { channel: 0 };
        assert_eq!(err.to_string(), "Invalid channel: 0 (expected 1..=30)");

        let err = Error::ConnectionNotFound {
            address: "AA:BB:CC:DD:EE:FF".to_string(),
        };
        assert!(err.to_string().contains("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn test_timeout_is_distinct_from_connection_failure() {
        assert_eq!(Error::Timeout.to_string(), "Operation timed out");
        assert!(!matches!(Error::Timeout, Error::ConnectionFailed { .. }));
    }
}
