//! BLE Service and Characteristic UUIDs.
//!
//! The BLE transport speaks a Nordic-UART-style scheme: one vendor service,
//! with one notify characteristic per channel derived from the vendor base
//! UUID. The channel number occupies the short-id word of the
//! characteristic UUID, offset by `0x0100`.

use uuid::Uuid;

/// Vendor base UUID with a zeroed short-id word (`6e40xxxx-...`).
const VENDOR_BASE: u128 = 0x6e40_0000_b5a3_f393_e0a9_e50e24dcca9e;

/// Bridge data service UUID.
pub const BRIDGE_SERVICE_UUID: Uuid = Uuid::from_u128(VENDOR_BASE | (0x0001_u128 << 96));

/// Notify characteristic UUID for a given channel.
///
/// Channel `n` maps to short id `0x0100 + n`, so channel 1 is
/// `6e400101-b5a3-f393-e0a9-e50e24dcca9e`.
pub fn channel_data_uuid(channel: u8) -> Uuid {
    Uuid::from_u128(VENDOR_BASE | ((0x0100 + channel as u128) << 96))
}
