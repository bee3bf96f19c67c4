//! Bluetooth device addresses.
//!
//! Peers are identified by their 6-byte device address. `BtAddr` is the
//! key type used throughout the bridge: connections are registered and
//! cleaned up by address.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A 6-byte Bluetooth device address.
///
/// Parses from the conventional colon-separated form (`AA:BB:CC:DD:EE:FF`,
/// case-insensitive; `-` is accepted as a separator too) and displays as
/// uppercase colon-separated hex.
///
/// # Example
///
/// ```
/// use bt_bridge::BtAddr;
///
/// let addr: BtAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
/// assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BtAddr([u8; 6]);

impl BtAddr {
    /// Create an address from raw bytes, most significant byte first.
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Get the raw address bytes, most significant byte first.
    pub const fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BtAddr({})", self)
    }
}

impl FromStr for BtAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress {
            address: s.to_string(),
        };

        let mut bytes = [0u8; 6];
        let mut count = 0;

        for part in s.split(|c| c == ':' || c == '-') {
            // from_str_radix tolerates a leading sign, so require exactly
            // two ASCII hex digits up front.
            if count == 6 || part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            bytes[count] = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
            count += 1;
        }

        if count != 6 {
            return Err(invalid());
        }

        Ok(Self(bytes))
    }
}

impl From<[u8; 6]> for BtAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for BtAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for BtAddr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
