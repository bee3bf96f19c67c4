//! Transport layer for peer links.
//!
//! The bridge itself is transport-agnostic: it manages connection lifecycle
//! and data fan-out, while a [`Transport`] implementation owns the actual
//! Bluetooth plumbing. The default transport is [`ble::BleTransport`];
//! [`mock::MockTransport`] provides an in-process substitute for tests.

pub mod ble;
pub mod mock;
pub mod uuids;

use async_trait::async_trait;
use bytes::Bytes;

use crate::addr::BtAddr;
use crate::error::Result;

pub use ble::BleTransport;
pub use mock::{MockLink, MockTransport};

/// Lowest valid channel number.
pub const MIN_CHANNEL: u8 = 1;
/// Highest valid channel number (RFCOMM-style numbering).
pub const MAX_CHANNEL: u8 = 30;

/// Check whether a channel number is within the supported range.
pub fn is_valid_channel(channel: u8) -> bool {
    (MIN_CHANNEL..=MAX_CHANNEL).contains(&channel)
}

/// Opens data links to peer devices.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a link to the peer at `addr` on the given channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer cannot be found or the link cannot be
    /// established. Channel numbers are validated by the bridge before this
    /// is called.
    async fn open(&self, addr: BtAddr, channel: u8) -> Result<Box<dyn TransportLink>>;
}

/// An established data link to a single peer.
///
/// Inbound payloads are owned [`Bytes`]; the link hands ownership to the
/// caller and retains no reference to the buffer.
#[async_trait]
pub trait TransportLink: Send + 'static {
    /// Receive the next inbound payload.
    ///
    /// Returns `None` once the link has been closed by the peer; after that
    /// every call returns `None`.
    async fn recv(&mut self) -> Option<Bytes>;

    /// Close the link and release its resources.
    async fn close(self: Box<Self>) -> Result<()>;
}
