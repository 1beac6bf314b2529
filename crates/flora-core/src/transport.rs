//! Abstract BLE transport capability.
//!
//! Discovery and device sessions are written against the [`Transport`]
//! trait so that the protocol logic never touches the Bluetooth stack
//! directly. The BlueZ implementation lives in [`crate::bluetooth`]; a
//! scripted in-memory implementation lives in [`crate::mock`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::types::DeviceIdentity;

/// Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A GATT characteristic discovered on a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attribute {
    /// UUID of the service the characteristic belongs to.
    pub service: Uuid,
    /// UUID of the characteristic itself.
    pub uuid: Uuid,
    /// Value handle of the characteristic.
    pub handle: u16,
}

/// Errors raised by the Bluetooth stack.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No usable Bluetooth adapter.
    #[error("Bluetooth adapter unavailable: {message}")]
    AdapterUnavailable {
        /// Details from the Bluetooth stack.
        message: String,
    },

    /// Scanning could not be started or was interrupted.
    #[error("Bluetooth scan failed: {message}")]
    ScanFailed {
        /// Details from the Bluetooth stack.
        message: String,
    },

    /// Connecting to the peripheral failed.
    #[error("Failed to connect to {address}: {message}")]
    ConnectFailed {
        /// Address of the peripheral.
        address: String,
        /// Details from the Bluetooth stack.
        message: String,
    },

    /// Service or characteristic discovery failed.
    #[error("Attribute discovery failed: {message}")]
    DiscoveryFailed {
        /// Details from the Bluetooth stack.
        message: String,
    },

    /// Reading a characteristic failed.
    #[error("Failed to read attribute 0x{handle:02x}: {message}")]
    ReadFailed {
        /// Value handle that was read.
        handle: u16,
        /// Details from the Bluetooth stack.
        message: String,
    },

    /// Writing a characteristic failed.
    #[error("Failed to write attribute 0x{handle:02x}: {message}")]
    WriteFailed {
        /// Value handle that was written.
        handle: u16,
        /// Details from the Bluetooth stack.
        message: String,
    },

    /// The attribute was not part of the last discovery on this connection.
    #[error("Attribute 0x{handle:02x} is unknown on this connection")]
    UnknownAttribute {
        /// Value handle that was requested.
        handle: u16,
    },

    /// Tearing down the connection failed.
    #[error("Failed to disconnect: {message}")]
    DisconnectFailed {
        /// Details from the Bluetooth stack.
        message: String,
    },
}

/// Primitive operations the collector needs from a BLE stack.
///
/// A connection is represented by the implementation's
/// [`Connection`](Transport::Connection) value. It is created by
/// [`connect`](Transport::connect) and consumed by
/// [`disconnect`](Transport::disconnect).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Handle for one open connection to a peripheral.
    type Connection: Send + Sync;

    /// Scan for `duration`, calling `on_advertisement` for every peripheral
    /// that advertises a name.
    ///
    /// The scan always runs for the full duration. An advertisement may be
    /// reported more than once.
    async fn scan(
        &self,
        duration: Duration,
        on_advertisement: &mut (dyn FnMut(DeviceIdentity) + Send),
    ) -> TransportResult<()>;

    /// Open a connection to the peripheral.
    async fn connect(&self, identity: &DeviceIdentity) -> TransportResult<Self::Connection>;

    /// List every characteristic of every service on the peripheral.
    async fn discover_attributes(
        &self,
        connection: &mut Self::Connection,
    ) -> TransportResult<Vec<Attribute>>;

    /// Read the value of a characteristic.
    async fn read_attribute(
        &self,
        connection: &Self::Connection,
        attribute: &Attribute,
    ) -> TransportResult<Vec<u8>>;

    /// Write `value` to a characteristic, waiting for the response.
    async fn write_attribute(
        &self,
        connection: &Self::Connection,
        attribute: &Attribute,
        value: &[u8],
    ) -> TransportResult<()>;

    /// Close the connection.
    async fn disconnect(&self, connection: Self::Connection) -> TransportResult<()>;
}
