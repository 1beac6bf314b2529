//! # flora-core
//!
//! Core collection logic for flora2influx, which reads Xiaomi Mi Flora
//! plant sensors over Bluetooth Low Energy and forwards their readings to a
//! time-series store.
//!
//! This crate provides:
//! - Decoding of the sensor's firmware/battery and readings payloads
//! - A per-device connect, read and disconnect session
//! - Time-boxed discovery of sensors in range
//! - The discovery and polling scheduler
//! - Configuration loading and validation
//!
//! ## Architecture
//!
//! - [`protocol`] - Service UUID, characteristic handles and payload decoders
//! - [`transport`] - The [`Transport`] trait the rest of the crate talks BLE through
//! - [`bluetooth`] - BlueZ-backed transport (feature `bluetooth`)
//! - [`mock`] - Scripted transport for tests and builds without Bluetooth
//! - [`session`] - One read session against one sensor
//! - [`discovery`] - Scanning and roster construction
//! - [`scheduler`] - Rediscovery, polling and shutdown
//! - [`sink`] - The [`Sink`] trait measurements are written to
//! - [`config`] - Settings loading, layering and validation
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared data types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
pub mod config;
pub mod discovery;
pub mod error;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub mod mock;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod sink;
pub mod transport;
pub mod types;

// Re-export primary types for convenience
#[cfg(feature = "bluetooth")]
pub use bluetooth::{BluezConnection, BluezTransport};
pub use config::{
    is_valid_mac_address, CollectionConfig, ConfigError, ConfigResult, InfluxConfig, Settings,
};
pub use discovery::{discover, DiscoveryError, Roster};
pub use error::FloraError;
#[cfg(any(test, feature = "mock-bluetooth", not(feature = "bluetooth")))]
pub use mock::{MockEvent, MockFailure, MockPeripheral, MockTransport};
pub use protocol::{ProtocolError, SENSOR_NAMES, SENSOR_SERVICE_UUID};
pub use scheduler::{poll_roster, PollSummary, Scheduler};
pub use session::{Device, RequiredCharacteristic, SessionError, SessionErrorKind, SessionStage};
pub use sink::{Sink, SinkError};
pub use transport::{Attribute, Transport, TransportError, TransportResult};
pub use types::{
    DeviceConfig, DeviceConfigMap, DeviceIdentity, FieldValue, Measurement, MeasurementTags,
    Readings,
};
