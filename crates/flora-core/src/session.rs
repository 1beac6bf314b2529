//! Per-device GATT session.
//!
//! A [`Device`] is the handle a roster keeps for every discovered sensor.
//! [`Device::fetch_readings`] runs one complete session against it:
//!
//! ```text
//! Idle -> Connecting -> AttributeDiscovery -> FirmwareRead
//!      -> [RealtimeModeArm] -> SensorRead -> Disconnecting -> Done
//! ```
//!
//! Any failure after the connection is up still goes through
//! `Disconnecting`, so the radio link is never left open.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::protocol::{
    self, ProtocolError, HANDLE_FIRMWARE_BATTERY, HANDLE_REALTIME_MODE, HANDLE_SENSOR_READINGS,
    REALTIME_MODE_COMMAND, SENSOR_SERVICE_UUID,
};
use crate::transport::{Attribute, Transport, TransportError};
use crate::types::{DeviceIdentity, Readings};

/// Session stage a transport failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    /// Opening the connection.
    Connecting,
    /// Listing services and characteristics.
    AttributeDiscovery,
    /// Reading the firmware/battery characteristic.
    FirmwareRead,
    /// Writing the realtime mode command.
    RealtimeModeArm,
    /// Reading the sensor characteristic.
    SensorRead,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            Self::Connecting => "connecting",
            Self::AttributeDiscovery => "attribute discovery",
            Self::FirmwareRead => "firmware read",
            Self::RealtimeModeArm => "realtime mode arm",
            Self::SensorRead => "sensor read",
        };
        f.write_str(stage)
    }
}

/// A characteristic the session depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredCharacteristic {
    /// Firmware version and battery level.
    FirmwareBattery,
    /// Realtime mode switch.
    RealtimeMode,
    /// Sensor readings.
    SensorReadings,
}

impl RequiredCharacteristic {
    /// Value handle the characteristic is expected at.
    #[must_use]
    pub const fn handle(self) -> u16 {
        match self {
            Self::FirmwareBattery => HANDLE_FIRMWARE_BATTERY,
            Self::RealtimeMode => HANDLE_REALTIME_MODE,
            Self::SensorReadings => HANDLE_SENSOR_READINGS,
        }
    }
}

impl fmt::Display for RequiredCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FirmwareBattery => "firmware and battery",
            Self::RealtimeMode => "realtime mode switch",
            Self::SensorReadings => "sensor readings",
        };
        write!(f, "{name} (0x{:02x})", self.handle())
    }
}

/// What went wrong during a session.
#[derive(Debug, Error)]
pub enum SessionErrorKind {
    /// The Bluetooth stack reported an error.
    #[error("transport error during {stage}: {source}")]
    Transport {
        /// Stage that failed.
        stage: SessionStage,
        /// Underlying error.
        #[source]
        source: TransportError,
    },

    /// A characteristic returned a payload that could not be decoded.
    #[error(transparent)]
    MalformedPayload(#[from] ProtocolError),

    /// A characteristic the protocol needs is not present.
    #[error("{0} characteristic not found on device")]
    MissingCharacteristic(RequiredCharacteristic),
}

/// A failed session, attributed to the device it ran against.
#[derive(Debug, Error)]
#[error("Device {device}: {kind}")]
pub struct SessionError {
    /// The device the session ran against.
    pub device: DeviceIdentity,
    /// Configured alias of the device, if any.
    pub alias: Option<String>,
    /// The failure.
    #[source]
    pub kind: SessionErrorKind,
}

impl SessionError {
    /// Whether the failure is a missing characteristic.
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(self.kind, SessionErrorKind::MissingCharacteristic(_))
    }
}

/// The sensor-service characteristics found during attribute discovery.
#[derive(Debug, Default)]
struct SensorCharacteristics {
    firmware: Option<Attribute>,
    realtime: Option<Attribute>,
    readings: Option<Attribute>,
}

impl SensorCharacteristics {
    fn locate(attributes: &[Attribute]) -> Self {
        let mut found = Self::default();
        for attribute in attributes
            .iter()
            .filter(|a| a.service == SENSOR_SERVICE_UUID)
        {
            match attribute.handle {
                HANDLE_REALTIME_MODE => {
                    debug!(handle = attribute.handle, "Found realtime data switch characteristic");
                    found.realtime = Some(*attribute);
                }
                HANDLE_SENSOR_READINGS => {
                    debug!(handle = attribute.handle, "Found sensor reading characteristic");
                    found.readings = Some(*attribute);
                }
                HANDLE_FIRMWARE_BATTERY => {
                    debug!(handle = attribute.handle, "Found firmware and battery characteristic");
                    found.firmware = Some(*attribute);
                }
                _ => {}
            }
        }
        found
    }
}

/// A discovered sensor and the transport used to reach it.
pub struct Device<T: Transport> {
    identity: DeviceIdentity,
    alias: Option<String>,
    transport: Arc<T>,
}

impl<T: Transport> fmt::Debug for Device<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("identity", &self.identity)
            .field("alias", &self.alias)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Device<T> {
    /// Create a session handle for `identity`.
    pub fn new(identity: DeviceIdentity, alias: Option<String>, transport: Arc<T>) -> Self {
        Self {
            identity,
            alias: alias.filter(|alias| !alias.is_empty()),
            transport,
        }
    }

    /// The identity the device advertised.
    #[must_use]
    pub const fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Configured alias, if any.
    #[must_use]
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Alias if configured, otherwise the MAC address.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.alias().unwrap_or_else(|| self.identity.address())
    }

    /// Connect to the device, read firmware and sensor data, disconnect.
    ///
    /// # Errors
    ///
    /// Returns a [`SessionError`] naming this device if any transport call
    /// fails, a payload is malformed or a required characteristic is
    /// missing. Nothing is retried within the session.
    #[instrument(
        name = "fetch_readings",
        skip_all,
        fields(device = %self.identity, alias = self.alias.as_deref())
    )]
    pub async fn fetch_readings(&self) -> Result<Readings, SessionError> {
        info!("Fetching readings from device");

        let mut connection = self
            .transport
            .connect(&self.identity)
            .await
            .map_err(|source| self.transport_error(SessionStage::Connecting, source))?;
        debug!("Connection to device established");

        let result = self.read_connected(&mut connection).await;

        match self.transport.disconnect(connection).await {
            Ok(()) => debug!("Disconnected from device"),
            Err(err) => warn!(error = %err, "Failed to disconnect from device"),
        }

        result
    }

    async fn read_connected(&self, connection: &mut T::Connection) -> Result<Readings, SessionError> {
        let attributes = self
            .transport
            .discover_attributes(connection)
            .await
            .map_err(|source| self.transport_error(SessionStage::AttributeDiscovery, source))?;

        let characteristics = SensorCharacteristics::locate(&attributes);
        let firmware_attr = characteristics
            .firmware
            .ok_or_else(|| self.missing(RequiredCharacteristic::FirmwareBattery))?;
        let readings_attr = characteristics
            .readings
            .ok_or_else(|| self.missing(RequiredCharacteristic::SensorReadings))?;

        let data = self
            .transport
            .read_attribute(connection, &firmware_attr)
            .await
            .map_err(|source| self.transport_error(SessionStage::FirmwareRead, source))?;
        let firmware = protocol::decode_firmware_battery(&data).map_err(|e| self.malformed(e))?;
        debug!(
            version = %firmware.firmware_version,
            battery = firmware.battery_level,
            "Read firmware and battery data"
        );

        if protocol::requires_realtime_mode(&firmware.firmware_version) {
            let realtime_attr = characteristics
                .realtime
                .ok_or_else(|| self.missing(RequiredCharacteristic::RealtimeMode))?;
            self.transport
                .write_attribute(connection, &realtime_attr, &REALTIME_MODE_COMMAND)
                .await
                .map_err(|source| self.transport_error(SessionStage::RealtimeModeArm, source))?;
            debug!("Realtime data reading enabled on device");
        }

        let data = self
            .transport
            .read_attribute(connection, &readings_attr)
            .await
            .map_err(|source| self.transport_error(SessionStage::SensorRead, source))?;
        let sensor = protocol::decode_sensor_data(&data).map_err(|e| self.malformed(e))?;

        Ok(Readings {
            firmware_version: firmware.firmware_version,
            battery_level: firmware.battery_level,
            temperature: sensor.temperature,
            moisture: sensor.moisture,
            light: sensor.light,
            conductivity: sensor.conductivity,
        })
    }

    fn error(&self, kind: SessionErrorKind) -> SessionError {
        SessionError {
            device: self.identity.clone(),
            alias: self.alias.clone(),
            kind,
        }
    }

    fn transport_error(&self, stage: SessionStage, source: TransportError) -> SessionError {
        self.error(SessionErrorKind::Transport { stage, source })
    }

    fn malformed(&self, err: ProtocolError) -> SessionError {
        self.error(SessionErrorKind::MalformedPayload(err))
    }

    fn missing(&self, characteristic: RequiredCharacteristic) -> SessionError {
        warn!(%characteristic, "Required characteristic missing, aborting query");
        self.error(SessionErrorKind::MissingCharacteristic(characteristic))
    }
}
