//! Shared domain types.
//!
//! This module contains the value types passed between the discovery,
//! session and scheduling layers: device identities, per-device
//! configuration and decoded sensor readings.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a peripheral as seen in its advertisement.
///
/// The address is normalized to upper case so that it can be matched against
/// configuration keys regardless of how either side spells it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    address: String,
    name: String,
}

impl DeviceIdentity {
    /// Create a new identity from an address and the advertised name.
    pub fn new(address: impl AsRef<str>, name: impl Into<String>) -> Self {
        Self {
            address: address.as_ref().to_ascii_uppercase(),
            name: name.into(),
        }
    }

    /// The MAC address of the peripheral (upper case, colon separated).
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The name the peripheral advertised.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Collection settings for a single sensor, keyed by MAC address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Alias written to the `alias` tag of every measurement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// If set, the device is never added to a roster.
    pub ignore: bool,
}

impl DeviceConfig {
    /// The configured alias, if it is non-empty.
    #[must_use]
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref().filter(|alias| !alias.is_empty())
    }
}

/// Per-device configuration, keyed by upper case MAC address.
pub type DeviceConfigMap = HashMap<String, DeviceConfig>;

/// One complete set of readings fetched from a sensor.
///
/// A value of this type only exists if both characteristics decoded
/// successfully; there is no partially populated form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readings {
    /// Firmware version string reported by the device.
    pub firmware_version: String,

    /// Battery level in percent.
    pub battery_level: u8,

    /// Temperature in °C, one decimal of precision.
    pub temperature: f64,

    /// Soil moisture in percent.
    pub moisture: u8,

    /// Light intensity in lux.
    pub light: u16,

    /// Soil conductivity (fertility) in µS/cm.
    pub conductivity: u16,
}

impl Readings {
    /// Field set as written to the time-series store.
    #[must_use]
    pub fn fields(&self) -> [(&'static str, FieldValue); 5] {
        [
            ("battery", FieldValue::Integer(i64::from(self.battery_level))),
            ("temperature", FieldValue::Float(self.temperature)),
            ("moisture", FieldValue::Integer(i64::from(self.moisture))),
            ("conductivity", FieldValue::Integer(i64::from(self.conductivity))),
            ("light", FieldValue::Integer(i64::from(self.light))),
        ]
    }
}

impl fmt::Display for Readings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ battery {}% | {:.1}°C | moisture {}% | {} lux | {} µS/cm | v{} ]",
            self.battery_level,
            self.temperature,
            self.moisture,
            self.light,
            self.conductivity,
            self.firmware_version,
        )
    }
}

/// A single field value of a measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    /// Signed integer field.
    Integer(i64),
    /// Floating point field.
    Float(f64),
}

/// Tags identifying the device a measurement came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementTags {
    /// MAC address of the device.
    pub mac: String,
    /// Configured alias, if any.
    pub alias: Option<String>,
    /// Firmware version at the time of the reading.
    pub version: String,
}

/// A reading ready to be handed to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Identifying tags.
    pub tags: MeasurementTags,
    /// The decoded readings.
    pub fields: Readings,
    /// When the readings were taken.
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    /// Build a measurement for `identity`, stamped with the current time.
    #[must_use]
    pub fn now(identity: &DeviceIdentity, alias: Option<&str>, readings: Readings) -> Self {
        Self {
            tags: MeasurementTags {
                mac: identity.address().to_string(),
                alias: alias.map(str::to_string),
                version: readings.firmware_version.clone(),
            },
            fields: readings,
            timestamp: Utc::now(),
        }
    }
}
