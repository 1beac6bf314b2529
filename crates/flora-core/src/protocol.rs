//! Mi Flora GATT protocol constants and payload decoding.
//!
//! The sensor exposes three characteristics inside one vendor service:
//!
//! ```text
//! 0x33 : realtime mode switch  (write 0xA0 0x1F to arm live readings)
//! 0x35 : sensor readings       (TT TT ?? LL LL ?? ?? MM CC CC ...)
//! 0x38 : firmware and battery  (BB ?? V V V V V ...)
//! ```
//!
//! Decoding is kept free of I/O so it can be tested against literal byte
//! fixtures.

use thiserror::Error;
use uuid::Uuid;

/// Advertised names a Mi Flora sensor is known to use.
pub const SENSOR_NAMES: &[&str] = &["Flower care", "Flower mate"];

/// The vendor service that holds all three characteristics.
pub const SENSOR_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1204_0000_1000_8000_0080_5f9b_34fb);

/// Value handle of the realtime mode switch characteristic.
pub const HANDLE_REALTIME_MODE: u16 = 0x33;

/// Value handle of the sensor readings characteristic.
pub const HANDLE_SENSOR_READINGS: u16 = 0x35;

/// Value handle of the firmware and battery characteristic.
pub const HANDLE_FIRMWARE_BATTERY: u16 = 0x38;

/// Command that arms realtime mode. Without it newer firmware keeps
/// returning a stale cached value from the readings characteristic.
///
/// Some clients write `a0 af` here although their own notes say `a0 1f`;
/// `a0 1f` is what the sensor expects.
pub const REALTIME_MODE_COMMAND: [u8; 2] = [0xa0, 0x1f];

/// Newest firmware that still serves live readings without realtime mode.
pub const REALTIME_MODE_THRESHOLD: &str = "2.6.6";

/// Minimum length of a firmware/battery payload.
pub const FIRMWARE_PAYLOAD_MIN_LEN: usize = 2;

/// Minimum length of a sensor readings payload.
pub const SENSOR_PAYLOAD_MIN_LEN: usize = 10;

/// Result type for payload decoding.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Which characteristic a payload was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Firmware version and battery level.
    FirmwareBattery,
    /// Temperature, light, moisture and conductivity.
    SensorReadings,
}

impl std::fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirmwareBattery => f.write_str("firmware/battery"),
            Self::SensorReadings => f.write_str("sensor readings"),
        }
    }
}

/// Errors produced while decoding characteristic payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The payload is shorter than its fixed layout.
    #[error("Malformed {kind} payload: expected at least {expected} bytes, got {actual}")]
    MalformedPayload {
        /// Characteristic the payload came from.
        kind: PayloadKind,
        /// Minimum length of the layout.
        expected: usize,
        /// Length actually received.
        actual: usize,
    },
}

/// Decoded firmware/battery characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareInfo {
    /// Battery level in percent.
    pub battery_level: u8,
    /// Firmware version string, e.g. `"3.2.1"`.
    pub firmware_version: String,
}

/// Decoded sensor readings characteristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorData {
    /// Temperature in °C.
    pub temperature: f64,
    /// Light intensity in lux.
    pub light: u16,
    /// Soil moisture in percent.
    pub moisture: u8,
    /// Soil conductivity in µS/cm.
    pub conductivity: u16,
}

/// Decode the firmware/battery characteristic.
///
/// Byte 0 is the battery level, byte 1 is unused and the remainder is the
/// version string.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if fewer than two bytes were
/// read.
pub fn decode_firmware_battery(data: &[u8]) -> ProtocolResult<FirmwareInfo> {
    let &[battery_level, _, ref version @ ..] = data else {
        return Err(ProtocolError::MalformedPayload {
            kind: PayloadKind::FirmwareBattery,
            expected: FIRMWARE_PAYLOAD_MIN_LEN,
            actual: data.len(),
        });
    };

    let firmware_version = String::from_utf8_lossy(version)
        .trim_end_matches('\0')
        .to_string();

    Ok(FirmwareInfo {
        battery_level,
        firmware_version,
    })
}

/// Decode the sensor readings characteristic.
///
/// Layout (little endian), trailing bytes beyond the tenth are ignored:
///
/// ```text
/// [0-1] : temperature, i16, 0.1 °C
/// [2]   : reserved
/// [3-4] : light, u16, lux
/// [5-6] : reserved
/// [7]   : moisture, u8, %
/// [8-9] : conductivity, u16, µS/cm
/// ```
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if fewer than ten bytes were
/// read.
pub fn decode_sensor_data(data: &[u8]) -> ProtocolResult<SensorData> {
    let &[t0, t1, _, l0, l1, _, _, moisture, c0, c1, ..] = data else {
        return Err(ProtocolError::MalformedPayload {
            kind: PayloadKind::SensorReadings,
            expected: SENSOR_PAYLOAD_MIN_LEN,
            actual: data.len(),
        });
    };

    Ok(SensorData {
        temperature: f64::from(i16::from_le_bytes([t0, t1])) / 10.0,
        light: u16::from_le_bytes([l0, l1]),
        moisture,
        conductivity: u16::from_le_bytes([c0, c1]),
    })
}

/// Whether `firmware_version` needs realtime mode armed before the readings
/// characteristic returns live data.
///
/// The comparison is a plain string comparison, so `"2.10.0"` sorts below
/// `"2.6.6"`. Released firmware so far has single-digit components.
#[must_use]
pub fn requires_realtime_mode(firmware_version: &str) -> bool {
    firmware_version > REALTIME_MODE_THRESHOLD
}

/// Whether an advertised name belongs to a supported sensor.
#[must_use]
pub fn is_sensor_name(name: &str) -> bool {
    SENSOR_NAMES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_sensor_data(data: &SensorData) -> [u8; 10] {
        #[allow(clippy::cast_possible_truncation)]
        let temp = (data.temperature * 10.0).round() as i16;
        let [t0, t1] = temp.to_le_bytes();
        let [l0, l1] = data.light.to_le_bytes();
        let [c0, c1] = data.conductivity.to_le_bytes();
        [t0, t1, 0, l0, l1, 0, 0, data.moisture, c0, c1]
    }

    #[test]
    fn test_decode_firmware_battery_example() {
        let info = decode_firmware_battery(&[64, 0, 0x32, 0x2E, 0x36, 0x2E, 0x36]).unwrap();
        assert_eq!(info.battery_level, 64);
        assert_eq!(info.firmware_version, "2.6.6");
        assert!(!requires_realtime_mode(&info.firmware_version));
    }

    #[test]
    fn test_decode_firmware_battery_only_battery() {
        let info = decode_firmware_battery(&[100, 0x2b]).unwrap();
        assert_eq!(info.battery_level, 100);
        assert_eq!(info.firmware_version, "");
    }

    #[test]
    fn test_decode_firmware_battery_trims_nul_padding() {
        let info = decode_firmware_battery(b"\x63\x10\x33\x2e\x32\x2e\x31\x00\x00").unwrap();
        assert_eq!(info.battery_level, 99);
        assert_eq!(info.firmware_version, "3.2.1");
    }

    #[test]
    fn test_decode_firmware_battery_too_short() {
        for len in 0..FIRMWARE_PAYLOAD_MIN_LEN {
            let err = decode_firmware_battery(&vec![0x42; len]).unwrap_err();
            assert_eq!(
                err,
                ProtocolError::MalformedPayload {
                    kind: PayloadKind::FirmwareBattery,
                    expected: 2,
                    actual: len,
                }
            );
        }
    }

    #[test]
    fn test_decode_sensor_data_example() {
        let data = decode_sensor_data(&[0xCE, 0x00, 0x00, 0x90, 0x01, 0x00, 0x00, 0x28, 0xE8, 0x00])
            .unwrap();
        assert!((data.temperature - 20.6).abs() < f64::EPSILON);
        assert_eq!(data.light, 400);
        assert_eq!(data.moisture, 40);
        assert_eq!(data.conductivity, 232);
    }

    #[test]
    fn test_decode_sensor_data_negative_temperature() {
        // -5.3 °C
        let [t0, t1] = (-53i16).to_le_bytes();
        let data = decode_sensor_data(&[t0, t1, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        assert!((data.temperature + 5.3).abs() < 1e-9);
    }

    #[test]
    fn test_decode_sensor_data_ignores_trailing_bytes() {
        let mut payload = vec![0xCE, 0x00, 0x00, 0x90, 0x01, 0x00, 0x00, 0x28, 0xE8, 0x00];
        payload.extend_from_slice(&[0x02, 0x3c, 0x00, 0xfb, 0x34, 0x9b]);
        let data = decode_sensor_data(&payload).unwrap();
        assert_eq!(data.conductivity, 232);
    }

    #[test]
    fn test_decode_sensor_data_too_short() {
        for len in 0..SENSOR_PAYLOAD_MIN_LEN {
            let err = decode_sensor_data(&vec![0xff; len]).unwrap_err();
            assert!(matches!(
                err,
                ProtocolError::MalformedPayload {
                    kind: PayloadKind::SensorReadings,
                    expected: 10,
                    actual,
                } if actual == len
            ));
        }
    }

    #[test]
    fn test_decode_sensor_data_reencodes_exactly() {
        let samples = [
            [0x00, 0x80, 0xaa, 0x00, 0x00, 0xbb, 0xcc, 0x00, 0x00, 0x00],
            [0xff, 0x7f, 0x00, 0xff, 0xff, 0x00, 0x00, 0x64, 0xff, 0xff],
            [0x9c, 0xff, 0x00, 0x34, 0x12, 0x00, 0x00, 0x07, 0x21, 0x43],
        ];
        for sample in samples {
            let decoded = decode_sensor_data(&sample).unwrap();
            let mut expected = sample;
            // reserved bytes are not part of the decoded value
            expected[2] = 0;
            expected[5] = 0;
            expected[6] = 0;
            assert_eq!(encode_sensor_data(&decoded), expected);
        }
    }

    #[test]
    fn test_realtime_mode_threshold() {
        assert!(!requires_realtime_mode("2.6.6"));
        assert!(!requires_realtime_mode("2.6.2"));
        assert!(!requires_realtime_mode("2.5.9"));
        assert!(!requires_realtime_mode(""));
        assert!(requires_realtime_mode("2.6.8"));
        assert!(requires_realtime_mode("2.7.0"));
        assert!(requires_realtime_mode("3.2.1"));
    }

    #[test]
    fn test_realtime_mode_comparison_is_lexicographic() {
        assert!(!requires_realtime_mode("2.10.0"));
    }

    #[test]
    fn test_realtime_mode_command_bytes() {
        assert_eq!(REALTIME_MODE_COMMAND, [0xa0, 0x1f]);
        assert_ne!(REALTIME_MODE_COMMAND, [0xa0, 0xaf]);
    }

    #[test]
    fn test_sensor_names() {
        assert!(is_sensor_name("Flower care"));
        assert!(is_sensor_name("Flower mate"));
        assert!(!is_sensor_name("flower care"));
        assert!(!is_sensor_name("iPhone"));
    }

    #[test]
    fn test_service_uuid() {
        assert_eq!(
            SENSOR_SERVICE_UUID.to_string(),
            "00001204-0000-1000-8000-00805f9b34fb"
        );
    }
}
