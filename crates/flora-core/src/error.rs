//! Unified error types for the flora core library.
//!
//! Each module keeps its own error type ([`ConfigError`](crate::config::ConfigError),
//! [`TransportError`](crate::transport::TransportError),
//! [`SessionError`](crate::session::SessionError),
//! [`DiscoveryError`](crate::discovery::DiscoveryError),
//! [`SinkError`](crate::sink::SinkError)). [`FloraError`] folds them into one
//! type with stable error codes, which is what the collector logs.
//!
//! # Example
//!
//! ```rust
//! use flora_core::config::ConfigError;
//! use flora_core::error::FloraError;
//!
//! let err = FloraError::from(ConfigError::NotFound("/etc/flora2influx/flora2influx.toml".into()));
//! assert_eq!(err.error_code(), "CONFIG_NOT_FOUND");
//! assert!(!err.is_recoverable());
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// The unified error type for all flora operations.
#[derive(Debug, Error)]
pub enum FloraError {
    // =========================================================================
    // BLUETOOTH ERRORS
    // =========================================================================
    /// The Bluetooth adapter could not be opened or powered on.
    #[error("Bluetooth adapter unavailable: {0}. Run 'bluetoothctl power on' and check that bluetoothd is running.")]
    BluetoothAdapterUnavailable(String),

    /// A discovery scan failed.
    #[error("Bluetooth scan failed: {0}")]
    BluetoothScanFailed(String),

    /// A Bluetooth call outside of a device session failed.
    #[error("Bluetooth operation failed: {0}")]
    BluetoothOperationFailed(String),

    // =========================================================================
    // DEVICE ERRORS
    // =========================================================================
    /// No connection to the device could be established.
    #[error("Device {device} unreachable: {message}. Ensure the sensor is within range.")]
    DeviceUnreachable {
        /// MAC address of the device.
        device: String,
        /// Details from the transport.
        message: String,
    },

    /// The device connected but a later call failed.
    #[error("Communication with device {device} failed: {message}")]
    DeviceCommunicationFailed {
        /// MAC address of the device.
        device: String,
        /// Details from the transport.
        message: String,
    },

    /// The device returned a payload that could not be decoded.
    #[error("Device {device} returned a malformed payload: {message}")]
    MalformedPayload {
        /// MAC address of the device.
        device: String,
        /// Decoder message.
        message: String,
    },

    /// The device lacks a characteristic the protocol needs.
    #[error("Device {device} is missing the {characteristic} characteristic")]
    MissingCharacteristic {
        /// MAC address of the device.
        device: String,
        /// Name and handle of the characteristic.
        characteristic: String,
    },

    // =========================================================================
    // SINK ERRORS
    // =========================================================================
    /// The time-series store could not be reached.
    #[error("Time-series store unavailable: {0}")]
    SinkUnavailable(String),

    /// The time-series store refused the write.
    #[error("Time-series store rejected the write with HTTP {status}: {message}")]
    SinkRejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// The sink was used after shutdown.
    #[error("Time-series store connection is closed")]
    SinkClosed,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================
    /// The configuration file was not found at the expected path.
    #[error("Configuration file not found at: {}", .0.display())]
    ConfigNotFound(PathBuf),

    /// The configuration file exists but could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// The configuration was parsed but contains invalid values.
    #[error("Configuration validation failed: {0}")]
    ConfigValidationError(String),
}

impl FloraError {
    /// Returns `true` if this error is likely to clear up on the next
    /// attempt without user intervention.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BluetoothScanFailed(_)
            | Self::BluetoothOperationFailed(_)
            | Self::DeviceUnreachable { .. }
            | Self::DeviceCommunicationFailed { .. }
            | Self::MalformedPayload { .. }
            | Self::SinkUnavailable(_) => true,
            Self::SinkRejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns a machine-readable error code for log records.
    #[inline]
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::BluetoothAdapterUnavailable(_) => "BLUETOOTH_ADAPTER_UNAVAILABLE",
            Self::BluetoothScanFailed(_) => "BLUETOOTH_SCAN_FAILED",
            Self::BluetoothOperationFailed(_) => "BLUETOOTH_OPERATION_FAILED",
            Self::DeviceUnreachable { .. } => "DEVICE_UNREACHABLE",
            Self::DeviceCommunicationFailed { .. } => "DEVICE_COMMUNICATION_FAILED",
            Self::MalformedPayload { .. } => "MALFORMED_PAYLOAD",
            Self::MissingCharacteristic { .. } => "MISSING_CHARACTERISTIC",
            Self::SinkUnavailable(_) => "SINK_UNAVAILABLE",
            Self::SinkRejected { .. } => "SINK_REJECTED",
            Self::SinkClosed => "SINK_CLOSED",
            Self::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            Self::ConfigParseError(_) => "CONFIG_PARSE_ERROR",
            Self::ConfigValidationError(_) => "CONFIG_VALIDATION_ERROR",
        }
    }
}

// =============================================================================
// CONVERSIONS FROM MODULE-SPECIFIC ERRORS
// =============================================================================

impl From<crate::config::ConfigError> for FloraError {
    fn from(err: crate::config::ConfigError) -> Self {
        use crate::config::ConfigError;
        match err {
            ConfigError::NotFound(path) => Self::ConfigNotFound(path.into()),
            ConfigError::NoConfigDirectory => Self::ConfigNotFound(PathBuf::new()),
            ConfigError::ParseError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::SerializeError(e) => Self::ConfigParseError(e.to_string()),
            ConfigError::ValidationError { field, message } => {
                Self::ConfigValidationError(format!("{field}: {message}"))
            }
            ConfigError::MultipleValidationErrors(errors) => {
                let messages: Vec<String> = errors.into_iter().map(|e| e.to_string()).collect();
                Self::ConfigValidationError(messages.join("; "))
            }
        }
    }
}

impl From<crate::transport::TransportError> for FloraError {
    fn from(err: crate::transport::TransportError) -> Self {
        use crate::transport::TransportError;
        match err {
            TransportError::AdapterUnavailable { message } => {
                Self::BluetoothAdapterUnavailable(message)
            }
            TransportError::ScanFailed { message } => Self::BluetoothScanFailed(message),
            TransportError::ConnectFailed { address, message } => Self::DeviceUnreachable {
                device: address,
                message,
            },
            other => Self::BluetoothOperationFailed(other.to_string()),
        }
    }
}

impl From<crate::discovery::DiscoveryError> for FloraError {
    fn from(err: crate::discovery::DiscoveryError) -> Self {
        use crate::discovery::DiscoveryError;
        match err {
            DiscoveryError::Scan(source) => source.into(),
        }
    }
}

impl From<crate::session::SessionError> for FloraError {
    fn from(err: crate::session::SessionError) -> Self {
        use crate::session::{SessionErrorKind, SessionStage};
        let device = err.device.address().to_string();
        match err.kind {
            SessionErrorKind::Transport {
                stage: SessionStage::Connecting,
                source,
            } => Self::DeviceUnreachable {
                device,
                message: source.to_string(),
            },
            SessionErrorKind::Transport { stage, source } => Self::DeviceCommunicationFailed {
                device,
                message: format!("{stage}: {source}"),
            },
            SessionErrorKind::MalformedPayload(e) => Self::MalformedPayload {
                device,
                message: e.to_string(),
            },
            SessionErrorKind::MissingCharacteristic(characteristic) => {
                Self::MissingCharacteristic {
                    device,
                    characteristic: characteristic.to_string(),
                }
            }
        }
    }
}

impl From<crate::sink::SinkError> for FloraError {
    fn from(err: crate::sink::SinkError) -> Self {
        use crate::sink::SinkError;
        match err {
            SinkError::Request { message } => Self::SinkUnavailable(message),
            SinkError::Rejected { status, body } => Self::SinkRejected {
                status,
                message: body,
            },
            SinkError::Closed => Self::SinkClosed,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
