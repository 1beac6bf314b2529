//! Application configuration management.
//!
//! Handles loading and validating flora2influx configuration including:
//! - InfluxDB connection and measurement name
//! - Discovery and collection timing
//! - Per-device alias and ignore settings
//!
//! Sources are layered: built-in defaults, then the TOML file, then
//! environment variables such as `FLORA__COLLECTION__INTERVAL=5m`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DeviceConfigMap;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "FLORA";

/// Lower bound for the discovery and collection intervals.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

/// Lower bound for the discovery cooldown.
pub const MIN_DISCOVERY_COOLDOWN: Duration = Duration::from_secs(1);

/// Lower bound for the discovery scan duration.
pub const MIN_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

static MAC_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").expect("MAC address regex is valid")
});

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// No configuration directory could be determined for this platform.
    #[error("Cannot determine configuration directory")]
    NoConfigDirectory,

    /// The sources could not be parsed into [`Settings`].
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[source] config::ConfigError),

    /// The settings could not be rendered as TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single value is out of bounds.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted path of the offending value.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// More than one value is out of bounds.
    #[error("{} configuration errors: {}", .0.len(), join_errors(.0))]
    MultipleValidationErrors(Vec<ConfigError>),
}

fn join_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Main application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// InfluxDB connection.
    pub influx: InfluxConfig,

    /// Discovery and polling timing.
    pub collection: CollectionConfig,

    /// Per-device settings keyed by MAC address.
    pub devices: DeviceConfigMap,
}

/// InfluxDB connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxConfig {
    /// Base URL the InfluxDB instance listens at.
    pub addr: String,

    /// Optional user name for authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Optional password for authentication.
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Database to write into. It has to exist.
    pub database: String,

    /// Measurement name of every point.
    pub measurement: String,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            addr: "http://localhost:8086".into(),
            username: None,
            password: None,
            database: "flora".into(),
            measurement: "PlantSensors".into(),
        }
    }
}

/// Timing of discovery and polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Interval between two device discoveries.
    #[serde(with = "duration_serde")]
    pub discovery_interval: Duration,

    /// How long a discovery scan runs.
    #[serde(with = "duration_serde")]
    pub discovery_timeout: Duration,

    /// Wait after a failed discovery before retrying.
    #[serde(with = "duration_serde")]
    pub discovery_cooldown: Duration,

    /// Interval at which readings are fetched from the roster.
    #[serde(with = "duration_serde")]
    pub interval: Duration,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(60 * 60),
            discovery_timeout: Duration::from_secs(10),
            discovery_cooldown: Duration::from_secs(30),
            interval: Duration::from_secs(60),
        }
    }
}

impl CollectionConfig {
    /// Check every bound, returning one error per violation.
    #[must_use]
    pub fn violations(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let fmt = |d: Duration| humantime::format_duration(d).to_string();

        if self.discovery_interval < MIN_INTERVAL {
            errors.push(invalid(
                "collection.discovery_interval",
                format!(
                    "{} is too low, use an interval of at least one minute",
                    fmt(self.discovery_interval)
                ),
            ));
        }
        if self.interval < MIN_INTERVAL {
            errors.push(invalid(
                "collection.interval",
                format!(
                    "{} is too low, use an interval of at least one minute",
                    fmt(self.interval)
                ),
            ));
        }
        if self.interval > self.discovery_interval {
            errors.push(invalid(
                "collection.interval",
                format!(
                    "{} is greater than the discovery interval of {}",
                    fmt(self.interval),
                    fmt(self.discovery_interval)
                ),
            ));
        }
        if self.discovery_cooldown < MIN_DISCOVERY_COOLDOWN {
            errors.push(invalid(
                "collection.discovery_cooldown",
                format!(
                    "{} is too low, use a cooldown of at least one second",
                    fmt(self.discovery_cooldown)
                ),
            ));
        }
        if self.discovery_timeout < MIN_DISCOVERY_TIMEOUT {
            errors.push(invalid(
                "collection.discovery_timeout",
                format!(
                    "{} is too low, use a timeout of at least five seconds",
                    fmt(self.discovery_timeout)
                ),
            ));
        }

        errors
    }
}

impl Settings {
    /// Load configuration from `path`, apply environment overrides and
    /// validate the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, cannot be parsed or holds
    /// values outside their bounds.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let defaults = config::Config::try_from(&Self::default()).map_err(ConfigError::ParseError)?;
        let settings: Self = config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(ConfigError::ParseError)?;

        let settings = settings.normalized();
        settings.validate()?;
        Ok(settings)
    }

    /// Get the default configuration file path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDirectory`] if the platform has no
    /// configuration directory.
    pub fn default_path() -> ConfigResult<PathBuf> {
        // On the collector host: /etc/flora2influx/flora2influx.toml
        // For development: ~/.config/flora2influx/flora2influx.toml
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/flora2influx/flora2influx.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            let dirs = directories::ProjectDirs::from("", "", "flora2influx")
                .ok_or(ConfigError::NoConfigDirectory)?;
            Ok(dirs.config_dir().join("flora2influx.toml"))
        }
    }

    /// Render the settings as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::SerializeError`] if rendering fails.
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every value, returning all violations at once.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a single violation and
    /// [`ConfigError::MultipleValidationErrors`] for several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = self.collection.violations();

        match url::Url::parse(&self.influx.addr) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(invalid(
                "influx.addr",
                format!("unsupported scheme '{}', use http or https", url.scheme()),
            )),
            Err(e) => errors.push(invalid("influx.addr", format!("invalid URL: {e}"))),
        }
        if self.influx.database.trim().is_empty() {
            errors.push(invalid("influx.database", "must not be empty"));
        }
        if self.influx.measurement.trim().is_empty() {
            errors.push(invalid("influx.measurement", "must not be empty"));
        }

        let mut addresses: Vec<&String> = self.devices.keys().collect();
        addresses.sort();
        for address in addresses {
            if !is_valid_mac_address(address) {
                errors.push(invalid(
                    &format!("devices.{address}"),
                    "not a MAC address (expected XX:XX:XX:XX:XX:XX)",
                ));
            }
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    fn normalized(mut self) -> Self {
        self.devices = self
            .devices
            .into_iter()
            .map(|(address, config)| (address.trim().to_ascii_uppercase(), config))
            .collect();
        self
    }
}

/// Whether `address` looks like `AA:BB:CC:DD:EE:FF`.
#[must_use]
pub fn is_valid_mac_address(address: &str) -> bool {
    MAC_ADDRESS_RE.is_match(address)
}

mod duration_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
