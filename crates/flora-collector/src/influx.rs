//! InfluxDB 1.x sink.
//!
//! Points are written one at a time in line protocol with second precision:
//!
//! ```text
//! PlantSensors,mac=C4:7C:8D:6A:12:34,alias=Ficus,version=3.2.1 battery=87i,temperature=20.6,moisture=40i,conductivity=232i,light=400i 1700000000
//! ```

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flora_core::{FieldValue, InfluxConfig, Measurement, Sink, SinkError};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while setting up the sink.
#[derive(Debug, Error)]
pub enum InfluxError {
    /// The configured address is not a usable base URL.
    #[error("Invalid InfluxDB address '{addr}'")]
    InvalidAddress {
        /// The configured address.
        addr: String,
    },

    /// The HTTP client could not be built.
    #[error("Failed to create HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Writes measurements to an InfluxDB database over HTTP.
#[derive(Debug)]
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: Url,
    measurement: String,
    username: Option<String>,
    password: Option<String>,
    closed: AtomicBool,
}

impl InfluxSink {
    /// Create a sink for the configured database.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` is not an HTTP base URL or the client
    /// cannot be built.
    pub fn new(config: &InfluxConfig) -> Result<Self, InfluxError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            write_url: write_url(&config.addr, &config.database)?,
            measurement: config.measurement.clone(),
            username: config.username.clone().filter(|u| !u.is_empty()),
            password: config.password.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// The URL points are posted to.
    #[must_use]
    pub const fn write_url(&self) -> &Url {
        &self.write_url
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write(&self, measurement: &Measurement) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }

        let mut request = self
            .client
            .post(self.write_url.clone())
            .body(line_protocol(&self.measurement, measurement));
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request.send().await.map_err(|e| SinkError::Request {
            message: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(mac = %measurement.tags.mac, "Measurement written");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closed InfluxDB client");
        }
    }
}

fn write_url(addr: &str, database: &str) -> Result<Url, InfluxError> {
    let invalid = || InfluxError::InvalidAddress {
        addr: addr.to_string(),
    };

    let mut url = Url::parse(addr).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid());
    }
    url.path_segments_mut()
        .map_err(|()| invalid())?
        .pop_if_empty()
        .push("write");
    url.query_pairs_mut()
        .append_pair("db", database)
        .append_pair("precision", "s");
    Ok(url)
}

/// Render one point in line protocol.
#[must_use]
pub fn line_protocol(measurement_name: &str, measurement: &Measurement) -> String {
    let mut line = escape(measurement_name, &[',', ' ']);

    let tags = &measurement.tags;
    let _ = write!(line, ",mac={}", escape_tag(&tags.mac));
    if let Some(alias) = tags.alias.as_deref().filter(|a| !a.is_empty()) {
        let _ = write!(line, ",alias={}", escape_tag(alias));
    }
    if !tags.version.is_empty() {
        let _ = write!(line, ",version={}", escape_tag(&tags.version));
    }

    for (i, (key, value)) in measurement.fields.fields().iter().enumerate() {
        line.push(if i == 0 { ' ' } else { ',' });
        match value {
            FieldValue::Integer(v) => {
                let _ = write!(line, "{key}={v}i");
            }
            FieldValue::Float(v) => {
                let _ = write!(line, "{key}={v}");
            }
        }
    }

    let _ = write!(line, " {}", measurement.timestamp.timestamp());
    line
}

fn escape_tag(value: &str) -> String {
    escape(value, &[',', '=', ' '])
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
