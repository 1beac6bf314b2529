//! Destination for collected measurements.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Measurement;

/// Errors raised when writing a measurement.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The request could not be sent.
    #[error("Failed to send measurement: {message}")]
    Request {
        /// Details from the client.
        message: String,
    },

    /// The store rejected the write.
    #[error("Store rejected measurement with HTTP {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The sink was closed.
    #[error("Sink is closed")]
    Closed,
}

/// A time-series store that accepts one measurement per successful fetch.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Write one measurement.
    async fn write(&self, measurement: &Measurement) -> Result<(), SinkError>;

    /// Release the connection. Called once at shutdown.
    async fn close(&self);
}
