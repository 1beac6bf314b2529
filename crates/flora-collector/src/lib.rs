//! # flora-collector
//!
//! Process-level pieces of the flora2influx daemon: the command line, log
//! setup, signal handling and the InfluxDB sink. The collection logic lives
//! in `flora-core`.

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod cli;
pub mod influx;
pub mod logging;
pub mod signal;

pub use cli::Cli;
pub use influx::{InfluxError, InfluxSink};

use std::path::Path;

use flora_core::{FloraError, Settings};
use tracing::error;

/// Load and validate the settings at `path`, logging the error code of
/// any failure.
///
/// # Errors
///
/// Returns one of the `FloraError::Config*` variants.
pub fn load_settings(path: &Path) -> Result<Settings, FloraError> {
    Settings::load(path).map_err(|err| {
        let err = FloraError::from(err);
        error!(config = %path.display(), code = err.error_code(), error = %err, "Failed to load configuration");
        err
    })
}
