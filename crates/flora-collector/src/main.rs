//! # flora2influx
//!
//! Daemon that discovers Mi Flora plant sensors, polls them at a fixed
//! interval and writes their readings to InfluxDB.
//!
//! ## Running
//!
//! ```bash
//! # Print a starting configuration
//! flora2influx --dump > /etc/flora2influx/flora2influx.toml
//!
//! # Development
//! cargo run --package flora-collector -- -c flora2influx.toml
//!
//! # Production (under systemd)
//! flora2influx --production
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use flora_core::{Scheduler, Settings, Transport};
use flora_collector::{load_settings, logging, signal, Cli, InfluxSink};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.dump {
        print!("{}", Settings::default().to_toml()?);
        return Ok(());
    }

    logging::init(cli.production)?;

    let path = match cli.config {
        Some(path) => path,
        None => Settings::default_path()?,
    };
    let settings = load_settings(&path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    info!(config = %path.display(), "Starting flora2influx");

    let sink = InfluxSink::new(&settings.influx).context("Failed to set up InfluxDB sink")?;
    info!(url = %sink.write_url(), "Writing to InfluxDB");

    let transport = open_transport().await?;
    let scheduler = Scheduler::new(
        Arc::new(transport),
        Arc::new(sink),
        settings.collection,
        settings.devices,
    );
    scheduler.run(signal::shutdown_signal()).await;

    info!("flora2influx stopped");
    Ok(())
}

#[cfg(feature = "bluetooth")]
async fn open_transport() -> anyhow::Result<impl Transport> {
    flora_core::BluezTransport::new()
        .await
        .context("Failed to open Bluetooth adapter")
}

#[cfg(not(feature = "bluetooth"))]
#[allow(clippy::unused_async)]
async fn open_transport() -> anyhow::Result<impl Transport> {
    tracing::warn!("Built without Bluetooth support, using simulated sensors");
    Ok(flora_core::MockTransport::demo())
}
