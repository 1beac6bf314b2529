//! Time-boxed sensor discovery.
//!
//! A discovery pass scans for a fixed duration, keeps every advertisement
//! whose name is a known sensor name, applies the per-device configuration
//! and returns the resulting [`Roster`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::protocol;
use crate::session::Device;
use crate::transport::{Transport, TransportError};
use crate::types::{DeviceConfigMap, DeviceIdentity};

/// Errors that abort a discovery attempt.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    /// The scan could not be run.
    #[error("Device discovery failed: {0}")]
    Scan(#[from] TransportError),
}

/// The devices found by one discovery pass, in the order they were seen.
///
/// A roster is never edited; the next discovery pass replaces it.
pub struct Roster<T: Transport> {
    devices: Vec<Device<T>>,
}

impl<T: Transport> Roster<T> {
    /// Number of devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Iterate over the devices.
    pub fn iter(&self) -> std::slice::Iter<'_, Device<T>> {
        self.devices.iter()
    }

    /// Iterate over the identities of the devices.
    pub fn identities(&self) -> impl Iterator<Item = &DeviceIdentity> {
        self.devices.iter().map(Device::identity)
    }
}

impl<T: Transport> std::fmt::Debug for Roster<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.devices.iter()).finish()
    }
}

impl<'a, T: Transport> IntoIterator for &'a Roster<T> {
    type Item = &'a Device<T>;
    type IntoIter = std::slice::Iter<'a, Device<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Scan for `timeout` and build a roster of the sensors found.
///
/// Devices configured with `ignore = true` are left out. An empty roster is
/// a valid result.
///
/// # Errors
///
/// Returns [`DiscoveryError::Scan`] if the transport cannot scan.
#[instrument(name = "discover", skip_all, fields(timeout = ?timeout))]
pub async fn discover<T: Transport>(
    transport: &Arc<T>,
    timeout: Duration,
    configs: &DeviceConfigMap,
) -> Result<Roster<T>, DiscoveryError> {
    info!("Discovering Bluetooth devices in the vicinity...");

    let mut devices = Vec::new();
    let mut seen: HashSet<DeviceIdentity> = HashSet::new();

    let mut on_advertisement = |identity: DeviceIdentity| {
        if !protocol::is_sensor_name(identity.name()) || !seen.insert(identity.clone()) {
            return;
        }

        let config = configs.get(identity.address()).cloned().unwrap_or_default();
        if config.ignore {
            info!(device = %identity, "Device will be ignored");
            return;
        }

        let alias = config.alias().map(str::to_string);
        info!(device = %identity, alias = alias.as_deref(), "Flora device detected");
        devices.push(Device::new(identity, alias, Arc::clone(transport)));
    };

    transport.scan(timeout, &mut on_advertisement).await?;
    debug!("Stopped the scan after {:?}", timeout);

    Ok(Roster { devices })
}
