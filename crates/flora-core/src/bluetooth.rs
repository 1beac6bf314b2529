//! BlueZ transport via `bluer`.
//!
//! This module provides the production [`Transport`] implementation:
//! - Scan with the default adapter for a fixed duration
//! - Connect to a peripheral and resolve its GATT database
//! - Read and write characteristics by value handle

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::{pin_mut, StreamExt};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::transport::{Attribute, Transport, TransportError, TransportResult};
use crate::types::DeviceIdentity;

/// How long to wait for BlueZ to resolve services after connecting.
const SERVICES_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for services to resolve.
const SERVICES_RESOLVE_POLL: Duration = Duration::from_millis(100);

/// How often devices seen without a name are asked for it again while a
/// scan runs. BlueZ often learns the name from a later scan response.
const NAME_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Devices seen during one scan.
#[derive(Debug, Default)]
struct ScanState {
    reported: HashSet<Address>,
    // Seen, but BlueZ had no name for them yet.
    unnamed: HashSet<Address>,
}

impl ScanState {
    fn is_reported(&self, address: &Address) -> bool {
        self.reported.contains(address)
    }

    fn has_pending(&self) -> bool {
        !self.unnamed.is_empty()
    }

    fn pending(&self) -> Vec<Address> {
        self.unnamed.iter().copied().collect()
    }

    /// Record the name BlueZ currently holds for `address`, returning the
    /// identity the first time a name is known.
    fn observe(&mut self, address: Address, name: Option<String>) -> Option<DeviceIdentity> {
        if self.reported.contains(&address) {
            return None;
        }
        let Some(name) = name else {
            self.unnamed.insert(address);
            return None;
        };
        self.unnamed.remove(&address);
        self.reported.insert(address);
        Some(DeviceIdentity::new(address.to_string(), name))
    }
}

/// Transport backed by the system BlueZ daemon.
pub struct BluezTransport {
    // Keeps the D-Bus connection alive for the adapter.
    _session: Session,
    adapter: Adapter,
}

/// An open connection to a peripheral.
pub struct BluezConnection {
    device: bluer::Device,
    characteristics: HashMap<u16, Characteristic>,
}

impl BluezTransport {
    /// Open a BlueZ session and power on the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::AdapterUnavailable`] if bluetoothd is not
    /// reachable or no adapter is present.
    pub async fn new() -> TransportResult<Self> {
        let session = Session::new().await.map_err(adapter_error)?;
        let adapter = session.default_adapter().await.map_err(adapter_error)?;
        adapter.set_powered(true).await.map_err(adapter_error)?;

        info!(adapter = adapter.name(), "Bluetooth adapter ready");

        Ok(Self {
            _session: session,
            adapter,
        })
    }

    async fn resolve_name(
        &self,
        address: Address,
        state: &mut ScanState,
    ) -> Option<DeviceIdentity> {
        let device = self.adapter.device(address).ok()?;
        match device.name().await {
            Ok(name) => state.observe(address, name),
            Err(err) => {
                debug!(%address, error = %err, "Failed to read device name");
                None
            }
        }
    }

    async fn wait_for_services(device: &bluer::Device) -> TransportResult<()> {
        let deadline = Instant::now() + SERVICES_RESOLVE_TIMEOUT;
        loop {
            let resolved = device
                .is_services_resolved()
                .await
                .map_err(discovery_error)?;
            if resolved {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TransportError::DiscoveryFailed {
                    message: format!(
                        "services not resolved after {}s",
                        SERVICES_RESOLVE_TIMEOUT.as_secs()
                    ),
                });
            }
            sleep(SERVICES_RESOLVE_POLL).await;
        }
    }
}

#[async_trait]
impl Transport for BluezTransport {
    type Connection = BluezConnection;

    async fn scan(
        &self,
        duration: Duration,
        on_advertisement: &mut (dyn FnMut(DeviceIdentity) + Send),
    ) -> TransportResult<()> {
        let events = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| TransportError::ScanFailed {
                message: e.to_string(),
            })?;
        pin_mut!(events);

        let deadline = sleep(duration);
        tokio::pin!(deadline);

        let mut retry = interval(NAME_RETRY_INTERVAL);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = ScanState::default();
        let mut events_done = false;

        loop {
            tokio::select! {
                () = &mut deadline => break,
                event = events.next(), if !events_done => match event {
                    Some(AdapterEvent::DeviceAdded(address)) if !state.is_reported(&address) => {
                        if let Some(identity) = self.resolve_name(address, &mut state).await {
                            on_advertisement(identity);
                        }
                    }
                    Some(_) => {}
                    // Stream ended early; keep honouring the fixed scan duration.
                    None => events_done = true,
                },
                _ = retry.tick(), if state.has_pending() => {
                    for address in state.pending() {
                        if let Some(identity) = self.resolve_name(address, &mut state).await {
                            on_advertisement(identity);
                        }
                    }
                }
            }
        }

        // Dropping the event stream stops discovery on the adapter.
        Ok(())
    }

    async fn connect(&self, identity: &DeviceIdentity) -> TransportResult<BluezConnection> {
        let connect_error = |message: String| TransportError::ConnectFailed {
            address: identity.address().to_string(),
            message,
        };

        let address: Address = identity
            .address()
            .parse()
            .map_err(|e: bluer::InvalidAddress| connect_error(e.to_string()))?;
        let device = self
            .adapter
            .device(address)
            .map_err(|e| connect_error(e.to_string()))?;
        device
            .connect()
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        Ok(BluezConnection {
            device,
            characteristics: HashMap::new(),
        })
    }

    async fn discover_attributes(
        &self,
        connection: &mut BluezConnection,
    ) -> TransportResult<Vec<Attribute>> {
        Self::wait_for_services(&connection.device).await?;

        let mut attributes = Vec::new();
        connection.characteristics.clear();

        for service in connection.device.services().await.map_err(discovery_error)? {
            let service_uuid = service.uuid().await.map_err(discovery_error)?;
            for characteristic in service.characteristics().await.map_err(discovery_error)? {
                let uuid = characteristic.uuid().await.map_err(discovery_error)?;
                // BlueZ names characteristics after their declaration handle;
                // the value attribute directly follows it.
                let handle = characteristic.id().saturating_add(1);
                attributes.push(Attribute {
                    service: service_uuid,
                    uuid,
                    handle,
                });
                connection.characteristics.insert(handle, characteristic);
            }
        }

        Ok(attributes)
    }

    async fn read_attribute(
        &self,
        connection: &BluezConnection,
        attribute: &Attribute,
    ) -> TransportResult<Vec<u8>> {
        let handle = attribute.handle;
        connection
            .characteristics
            .get(&handle)
            .ok_or(TransportError::UnknownAttribute { handle })?
            .read()
            .await
            .map_err(|e| TransportError::ReadFailed {
                handle,
                message: e.to_string(),
            })
    }

    async fn write_attribute(
        &self,
        connection: &BluezConnection,
        attribute: &Attribute,
        value: &[u8],
    ) -> TransportResult<()> {
        let handle = attribute.handle;
        connection
            .characteristics
            .get(&handle)
            .ok_or(TransportError::UnknownAttribute { handle })?
            .write(value)
            .await
            .map_err(|e| TransportError::WriteFailed {
                handle,
                message: e.to_string(),
            })
    }

    async fn disconnect(&self, connection: BluezConnection) -> TransportResult<()> {
        connection
            .device
            .disconnect()
            .await
            .map_err(|e| TransportError::DisconnectFailed {
                message: e.to_string(),
            })
    }
}

fn adapter_error(err: bluer::Error) -> TransportError {
    TransportError::AdapterUnavailable {
        message: err.to_string(),
    }
}

fn discovery_error(err: bluer::Error) -> TransportError {
    TransportError::DiscoveryFailed {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSOR: Address = Address::new([0xC4, 0x7C, 0x8D, 0x6A, 0x3E, 0x01]);

    #[test]
    fn test_scan_state_reports_named_device_once() {
        let mut state = ScanState::default();

        let identity = state.observe(SENSOR, Some("Flower care".into())).unwrap();
        assert_eq!(identity.address(), "C4:7C:8D:6A:3E:01");
        assert!(state.is_reported(&SENSOR));
        assert!(state.observe(SENSOR, Some("Flower care".into())).is_none());
        assert!(!state.has_pending());
    }

    #[test]
    fn test_scan_state_reports_late_name() {
        let mut state = ScanState::default();

        assert!(state.observe(SENSOR, None).is_none());
        assert!(!state.is_reported(&SENSOR));
        assert_eq!(state.pending(), vec![SENSOR]);

        // still unnamed on the next retry
        assert!(state.observe(SENSOR, None).is_none());
        assert!(state.has_pending());

        let identity = state.observe(SENSOR, Some("Flower mate".into())).unwrap();
        assert_eq!(identity.name(), "Flower mate");
        assert!(!state.has_pending());
        assert!(state.observe(SENSOR, Some("Flower mate".into())).is_none());
    }
}
