//! Scripted in-memory transport.
//!
//! Used by the test suite and by builds without the `bluetooth` feature.
//! Every peripheral is described up front with [`MockPeripheral`]; every
//! transport call is recorded so tests can assert on the exact sequence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::protocol::{
    HANDLE_FIRMWARE_BATTERY, HANDLE_REALTIME_MODE, HANDLE_SENSOR_READINGS, SENSOR_SERVICE_UUID,
};
use crate::transport::{Attribute, Transport, TransportError, TransportResult};
use crate::types::DeviceIdentity;

/// A transport call observed by [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// `scan` was called.
    Scan,
    /// `connect` was called for the address.
    Connect(String),
    /// `discover_attributes` was called for the address.
    Discover(String),
    /// `read_attribute` was called.
    Read(String, u16),
    /// `write_attribute` was called with the value.
    Write(String, u16, Vec<u8>),
    /// `disconnect` was called for the address.
    Disconnect(String),
}

/// Failure to inject into a scripted peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// `connect` fails.
    Connect,
    /// `discover_attributes` fails.
    Discover,
    /// Reading the handle fails.
    Read(u16),
    /// Writing the handle fails.
    Write(u16),
    /// `disconnect` fails.
    Disconnect,
}

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    identity: DeviceIdentity,
    attributes: Vec<Attribute>,
    values: HashMap<u16, Vec<u8>>,
    failures: Vec<MockFailure>,
}

impl MockPeripheral {
    /// A peripheral that advertises `name` and has no characteristics.
    pub fn new(address: &str, name: &str) -> Self {
        Self {
            identity: DeviceIdentity::new(address, name),
            attributes: Vec::new(),
            values: HashMap::new(),
            failures: Vec::new(),
        }
    }

    /// A Mi Flora sensor with all three characteristics.
    ///
    /// The firmware payload carries `battery` and `version`; the readings
    /// characteristic returns `sensor_payload`.
    pub fn flora(address: &str, version: &str, battery: u8, sensor_payload: &[u8]) -> Self {
        let mut firmware = vec![battery, 0x10];
        firmware.extend_from_slice(version.as_bytes());

        Self::new(address, "Flower care")
            .with_characteristic(HANDLE_REALTIME_MODE, Vec::new())
            .with_characteristic(HANDLE_SENSOR_READINGS, sensor_payload.to_vec())
            .with_characteristic(HANDLE_FIRMWARE_BATTERY, firmware)
    }

    /// Add a characteristic in the sensor service.
    #[must_use]
    pub fn with_characteristic(mut self, handle: u16, value: Vec<u8>) -> Self {
        self.attributes.push(Attribute {
            service: SENSOR_SERVICE_UUID,
            uuid: uuid::Uuid::from_u128(u128::from(handle)),
            handle,
        });
        self.values.insert(handle, value);
        self
    }

    /// Remove a characteristic.
    #[must_use]
    pub fn without_characteristic(mut self, handle: u16) -> Self {
        self.attributes.retain(|a| a.handle != handle);
        self.values.remove(&handle);
        self
    }

    /// Inject a failure.
    #[must_use]
    pub fn failing(mut self, failure: MockFailure) -> Self {
        self.failures.push(failure);
        self
    }

    /// The identity this peripheral advertises.
    #[must_use]
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn fails(&self, failure: MockFailure) -> bool {
        self.failures.contains(&failure)
    }
}

/// Connection handle handed out by [`MockTransport`].
#[derive(Debug)]
pub struct MockConnection {
    address: String,
}

#[derive(Debug, Default)]
struct MockState {
    advertisements: Vec<DeviceIdentity>,
    peripherals: HashMap<String, MockPeripheral>,
    scan_error: Option<String>,
    events: Vec<MockEvent>,
}

/// In-memory [`Transport`] with scripted peripherals.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// An empty transport: scans find nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport with two healthy sensors on old and new firmware.
    #[must_use]
    pub fn demo() -> Self {
        let transport = Self::new();
        transport.add_peripheral(MockPeripheral::flora(
            "C4:7C:8D:60:00:01",
            "2.6.2",
            87,
            &[0xd2, 0x00, 0x00, 0xf4, 0x01, 0x00, 0x00, 0x1e, 0x96, 0x00],
        ));
        transport.add_peripheral(MockPeripheral::flora(
            "C4:7C:8D:60:00:02",
            "3.2.1",
            64,
            &[0xce, 0x00, 0x00, 0x90, 0x01, 0x00, 0x00, 0x28, 0xe8, 0x00],
        ));
        transport
    }

    /// Add a peripheral that is advertised once per scan.
    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        let mut state = self.lock();
        state.advertisements.push(peripheral.identity.clone());
        state
            .peripherals
            .insert(peripheral.identity.address().to_string(), peripheral);
    }

    /// Advertise `identity` again during every scan, without a peripheral
    /// behind it unless one was added.
    pub fn add_advertisement(&self, identity: DeviceIdentity) {
        self.lock().advertisements.push(identity);
    }

    /// Make subsequent scans fail, or succeed again with `None`.
    pub fn set_scan_error(&self, message: Option<&str>) {
        self.lock().scan_error = message.map(str::to_string);
    }

    /// Every transport call so far.
    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.lock().events.clone()
    }

    /// Transport calls concerning `address`.
    #[must_use]
    pub fn events_for(&self, address: &str) -> Vec<MockEvent> {
        self.events()
            .into_iter()
            .filter(|event| match event {
                MockEvent::Scan => false,
                MockEvent::Connect(a)
                | MockEvent::Discover(a)
                | MockEvent::Read(a, _)
                | MockEvent::Write(a, _, _)
                | MockEvent::Disconnect(a) => a == address,
            })
            .collect()
    }

    /// Number of scans so far.
    #[must_use]
    pub fn scan_count(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|event| matches!(event, MockEvent::Scan))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn peripheral(&self, address: &str) -> Option<MockPeripheral> {
        self.lock().peripherals.get(address).cloned()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn scan(
        &self,
        duration: Duration,
        on_advertisement: &mut (dyn FnMut(DeviceIdentity) + Send),
    ) -> TransportResult<()> {
        let advertisements = {
            let mut state = self.lock();
            state.events.push(MockEvent::Scan);
            if let Some(message) = state.scan_error.clone() {
                return Err(TransportError::ScanFailed { message });
            }
            state.advertisements.clone()
        };

        for identity in advertisements {
            on_advertisement(identity);
        }
        tokio::time::sleep(duration).await;
        Ok(())
    }

    async fn connect(&self, identity: &DeviceIdentity) -> TransportResult<MockConnection> {
        let address = identity.address().to_string();
        self.lock().events.push(MockEvent::Connect(address.clone()));

        match self.peripheral(&address) {
            Some(peripheral) if !peripheral.fails(MockFailure::Connect) => {
                Ok(MockConnection { address })
            }
            _ => Err(TransportError::ConnectFailed {
                address,
                message: "peripheral not reachable".into(),
            }),
        }
    }

    async fn discover_attributes(
        &self,
        connection: &mut MockConnection,
    ) -> TransportResult<Vec<Attribute>> {
        let address = connection.address.clone();
        self.lock().events.push(MockEvent::Discover(address.clone()));

        match self.peripheral(&address) {
            Some(peripheral) if !peripheral.fails(MockFailure::Discover) => {
                Ok(peripheral.attributes)
            }
            _ => Err(TransportError::DiscoveryFailed {
                message: "service discovery failed".into(),
            }),
        }
    }

    async fn read_attribute(
        &self,
        connection: &MockConnection,
        attribute: &Attribute,
    ) -> TransportResult<Vec<u8>> {
        let handle = attribute.handle;
        self.lock()
            .events
            .push(MockEvent::Read(connection.address.clone(), handle));

        let peripheral = self
            .peripheral(&connection.address)
            .ok_or(TransportError::UnknownAttribute { handle })?;
        if peripheral.fails(MockFailure::Read(handle)) {
            return Err(TransportError::ReadFailed {
                handle,
                message: "read timed out".into(),
            });
        }
        peripheral
            .values
            .get(&handle)
            .cloned()
            .ok_or(TransportError::UnknownAttribute { handle })
    }

    async fn write_attribute(
        &self,
        connection: &MockConnection,
        attribute: &Attribute,
        value: &[u8],
    ) -> TransportResult<()> {
        let handle = attribute.handle;
        self.lock().events.push(MockEvent::Write(
            connection.address.clone(),
            handle,
            value.to_vec(),
        ));

        let peripheral = self
            .peripheral(&connection.address)
            .ok_or(TransportError::UnknownAttribute { handle })?;
        if peripheral.fails(MockFailure::Write(handle)) {
            return Err(TransportError::WriteFailed {
                handle,
                message: "write rejected".into(),
            });
        }
        Ok(())
    }

    async fn disconnect(&self, connection: MockConnection) -> TransportResult<()> {
        let address = connection.address;
        self.lock().events.push(MockEvent::Disconnect(address.clone()));

        match self.peripheral(&address) {
            Some(peripheral) if peripheral.fails(MockFailure::Disconnect) => {
                Err(TransportError::DisconnectFailed {
                    message: "link already lost".into(),
                })
            }
            _ => Ok(()),
        }
    }
}
