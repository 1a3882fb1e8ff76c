//! In-memory simulated radio.
//!
//! [`MemoryTransport`] behaves like a Bluetooth stack with a fixed set of
//! devices in range. It is used by the demos and the test-suite, and is handy
//! for exercising an application against link failures that are hard to
//! produce with real hardware: refused or hanging connects, partial writes,
//! write errors, dropped links and fast senders.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{
    Advertisement, EventHub, EventStream, LinkHandle, ReadGate, Transport, TransportError,
    TransportEvent, TransportResult,
};
use crate::device::{Address, DeviceClass};
use crate::error::Result;

/// Payload size of a default ATT MTU (23 bytes minus the 3 byte header).
pub const DEFAULT_SIMULATED_PAYLOAD: usize = 20;

/// How a simulated device answers connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenBehavior {
    /// Connections succeed.
    #[default]
    Accept,
    /// Connections fail straight away.
    Refuse,
    /// Connection attempts never complete.
    Hang,
}

#[derive(Debug)]
struct SimulatedDevice {
    name: String,
    rssi: i16,
    device_class: DeviceClass,
    behavior: OpenBehavior,
    open_failures: u32,
    write_failures: u32,
    write_limit: Option<usize>,
    open_attempts: Vec<Instant>,
    written: Vec<u8>,
    write_calls: Vec<usize>,
    closes: usize,
}

#[derive(Debug)]
struct SimulatedLink {
    address: Address,
    gate: ReadGate,
}

#[derive(Debug)]
struct RadioState {
    devices: HashMap<Address, SimulatedDevice>,
    links: HashMap<LinkHandle, SimulatedLink>,
    next_handle: u64,
    scanning: bool,
    max_payload: usize,
    open_delay: Duration,
    write_delay: Duration,
}

/// A simulated radio with scripted devices.
///
/// ```
/// use blue_manager::transport::MemoryTransport;
/// use blue_manager::DeviceClass;
///
/// let radio = MemoryTransport::new();
/// radio.add_device("AA:BB:CC:DD:EE:01", "Sensor", -42, DeviceClass::Ble).unwrap();
/// assert_eq!(radio.device_count(), 1);
/// ```
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<RadioState>>,
    hub: Arc<EventHub>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a radio with no devices in range.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RadioState {
                devices: HashMap::new(),
                links: HashMap::new(),
                next_handle: 1,
                scanning: false,
                max_payload: DEFAULT_SIMULATED_PAYLOAD,
                open_delay: Duration::ZERO,
                write_delay: Duration::ZERO,
            })),
            hub: Arc::new(EventHub::new()),
        }
    }

    /// Put a device in range.
    ///
    /// If a scan is running the device is announced immediately.
    pub fn add_device(
        &self,
        address: &str,
        name: &str,
        rssi: i16,
        device_class: DeviceClass,
    ) -> Result<Address> {
        let address = Address::parse(address)?;
        let mut state = self.state.lock();
        state.devices.insert(
            address.clone(),
            SimulatedDevice {
                name: name.to_string(),
                rssi,
                device_class,
                behavior: OpenBehavior::Accept,
                open_failures: 0,
                write_failures: 0,
                write_limit: None,
                open_attempts: Vec::new(),
                written: Vec::new(),
                write_calls: Vec::new(),
                closes: 0,
            },
        );
        if state.scanning {
            if let Some(device) = state.devices.get(&address) {
                self.hub
                    .publish(TransportEvent::Discovered(advertisement(&address, device)));
            }
        }
        Ok(address)
    }

    /// Number of devices in range.
    pub fn device_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    /// Announce an advertisement as if the radio had heard it.
    ///
    /// Ignored unless a scan is running.
    pub fn announce(&self, advertisement: Advertisement) {
        if self.state.lock().scanning {
            self.hub.publish(TransportEvent::Discovered(advertisement));
        }
    }

    /// Change how a device answers connection attempts.
    pub fn set_open_behavior(&self, address: &Address, behavior: OpenBehavior) {
        if let Some(device) = self.state.lock().devices.get_mut(address) {
            device.behavior = behavior;
        }
    }

    /// Make the next `count` connection attempts to a device fail.
    pub fn fail_next_opens(&self, address: &Address, count: u32) {
        if let Some(device) = self.state.lock().devices.get_mut(address) {
            device.open_failures = count;
        }
    }

    /// Make the next `count` writes to a device fail.
    pub fn fail_next_writes(&self, address: &Address, count: u32) {
        if let Some(device) = self.state.lock().devices.get_mut(address) {
            device.write_failures = count;
        }
    }

    /// Accept at most `limit` bytes per write to a device.
    pub fn set_write_limit(&self, address: &Address, limit: Option<usize>) {
        if let Some(device) = self.state.lock().devices.get_mut(address) {
            device.write_limit = limit;
        }
    }

    /// Time every connection attempt takes before it resolves.
    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = delay;
    }

    /// Time every write takes before the device accepts it.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().write_delay = delay;
    }

    /// Payload limit reported for every link.
    pub fn set_max_payload(&self, max_payload: usize) {
        self.state.lock().max_payload = max_payload.max(1);
    }

    /// Deliver bytes from a device over its open link.
    ///
    /// Returns `false` if the device has no open link.
    pub fn inject_data(&self, address: &Address, data: impl Into<Bytes>) -> bool {
        let mut state = self.state.lock();
        let Some((&handle, link)) = state
            .links
            .iter_mut()
            .find(|(_, link)| &link.address == address)
        else {
            return false;
        };
        link.gate.deliver(&self.hub, handle, data.into());
        true
    }

    /// Drop a device's link as if it went out of range.
    ///
    /// Returns `false` if the device has no open link.
    pub fn drop_link(&self, address: &Address) -> bool {
        let mut state = self.state.lock();
        let handle = state
            .links
            .iter()
            .find(|(_, link)| &link.address == address)
            .map(|(handle, _)| *handle);
        match handle {
            Some(handle) => {
                state.links.remove(&handle);
                debug!("Simulated link loss on {} ({})", address, handle);
                self.hub.publish(TransportEvent::LinkDown {
                    handle,
                    reason: "out of range".to_string(),
                });
                true
            }
            None => false,
        }
    }

    /// All bytes written to a device, in order.
    pub fn written(&self, address: &Address) -> Vec<u8> {
        self.state
            .lock()
            .devices
            .get(address)
            .map(|d| d.written.clone())
            .unwrap_or_default()
    }

    /// Sizes of the individual writes accepted by a device.
    pub fn write_calls(&self, address: &Address) -> Vec<usize> {
        self.state
            .lock()
            .devices
            .get(address)
            .map(|d| d.write_calls.clone())
            .unwrap_or_default()
    }

    /// When each connection attempt to a device started.
    pub fn open_attempts(&self, address: &Address) -> Vec<Instant> {
        self.state
            .lock()
            .devices
            .get(address)
            .map(|d| d.open_attempts.clone())
            .unwrap_or_default()
    }

    /// How many times a link to a device was closed by the manager.
    pub fn close_count(&self, address: &Address) -> usize {
        self.state
            .lock()
            .devices
            .get(address)
            .map(|d| d.closes)
            .unwrap_or_default()
    }

    /// Whether the device currently has an open link.
    pub fn is_linked(&self, address: &Address) -> bool {
        self.state
            .lock()
            .links
            .values()
            .any(|link| &link.address == address)
    }

    /// Whether reads on the device's link are paused.
    pub fn is_read_paused(&self, address: &Address) -> bool {
        self.state
            .lock()
            .links
            .values()
            .any(|link| &link.address == address && link.gate.is_paused())
    }

    /// Number of open links.
    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }
}

fn advertisement(address: &Address, device: &SimulatedDevice) -> Advertisement {
    Advertisement {
        address: address.to_string(),
        name: Some(device.name.clone()).filter(|n| !n.is_empty()),
        rssi: Some(device.rssi),
        device_class: device.device_class,
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn begin_scan(&self) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.scanning = true;
        for (address, device) in &state.devices {
            self.hub
                .publish(TransportEvent::Discovered(advertisement(address, device)));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.state.lock().scanning = false;
        Ok(())
    }

    async fn open_link(&self, address: &Address) -> TransportResult<LinkHandle> {
        let (behavior, fail, delay) = {
            let mut state = self.state.lock();
            let delay = state.open_delay;
            let device = state
                .devices
                .get_mut(address)
                .ok_or_else(|| TransportError::Unreachable(address.to_string()))?;
            device.open_attempts.push(Instant::now());
            let fail = device.open_failures > 0;
            if fail {
                device.open_failures -= 1;
            }
            (device.behavior, fail, delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match behavior {
            OpenBehavior::Hang => std::future::pending().await,
            OpenBehavior::Refuse => Err(TransportError::Unreachable(address.to_string())),
            OpenBehavior::Accept if fail => {
                Err(TransportError::Other("simulated connection failure".to_string()))
            }
            OpenBehavior::Accept => {
                let mut state = self.state.lock();
                let handle = LinkHandle::new(state.next_handle);
                state.next_handle += 1;
                state.links.insert(
                    handle,
                    SimulatedLink {
                        address: address.clone(),
                        gate: ReadGate::default(),
                    },
                );
                self.hub.publish(TransportEvent::LinkUp {
                    handle,
                    address: address.clone(),
                });
                Ok(handle)
            }
        }
    }

    async fn close_link(&self, handle: LinkHandle) -> TransportResult<()> {
        let mut state = self.state.lock();
        let link = state
            .links
            .remove(&handle)
            .ok_or(TransportError::UnknownLink(handle))?;
        if let Some(device) = state.devices.get_mut(&link.address) {
            device.closes += 1;
        }
        Ok(())
    }

    async fn write(&self, handle: LinkHandle, data: &[u8]) -> TransportResult<usize> {
        let delay = self.state.lock().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let address = state
            .links
            .get(&handle)
            .map(|link| link.address.clone())
            .ok_or(TransportError::UnknownLink(handle))?;
        let device = state
            .devices
            .get_mut(&address)
            .ok_or(TransportError::LinkClosed(handle))?;

        if device.write_failures > 0 {
            device.write_failures -= 1;
            return Err(TransportError::Other("simulated write failure".to_string()));
        }

        let accepted = data.len().min(device.write_limit.unwrap_or(usize::MAX));
        device.written.extend_from_slice(&data[..accepted]);
        device.write_calls.push(accepted);
        trace!("{} accepted {} of {} bytes", handle, accepted, data.len());
        Ok(accepted)
    }

    async fn read(&self, handle: LinkHandle) -> TransportResult<Bytes> {
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(&handle)
            .ok_or(TransportError::UnknownLink(handle))?;
        Ok(link.gate.take_held())
    }

    async fn set_read_paused(&self, handle: LinkHandle, paused: bool) -> TransportResult<()> {
        let mut state = self.state.lock();
        let link = state
            .links
            .get_mut(&handle)
            .ok_or(TransportError::UnknownLink(handle))?;
        link.gate.set_paused(&self.hub, handle, paused);
        Ok(())
    }

    fn max_payload_size(&self, _handle: LinkHandle) -> usize {
        self.state.lock().max_payload
    }

    async fn events(&self) -> TransportResult<EventStream> {
        Ok(self.hub.subscribe())
    }

    async fn adapter_info(&self) -> TransportResult<String> {
        let count = self.device_count();
        let plural = if count == 1 { "" } else { "s" };
        Ok(format!("Simulated radio ({} device{})", count, plural))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_scan_announces_devices() {
        let radio = MemoryTransport::new();
        radio
            .add_device("AA:BB:CC:DD:EE:01", "One", -42, DeviceClass::Ble)
            .unwrap();
        let mut events = radio.events().await.unwrap();

        radio.begin_scan().await.unwrap();

        match events.next().await {
            Some(TransportEvent::Discovered(adv)) => {
                assert_eq!(adv.address, "AA:BB:CC:DD:EE:01");
                assert_eq!(adv.rssi, Some(-42));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_writes_and_failures() {
        let radio = MemoryTransport::new();
        let address = radio
            .add_device("AA:BB:CC:DD:EE:01", "One", -42, DeviceClass::Ble)
            .unwrap();
        let handle = radio.open_link(&address).await.unwrap();

        radio.set_write_limit(&address, Some(3));
        assert_eq!(radio.write(handle, b"hello").await.unwrap(), 3);

        radio.fail_next_writes(&address, 1);
        assert!(radio.write(handle, b"lo").await.is_err());
        assert_eq!(radio.write(handle, b"lo").await.unwrap(), 2);

        assert_eq!(radio.written(&address), b"hello".to_vec());
        assert_eq!(radio.write_calls(&address), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_open_failures_are_consumed() {
        let radio = MemoryTransport::new();
        let address = radio
            .add_device("AA:BB:CC:DD:EE:01", "One", -42, DeviceClass::Ble)
            .unwrap();
        radio.fail_next_opens(&address, 1);

        assert!(radio.open_link(&address).await.is_err());
        assert!(radio.open_link(&address).await.is_ok());
        assert_eq!(radio.open_attempts(&address).len(), 2);
    }

    #[tokio::test]
    async fn test_adapter_info_counts_devices() {
        let radio = MemoryTransport::new();
        assert_eq!(radio.adapter_info().await.unwrap(), "Simulated radio (0 devices)");
        radio
            .add_device("AA:BB:CC:DD:EE:01", "One", -42, DeviceClass::Ble)
            .unwrap();
        assert_eq!(radio.adapter_info().await.unwrap(), "Simulated radio (1 device)");
    }

    #[tokio::test]
    async fn test_unknown_device_is_unreachable() {
        let radio = MemoryTransport::new();
        let address = Address::parse("AA:BB:CC:DD:EE:99").unwrap();
        let err = radio.open_link(&address).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_drop_link_publishes_link_down() {
        let radio = MemoryTransport::new();
        let address = radio
            .add_device("AA:BB:CC:DD:EE:01", "One", -42, DeviceClass::Ble)
            .unwrap();
        let handle = radio.open_link(&address).await.unwrap();
        let mut events = radio.events().await.unwrap();

        assert!(radio.drop_link(&address));
        assert!(!radio.is_linked(&address));
        match events.next().await {
            Some(TransportEvent::LinkDown { handle: lost, .. }) => assert_eq!(lost, handle),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
