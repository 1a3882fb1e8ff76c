//! btleplug-backed transport.
//!
//! Maps the [`Transport`] contract onto a platform BLE adapter:
//!
//! - discovery events become [`TransportEvent::Discovered`]
//! - a link is a connected peripheral plus one writable characteristic and,
//!   when available, one notifying characteristic whose notifications become
//!   [`TransportEvent::DataArrived`]
//! - peripheral disconnects become [`TransportEvent::LinkDown`]

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    Advertisement, EventHub, EventStream, LinkHandle, ReadGate, Transport, TransportError,
    TransportEvent, TransportResult,
};
use crate::device::{Address, DeviceClass};
use crate::error::{Error, Result};

/// Payload of a default ATT MTU (23 bytes minus the 3 byte header).
pub const DEFAULT_ATT_PAYLOAD: usize = 20;

/// Characteristic selection and link parameters.
#[derive(Debug, Clone, Default)]
pub struct BleTransportOptions {
    /// Characteristic to write to. Defaults to the first writable one.
    pub write_characteristic: Option<Uuid>,
    /// Characteristic to receive from. Defaults to the first notifying one.
    pub notify_characteristic: Option<Uuid>,
    /// Payload per write. Defaults to [`DEFAULT_ATT_PAYLOAD`].
    pub max_payload: Option<usize>,
}

struct BleLink {
    peripheral: Peripheral,
    write_characteristic: Characteristic,
    write_type: WriteType,
    gate: ReadGate,
    notifications: Option<JoinHandle<()>>,
}

type LinkTable = Arc<Mutex<HashMap<LinkHandle, BleLink>>>;

/// Transport driving a platform BLE adapter through btleplug.
pub struct BleTransport {
    adapter: Adapter,
    options: BleTransportOptions,
    hub: Arc<EventHub>,
    links: LinkTable,
    next_handle: AtomicU64,
    event_pump: Mutex<Option<JoinHandle<()>>>,
}

impl BleTransport {
    /// Use the first adapter of the system.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_options(BleTransportOptions::default()).await
    }

    /// Use the first adapter of the system with explicit options.
    pub async fn with_options(options: BleTransportOptions) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| Error::transport("listing adapters", e))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Self::with_adapter(adapter, options).await
    }

    /// Use a specific adapter.
    pub async fn with_adapter(adapter: Adapter, options: BleTransportOptions) -> Result<Self> {
        let events = adapter
            .events()
            .await
            .map_err(|e| Error::transport("subscribing to adapter events", e))?;

        let hub = Arc::new(EventHub::new());
        let links: LinkTable = Arc::new(Mutex::new(HashMap::new()));

        let pump = tokio::spawn(Self::pump_central_events(
            adapter.clone(),
            events,
            hub.clone(),
            links.clone(),
        ));

        Ok(Self {
            adapter,
            options,
            hub,
            links,
            next_handle: AtomicU64::new(1),
            event_pump: Mutex::new(Some(pump)),
        })
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn pump_central_events(
        adapter: Adapter,
        mut events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
        hub: Arc<EventHub>,
        links: LinkTable,
    ) {
        while let Some(event) = events.next().await {
            match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                    trace!("Device seen: {:?}", id);
                    if let Some(advertisement) = Self::advertisement(&adapter, &id).await {
                        hub.publish(TransportEvent::Discovered(advertisement));
                    }
                }
                CentralEvent::DeviceDisconnected(id) => {
                    debug!("Device disconnected: {:?}", id);
                    Self::handle_disconnect(&id, &hub, &links);
                }
                _ => {}
            }
        }

        debug!("Adapter event stream ended");
    }

    async fn advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let Some(address) = peripheral_address(&id.to_string(), properties.address) else {
            warn!("Ignoring peripheral {:?} without a usable address", id);
            return None;
        };

        // The class-of-device field is only reported for BR/EDR devices.
        let device_class = if properties.class.is_some() {
            DeviceClass::Classic
        } else {
            DeviceClass::Ble
        };

        Some(Advertisement {
            address: address.to_string(),
            name: properties.local_name,
            rssi: properties.rssi,
            device_class,
        })
    }

    fn handle_disconnect(id: &PeripheralId, hub: &EventHub, links: &LinkTable) {
        let lost: Vec<LinkHandle> = {
            let mut links = links.lock();
            let handles: Vec<LinkHandle> = links
                .iter()
                .filter(|(_, link)| &link.peripheral.id() == id)
                .map(|(handle, _)| *handle)
                .collect();
            for handle in &handles {
                if let Some(link) = links.remove(handle) {
                    if let Some(task) = link.notifications {
                        task.abort();
                    }
                }
            }
            handles
        };

        for handle in lost {
            hub.publish(TransportEvent::LinkDown {
                handle,
                reason: "peripheral disconnected".to_string(),
            });
        }
    }

    async fn find_peripheral(&self, address: &Address) -> TransportResult<Peripheral> {
        for peripheral in self.adapter.peripherals().await? {
            let id = peripheral.id().to_string();
            if peripheral_address(&id, peripheral.address()).as_ref() == Some(address) {
                return Ok(peripheral);
            }
        }

        Err(TransportError::Unreachable(address.to_string()))
    }

    async fn forward_notifications(
        handle: LinkHandle,
        characteristic: Uuid,
        mut notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
        hub: Arc<EventHub>,
        links: LinkTable,
    ) {
        while let Some(notification) = notifications.next().await {
            if notification.uuid != characteristic {
                continue;
            }
            trace!(
                "{} notification: {} bytes",
                handle,
                notification.value.len()
            );
            let mut links = links.lock();
            match links.get_mut(&handle) {
                Some(link) => link.gate.deliver(&hub, handle, Bytes::from(notification.value)),
                None => break,
            }
        }

        debug!("Notification stream for {} ended", handle);
    }
}

/// The address a peripheral is registered under.
///
/// macOS reports every hardware address as zero and identifies peripherals by
/// a UUID instead, so the id stands in for a zero address.
fn peripheral_address(id: &str, address: BDAddr) -> Option<Address> {
    if address != BDAddr::default() {
        return Address::parse(&address.to_string()).ok();
    }
    Address::parse(id).ok()
}

/// Runs a cleanup closure on drop unless defused.
///
/// Guards a half-opened link: any early return, or the caller dropping the
/// future on a timeout, runs the cleanup.
struct CleanupGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> CleanupGuard<F> {
    fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// Keep the resource; the cleanup never runs.
    fn defuse(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for CleanupGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Disconnect in the background; usable from `Drop`.
fn spawn_disconnect(peripheral: Peripheral) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    warn!("Failed to disconnect abandoned peripheral: {}", e);
                }
            });
        }
        Err(_) => warn!("No runtime to disconnect abandoned peripheral {:?}", peripheral.id()),
    }
}

fn select_characteristic(
    characteristics: &BTreeSet<Characteristic>,
    preferred: Option<Uuid>,
    flags: CharPropFlags,
) -> Option<Characteristic> {
    match preferred {
        Some(uuid) => characteristics.iter().find(|c| c.uuid == uuid).cloned(),
        None => characteristics
            .iter()
            .find(|c| c.properties.intersects(flags))
            .cloned(),
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn begin_scan(&self) -> TransportResult<()> {
        info!("Starting BLE scan");
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        info!("Stopping BLE scan");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn open_link(&self, address: &Address) -> TransportResult<LinkHandle> {
        let peripheral = self.find_peripheral(address).await?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }

        // Until the link is registered, failing or being cancelled disconnects.
        let guard = CleanupGuard::new({
            let peripheral = peripheral.clone();
            move || spawn_disconnect(peripheral)
        });

        if let Err(e) = peripheral.discover_services().await {
            warn!("Failed to discover services on {}: {}", address, e);
        }

        let characteristics = peripheral.characteristics();
        let write_characteristic = select_characteristic(
            &characteristics,
            self.options.write_characteristic,
            CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
        )
        .ok_or_else(|| TransportError::Other(format!("{} has no writable characteristic", address)))?;

        let write_type = if write_characteristic
            .properties
            .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
        {
            WriteType::WithoutResponse
        } else {
            WriteType::WithResponse
        };

        let notify_characteristic = select_characteristic(
            &characteristics,
            self.options.notify_characteristic,
            CharPropFlags::NOTIFY | CharPropFlags::INDICATE,
        );

        let notifications = match notify_characteristic {
            Some(characteristic) => {
                let subscribed = async {
                    peripheral.subscribe(&characteristic).await?;
                    peripheral.notifications().await
                }
                .await;
                match subscribed {
                    Ok(stream) => Some((characteristic.uuid, stream)),
                    Err(e) => {
                        error!(
                            "Failed to subscribe to {} on {}: {}",
                            characteristic.uuid, address, e
                        );
                        return Err(e.into());
                    }
                }
            }
            None => {
                warn!("{} has no notifying characteristic, inbound data disabled", address);
                None
            }
        };

        // No await from here on: the link is registered and returned whole.
        let handle = LinkHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let mut links = self.links.lock();
        let task = notifications.map(|(uuid, stream)| {
            tokio::spawn(Self::forward_notifications(
                handle,
                uuid,
                stream,
                self.hub.clone(),
                self.links.clone(),
            ))
        });
        links.insert(
            handle,
            BleLink {
                peripheral,
                write_characteristic,
                write_type,
                gate: ReadGate::default(),
                notifications: task,
            },
        );
        drop(links);
        guard.defuse();

        info!("Opened {} to {}", handle, address);
        self.hub.publish(TransportEvent::LinkUp {
            handle,
            address: address.clone(),
        });

        Ok(handle)
    }

    async fn close_link(&self, handle: LinkHandle) -> TransportResult<()> {
        let link = self
            .links
            .lock()
            .remove(&handle)
            .ok_or(TransportError::UnknownLink(handle))?;

        if let Some(task) = link.notifications {
            task.abort();
        }

        link.peripheral.disconnect().await?;
        info!("Closed {}", handle);
        Ok(())
    }

    async fn write(&self, handle: LinkHandle, data: &[u8]) -> TransportResult<usize> {
        let (peripheral, characteristic, write_type) = {
            let links = self.links.lock();
            let link = links.get(&handle).ok_or(TransportError::UnknownLink(handle))?;
            (
                link.peripheral.clone(),
                link.write_characteristic.clone(),
                link.write_type,
            )
        };

        peripheral.write(&characteristic, data, write_type).await?;
        Ok(data.len())
    }

    async fn read(&self, handle: LinkHandle) -> TransportResult<Bytes> {
        let mut links = self.links.lock();
        let link = links
            .get_mut(&handle)
            .ok_or(TransportError::UnknownLink(handle))?;
        Ok(link.gate.take_held())
    }

    async fn set_read_paused(&self, handle: LinkHandle, paused: bool) -> TransportResult<()> {
        let mut links = self.links.lock();
        let link = links
            .get_mut(&handle)
            .ok_or(TransportError::UnknownLink(handle))?;
        link.gate.set_paused(&self.hub, handle, paused);
        Ok(())
    }

    fn max_payload_size(&self, _handle: LinkHandle) -> usize {
        self.options.max_payload.unwrap_or(DEFAULT_ATT_PAYLOAD)
    }

    async fn events(&self) -> TransportResult<EventStream> {
        Ok(self.hub.subscribe())
    }

    async fn adapter_info(&self) -> TransportResult<String> {
        Ok(self.adapter.adapter_info().await?)
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.lock().take() {
            pump.abort();
        }
        for (_, link) in self.links.lock().drain() {
            if let Some(task) = link.notifications {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn characteristic(uuid: u128, properties: CharPropFlags) -> Characteristic {
        Characteristic {
            uuid: Uuid::from_u128(uuid),
            service_uuid: Uuid::from_u128(0xFFF0),
            properties,
            descriptors: BTreeSet::new(),
        }
    }

    #[test]
    fn test_select_characteristic_by_flags() {
        let set: BTreeSet<_> = [
            characteristic(1, CharPropFlags::READ),
            characteristic(2, CharPropFlags::NOTIFY),
            characteristic(3, CharPropFlags::WRITE_WITHOUT_RESPONSE),
        ]
        .into_iter()
        .collect();

        let write = select_characteristic(
            &set,
            None,
            CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
        )
        .unwrap();
        assert_eq!(write.uuid, Uuid::from_u128(3));

        let notify =
            select_characteristic(&set, None, CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
                .unwrap();
        assert_eq!(notify.uuid, Uuid::from_u128(2));
    }

    #[test]
    fn test_select_characteristic_prefers_explicit_uuid() {
        let set: BTreeSet<_> = [
            characteristic(1, CharPropFlags::WRITE),
            characteristic(4, CharPropFlags::WRITE),
        ]
        .into_iter()
        .collect();

        let chosen = select_characteristic(&set, Some(Uuid::from_u128(4)), CharPropFlags::WRITE)
            .unwrap();
        assert_eq!(chosen.uuid, Uuid::from_u128(4));
        assert!(select_characteristic(&set, Some(Uuid::from_u128(9)), CharPropFlags::WRITE).is_none());
    }

    #[test]
    fn test_zero_address_falls_back_to_id() {
        let hardware = BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
        assert_eq!(
            peripheral_address("hci0/dev_AA_BB_CC_DD_EE_01", hardware).unwrap(),
            Address::parse("AA:BB:CC:DD:EE:01").unwrap()
        );

        let id = "5b1e2f3a-0c4d-4e5f-8a6b-7c8d9e0f1a2b";
        let first = peripheral_address(id, BDAddr::default()).unwrap();
        assert_eq!(first.as_str(), "5B1E2F3A-0C4D-4E5F-8A6B-7C8D9E0F1A2B");
        let other = peripheral_address("00000000-0c4d-4e5f-8a6b-7c8d9e0f1a2b", BDAddr::default());
        assert_ne!(Some(first), other);

        assert!(peripheral_address("hci0/dev_unknown", BDAddr::default()).is_none());
    }

    #[test]
    fn test_cleanup_guard_runs_unless_defused() {
        let runs = Arc::new(AtomicU64::new(0));

        let counter = runs.clone();
        drop(CleanupGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let counter = runs.clone();
        CleanupGuard::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .defuse();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_guard_runs_when_open_is_cancelled() {
        let runs = Arc::new(AtomicU64::new(0));
        let counter = runs.clone();
        let stalled_open = async move {
            let guard = CleanupGuard::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
            std::future::pending::<()>().await;
            guard.defuse();
        };

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), stalled_open).await;
        assert!(result.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_payload() {
        assert_eq!(BleTransportOptions::default().max_payload, None);
        assert_eq!(DEFAULT_ATT_PAYLOAD, 20);
    }
}
