//! Registry of discovered devices.
//!
//! One record per address. Records are only written by merging sightings;
//! readers get value snapshots with the `connected` flag filled in from the
//! connection pool at read time.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

use crate::device::{Address, BluetoothDevice, DeviceClass, Sighting, UNKNOWN_RSSI};
use crate::pool::ConnectionStatus;

#[derive(Debug, Clone)]
struct DeviceRecord {
    name: String,
    rssi: i16,
    device_class: DeviceClass,
    last_seen: DateTime<Utc>,
}

/// Every device seen by any scan.
pub struct DeviceRegistry {
    records: RwLock<HashMap<Address, DeviceRecord>>,
    status: Arc<dyn ConnectionStatus>,
}

impl DeviceRegistry {
    /// Create an empty registry reading connection state from `status`.
    pub fn new(status: Arc<dyn ConnectionStatus>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            status,
        }
    }

    /// Merge a sighting and return the resulting snapshot.
    ///
    /// A missing name never replaces a known one, and a known device class is
    /// never replaced by [`DeviceClass::Unknown`]. A sighting without RSSI
    /// keeps the previous value.
    pub fn merge(&self, sighting: Sighting) -> BluetoothDevice {
        let connected = self.status.is_connected(&sighting.address);

        let record = {
            let mut records = self.records.write();
            let previous = records.get(&sighting.address);

            let record = DeviceRecord {
                name: sighting
                    .name
                    .or_else(|| previous.map(|p| p.name.clone()))
                    .unwrap_or_default(),
                rssi: sighting
                    .rssi
                    .or_else(|| previous.map(|p| p.rssi))
                    .unwrap_or(UNKNOWN_RSSI),
                device_class: match (sighting.device_class, previous) {
                    (DeviceClass::Unknown, Some(p)) => p.device_class,
                    (class, _) => class,
                },
                last_seen: sighting.seen_at,
            };

            records.insert(sighting.address.clone(), record.clone());
            record
        };

        trace!(
            "Merged {} ({}, {} dBm)",
            sighting.address,
            record.name,
            record.rssi
        );

        snapshot(sighting.address, &record, connected)
    }

    /// Snapshot of one device.
    pub fn get(&self, address: &Address) -> Option<BluetoothDevice> {
        let record = self.records.read().get(address).cloned()?;
        let connected = self.status.is_connected(address);
        Some(snapshot(address.clone(), &record, connected))
    }

    /// Snapshots of every known device, strongest signal first.
    pub fn devices(&self) -> Vec<BluetoothDevice> {
        let records: Vec<(Address, DeviceRecord)> = self
            .records
            .read()
            .iter()
            .map(|(a, r)| (a.clone(), r.clone()))
            .collect();

        let mut devices: Vec<BluetoothDevice> = records
            .into_iter()
            .map(|(address, record)| {
                let connected = self.status.is_connected(&address);
                snapshot(address, &record, connected)
            })
            .collect();

        devices.sort_by(|a, b| b.rssi.cmp(&a.rssi).then_with(|| a.address.cmp(&b.address)));
        devices
    }

    /// Snapshots of the known devices that are connected.
    pub fn connected(&self) -> Vec<BluetoothDevice> {
        self.devices().into_iter().filter(|d| d.connected).collect()
    }

    /// Number of known devices.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no device has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Forget every device.
    pub fn clear(&self) {
        self.records.write().clear();
    }
}

fn snapshot(address: Address, record: &DeviceRecord, connected: bool) -> BluetoothDevice {
    BluetoothDevice {
        name: record.name.clone(),
        address,
        rssi: record.rssi,
        device_class: record.device_class,
        connected,
        last_seen: record.last_seen,
    }
}
