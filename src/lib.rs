//! # blue-manager
//!
//! A multi-device Bluetooth connection manager for Classic and Low Energy
//! devices.
//!
//! ## Features
//!
//! - **Discovery**: Time-bounded scans merged into a device registry
//! - **Connections**: Up to a configurable number of concurrent links, each
//!   driven by its own state machine with retries and exponential backoff
//! - **Data Transfer**: Ordered byte pipes with flow control in both directions
//! - **Framing**: Optional length-prefixed frames with an additive checksum
//!   or CRC-16 trailer
//! - **Activity**: Events and callbacks for every byte sent and received
//! - **Simulation**: An in-memory radio for tests and demos
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blue_manager::{BluetoothManager, ManagerConfig, Result};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = BluetoothManager::with_default_adapter(ManagerConfig::default()).await?;
//!
//!     for device in manager.scan_devices(Duration::from_secs(5)).await? {
//!         println!("Found {}", device);
//!     }
//!
//!     manager.connect_device("AA:BB:CC:DD:EE:01").await?;
//!     manager.send_data("AA:BB:CC:DD:EE:01", b"hello").await?;
//!     let reply = manager.receive_data("AA:BB:CC:DD:EE:01", 256).await?;
//!     println!("Received {} bytes", reply.len());
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Transports
//!
//! The manager talks to the radio through the [`Transport`] trait.
//! [`BleTransport`] drives a real adapter through btleplug;
//! [`MemoryTransport`] simulates devices in memory.
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps. CoreBluetooth hides hardware
//! addresses, so devices are addressed by their peripheral UUID.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for configuration and device records

// Public modules
pub mod callback;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod manager;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use callback::CallbackHandle;
pub use config::{
    BackoffPolicy, ConnectionConfig, ManagerConfig, ScannerConfig, TransferConfig,
    DEFAULT_MAX_CONNECTIONS,
};
pub use connection::{ConnectionEvent, ConnectionEventKind, ConnectionInfo, ConnectionState};
pub use device::{Address, BluetoothDevice, DeviceClass, DeviceFilter, SignalStrength};
pub use error::{Error, ErrorKind, Result};
pub use manager::BluetoothManager;
pub use pool::{ConnectionPool, ConnectionStatus};
pub use protocol::FrameCheck;
pub use registry::DeviceRegistry;
pub use scanner::{ScanSession, Scanner};
pub use transfer::{DataDirection, DataEvent, TransferChannel, TransferStats};
pub use transport::{
    BleTransport, BleTransportOptions, MemoryTransport, Transport, TransportError, TransportEvent,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<BluetoothManager>();
        let _ = std::any::TypeId::of::<ConnectionPool>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<BluetoothDevice>();
        let _ = std::any::TypeId::of::<ConnectionEvent>();
        let _ = std::any::TypeId::of::<MemoryTransport>();
        let _ = std::any::TypeId::of::<DataEvent>();
    }
}
