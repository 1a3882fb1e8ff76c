//! Bluetooth manager facade.
//!
//! [`BluetoothManager`] wires the scanner, the registry and the connection
//! pool to one transport and exposes them through string-addressed calls.

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::callback::CallbackHandle;
use crate::config::ManagerConfig;
use crate::connection::{ConnectionEvent, ConnectionInfo, ConnectionState};
use crate::device::{Address, BluetoothDevice};
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::protocol::encode_frame_with;
use crate::registry::DeviceRegistry;
use crate::scanner::{ScanSession, Scanner};
use crate::transfer::{DataDirection, DataEvent};
use crate::transport::{BleTransport, Transport};

/// Central entry point for discovering devices and talking to them.
///
/// Every call taking an address accepts any spelling [`Address`] parses.
pub struct BluetoothManager {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    scanner: Scanner,
    pool: ConnectionPool,
}

impl BluetoothManager {
    /// Create a manager on top of `transport`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`](crate::Error::InvalidConfig) if the
    /// configuration is unusable.
    pub fn new(transport: Arc<dyn Transport>, config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let pool = ConnectionPool::new(
            transport.clone(),
            config.connection.clone(),
            config.transfer.clone(),
        );
        let registry = Arc::new(DeviceRegistry::new(pool.status()));
        let scanner = Scanner::new(
            transport.clone(),
            registry.clone(),
            config.scanner.clone(),
        );

        debug!(
            "Bluetooth manager ready, up to {} connections",
            config.connection.max_connections
        );

        Ok(Self {
            config,
            transport,
            registry,
            scanner,
            pool,
        })
    }

    /// Create a manager on the first Bluetooth adapter of the system.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_default_adapter(config: ManagerConfig) -> Result<Self> {
        let transport = BleTransport::new().await?;
        Self::new(Arc::new(transport), config)
    }

    /// The configuration in use.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Description of the radio, such as the adapter name.
    pub async fn adapter_info(&self) -> Result<String> {
        self.transport
            .adapter_info()
            .await
            .map_err(|e| Error::transport("reading adapter info", e))
    }

    // === Discovery ===

    /// Scan for `timeout` and return every device seen, in discovery order.
    ///
    /// Each device appears once, with its latest sighting.
    ///
    /// # Errors
    ///
    /// - [`Error::ScanInProgress`](crate::Error::ScanInProgress) if a scan is running.
    /// - [`Error::Transport`](crate::Error::Transport) if the radio refused to scan.
    pub async fn scan_devices(&self, timeout: Duration) -> Result<Vec<BluetoothDevice>> {
        let mut session = self.scanner.scan(timeout).await?;

        let mut order = Vec::new();
        let mut latest = HashMap::new();
        while let Some(device) = session.next().await {
            let address = device.address.clone();
            if latest.insert(address.clone(), device).is_none() {
                order.push(address);
            }
        }

        info!("Scan found {} devices", order.len());
        Ok(order
            .into_iter()
            .filter_map(|address| latest.remove(&address))
            .collect())
    }

    /// Start a scan and stream sightings as they arrive.
    pub async fn scan_stream(&self, timeout: Duration) -> Result<ScanSession> {
        self.scanner.scan(timeout).await
    }

    /// Stop the running scan, if any.
    pub async fn stop_scan(&self) {
        self.scanner.stop_scan().await;
    }

    /// Check whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// The configured default scan duration.
    pub fn default_scan_timeout(&self) -> Duration {
        self.scanner.default_timeout()
    }

    /// Every device seen so far, strongest signal first.
    pub fn devices(&self) -> Vec<BluetoothDevice> {
        self.registry.devices()
    }

    /// One device, if it has been seen.
    pub fn device(&self, address: &str) -> Result<Option<BluetoothDevice>> {
        let address = Address::parse(address)?;
        Ok(self.registry.get(&address))
    }

    /// Seen devices that are connected right now.
    pub fn connected_devices(&self) -> Vec<BluetoothDevice> {
        self.registry.connected()
    }

    /// Subscribe to every sighting.
    pub fn subscribe_discovered(&self) -> broadcast::Receiver<BluetoothDevice> {
        self.scanner.subscribe()
    }

    /// Register a callback for every sighting.
    pub fn on_device_discovered<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&BluetoothDevice) + Send + Sync + 'static,
    {
        self.scanner.on_discovered(callback)
    }

    // === Connections ===

    /// Connect to a device and wait until the link is up.
    ///
    /// Devices do not need to have been scanned first. Connecting to a
    /// device that is already connected or connecting joins that connection.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAddress`](crate::Error::InvalidAddress) for a malformed address.
    /// - [`Error::TooManyConnections`](crate::Error::TooManyConnections) at the cap.
    /// - [`Error::ConnectFailed`](crate::Error::ConnectFailed) once retries are used up.
    pub async fn connect_device(&self, address: &str) -> Result<()> {
        let address = Address::parse(address)?;
        self.pool.connect(&address).await
    }

    /// Disconnect from a device. Succeeds if it is not connected.
    pub async fn disconnect_device(&self, address: &str) -> Result<()> {
        let address = Address::parse(address)?;
        self.pool.disconnect(&address).await
    }

    /// Check whether a device is connected.
    pub fn is_connected(&self, address: &str) -> bool {
        Address::parse(address)
            .map(|a| self.pool.is_connected(&a))
            .unwrap_or(false)
    }

    /// Current connection state of a device.
    pub fn connection_state(&self, address: &str) -> Result<ConnectionState> {
        let address = Address::parse(address)?;
        Ok(self.pool.state(&address))
    }

    /// Details of a device's connection, if it has one.
    pub fn connection_info(&self, address: &str) -> Result<Option<ConnectionInfo>> {
        let address = Address::parse(address)?;
        Ok(self.pool.info(&address))
    }

    /// Details of every connection.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.pool.connections()
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.pool.subscribe()
    }

    /// Register a callback for connection lifecycle events.
    pub fn on_connection_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.pool.on_event(callback)
    }

    // === Data ===

    /// Queue bytes for a connected device.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`](crate::Error::NotConnected) unless connected.
    /// - [`Error::Backpressure`](crate::Error::Backpressure) if the queue stayed full.
    pub async fn send_data(&self, address: &str, data: &[u8]) -> Result<()> {
        let address = Address::parse(address)?;
        self.pool.send(&address, data).await
    }

    /// Receive up to `max_len` bytes, waiting up to the configured receive timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`](crate::Error::NotConnected) unless connected.
    /// - [`Error::Backpressure`](crate::Error::Backpressure) if nothing arrived in time.
    pub async fn receive_data(&self, address: &str, max_len: usize) -> Result<Vec<u8>> {
        let address = Address::parse(address)?;
        self.pool.receive(&address, max_len).await
    }

    /// Receive up to `max_len` bytes, waiting up to `timeout`.
    pub async fn receive_data_timeout(
        &self,
        address: &str,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let address = Address::parse(address)?;
        self.pool
            .receive_with_timeout(&address, max_len, timeout)
            .await
    }

    /// Send a string as UTF-8.
    pub async fn send_text(&self, address: &str, text: &str) -> Result<()> {
        self.send_data(address, text.as_bytes()).await
    }

    /// Receive up to `max_len` bytes and decode them as UTF-8.
    ///
    /// Invalid sequences are replaced with U+FFFD.
    pub async fn receive_text(&self, address: &str, max_len: usize) -> Result<String> {
        let data = self.receive_data(address, max_len).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Send `payload` as one length-prefixed frame.
    ///
    /// The trailer is the configured [`FrameCheck`](crate::protocol::FrameCheck).
    pub async fn send_frame(&self, address: &str, payload: &[u8]) -> Result<()> {
        let frame = encode_frame_with(payload, self.config.transfer.frame_check)?;
        self.send_data(address, &frame).await
    }

    /// Receive one frame sent with [`send_frame`](Self::send_frame).
    ///
    /// Bytes past the end of the frame are kept for the next call. A partial
    /// frame is discarded when its link goes away.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidFrame`](crate::Error::InvalidFrame) for a corrupt frame.
    /// - [`Error::Backpressure`](crate::Error::Backpressure) if no complete
    ///   frame arrived within `timeout`.
    pub async fn receive_frame(&self, address: &str, timeout: Duration) -> Result<Vec<u8>> {
        let address = Address::parse(address)?;
        self.pool.receive_frame(&address, timeout).await
    }

    /// Subscribe to bytes sent to and received from every device.
    pub fn subscribe_data_events(&self) -> broadcast::Receiver<DataEvent> {
        self.pool.subscribe_data()
    }

    /// Register a callback for bytes received from any device.
    pub fn on_data_received<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Address, &[u8]) + Send + Sync + 'static,
    {
        self.on_data(DataDirection::Received, callback)
    }

    /// Register a callback for bytes written to any device.
    pub fn on_data_sent<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Address, &[u8]) + Send + Sync + 'static,
    {
        self.on_data(DataDirection::Sent, callback)
    }

    fn on_data<F>(&self, direction: DataDirection, callback: F) -> CallbackHandle
    where
        F: Fn(&Address, &[u8]) + Send + Sync + 'static,
    {
        self.pool.on_data(move |event| {
            if event.direction == direction {
                callback(&event.address, &event.data);
            }
        })
    }

    // === Lifecycle ===

    /// Stop scanning and disconnect every device.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down Bluetooth manager");
        self.scanner.stop_scan().await;
        self.pool.shutdown().await
    }

    /// The device registry.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// The connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}
