//! Connection pool.
//!
//! The pool is the keyed table of connection machines. It enforces the
//! concurrent connection cap, routes commands to the machine owning an
//! address and serves reads of connection state from the machines' published
//! snapshots. The table lock is only ever held for synchronous bookkeeping.

use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::callback::CallbackHandle;
use crate::config::{ConnectionConfig, TransferConfig};
use crate::connection::{
    Command, ConnectionEvent, ConnectionInfo, ConnectionState, Machine, MachineParts, Reply,
    Snapshot,
};
use crate::device::Address;
use crate::error::{Error, Result};
use crate::transfer::{DataEvent, TransferChannel};
use crate::transport::Transport;

/// Capacity of the lifecycle event broadcast.
const EVENT_CAPACITY: usize = 256;

/// Capacity of the data activity broadcast.
const DATA_EVENT_CAPACITY: usize = 1024;

/// Answers whether a device is connected, for code that must not depend on
/// the pool itself.
pub trait ConnectionStatus: Send + Sync {
    /// Check whether `address` is connected right now.
    fn is_connected(&self, address: &Address) -> bool;
}

pub(crate) struct ConnectionEntry {
    id: u64,
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ConnectionEntry {
    fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }
}

/// Shared table of live machines, keyed by address.
#[derive(Clone, Default)]
pub(crate) struct ConnectionTable {
    inner: Arc<RwLock<HashMap<Address, ConnectionEntry>>>,
}

impl ConnectionTable {
    /// Remove the entry for `address` if it still belongs to machine `id`.
    pub(crate) fn remove_if(&self, address: &Address, id: u64) {
        let mut table = self.inner.write();
        if table.get(address).map(|entry| entry.id) == Some(id) {
            table.remove(address);
        }
    }

    fn snapshot(&self, address: &Address) -> Option<Snapshot> {
        self.inner
            .read()
            .get(address)
            .map(|entry| entry.snapshot.borrow().clone())
    }

    fn commands(&self, address: &Address) -> Option<mpsc::Sender<Command>> {
        self.inner
            .read()
            .get(address)
            .filter(|entry| entry.state() != ConnectionState::Idle)
            .map(|entry| entry.commands.clone())
    }
}

impl ConnectionStatus for ConnectionTable {
    fn is_connected(&self, address: &Address) -> bool {
        self.inner
            .read()
            .get(address)
            .map(|entry| entry.state().is_connected())
            .unwrap_or(false)
    }
}

/// Outcome of looking up an address under the table lock.
enum Slot {
    Ready,
    Join(mpsc::Sender<Command>),
    Started(oneshot::Receiver<Result<()>>),
}

/// Table of per-device connection machines.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    connection: ConnectionConfig,
    transfer: TransferConfig,
    table: ConnectionTable,
    events: broadcast::Sender<ConnectionEvent>,
    activity: broadcast::Sender<DataEvent>,
    next_id: AtomicU64,
    callback_counter: AtomicU64,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new(
        transport: Arc<dyn Transport>,
        connection: ConnectionConfig,
        transfer: TransferConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (activity, _) = broadcast::channel(DATA_EVENT_CAPACITY);

        Self {
            transport,
            connection,
            transfer,
            table: ConnectionTable::default(),
            events,
            activity,
            next_id: AtomicU64::new(1),
            callback_counter: AtomicU64::new(1),
        }
    }

    /// Connect to a device, or join the connection already in progress.
    ///
    /// Resolves once the device is connected.
    ///
    /// # Errors
    ///
    /// - [`Error::TooManyConnections`] if the cap is reached; nothing is created.
    /// - [`Error::ConnectFailed`] once every attempt failed.
    /// - [`Error::Disconnected`] if a disconnect cancelled the attempt.
    pub async fn connect(&self, address: &Address) -> Result<()> {
        loop {
            let slot = self.claim(address)?;

            let outcome = match slot {
                Slot::Ready => return Ok(()),
                Slot::Started(outcome) => outcome,
                Slot::Join(commands) => {
                    let (reply, outcome) = oneshot::channel();
                    if commands.send(Command::Connect { reply }).await.is_err() {
                        // The machine finished between the lookup and the send.
                        continue;
                    }
                    outcome
                }
            };

            return outcome.await.unwrap_or_else(|_| {
                Err(Error::Disconnected {
                    address: address.to_string(),
                })
            });
        }
    }

    /// Decide under the table lock whether to join, start or refuse.
    fn claim(&self, address: &Address) -> Result<Slot> {
        let mut table = self.table.inner.write();

        if let Some(entry) = table.get(address) {
            match entry.state() {
                ConnectionState::Connected => return Ok(Slot::Ready),
                ConnectionState::Idle => {}
                _ => return Ok(Slot::Join(entry.commands.clone())),
            }
        }

        let occupied = table
            .values()
            .filter(|entry| entry.state().occupies_slot())
            .count();
        if occupied >= self.connection.max_connections {
            warn!(
                "Refusing connection to {}: {} of {} slots in use",
                address, occupied, self.connection.max_connections
            );
            return Err(Error::TooManyConnections {
                max: self.connection.max_connections,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, outcome): (Reply, _) = oneshot::channel();
        let (commands, snapshot) = Machine::start(
            MachineParts {
                id,
                address: address.clone(),
                transport: self.transport.clone(),
                connection: self.connection.clone(),
                transfer: self.transfer.clone(),
                events: self.events.clone(),
                activity: self.activity.clone(),
                table: self.table.clone(),
            },
            reply,
        );

        info!("Connecting to {}", address);
        table.insert(
            address.clone(),
            ConnectionEntry {
                id,
                commands,
                snapshot,
            },
        );

        Ok(Slot::Started(outcome))
    }

    /// Disconnect from a device.
    ///
    /// Succeeds immediately if the device has no connection. Cancels an
    /// attempt in progress.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if closing the link failed; the
    /// connection is dropped regardless.
    pub async fn disconnect(&self, address: &Address) -> Result<()> {
        let Some(commands) = self.table.commands(address) else {
            debug!("Disconnect from {} ignored, not connected", address);
            return Ok(());
        };

        let (reply, outcome) = oneshot::channel();
        if commands.send(Command::Disconnect { reply }).await.is_err() {
            return Ok(());
        }

        outcome.await.unwrap_or(Ok(()))
    }

    /// Queue data for a connected device.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] unless the device is connected.
    /// - [`Error::Backpressure`] if the outbound queue stayed full.
    /// - [`Error::Disconnected`] if the connection went away meanwhile.
    pub async fn send(&self, address: &Address, data: &[u8]) -> Result<()> {
        self.channel(address)?.send(data).await
    }

    /// Receive up to `max_len` bytes, waiting up to the configured receive timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] unless the device is connected.
    /// - [`Error::Backpressure`] if nothing arrived in time.
    /// - [`Error::Disconnected`] if the connection went away meanwhile.
    pub async fn receive(&self, address: &Address, max_len: usize) -> Result<Vec<u8>> {
        self.receive_with_timeout(address, max_len, self.transfer.receive_timeout)
            .await
    }

    /// Receive up to `max_len` bytes, waiting up to `wait`.
    pub async fn receive_with_timeout(
        &self,
        address: &Address,
        max_len: usize,
        wait: Duration,
    ) -> Result<Vec<u8>> {
        let data = self.channel(address)?.receive(max_len, wait).await?;
        Ok(data.to_vec())
    }

    /// Receive one frame sent with the configured frame check.
    ///
    /// Partial frames belong to the link they arrived on and are discarded
    /// with it.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] unless the device is connected.
    /// - [`Error::InvalidFrame`] for a corrupt frame.
    /// - [`Error::Backpressure`] if no complete frame arrived in time.
    pub async fn receive_frame(&self, address: &Address, wait: Duration) -> Result<Vec<u8>> {
        let payload = self.channel(address)?.receive_frame(wait).await?;
        Ok(payload.to_vec())
    }

    /// Current state of a device's connection; `Idle` if it has none.
    pub fn state(&self, address: &Address) -> ConnectionState {
        self.table
            .snapshot(address)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Check whether a device is connected.
    pub fn is_connected(&self, address: &Address) -> bool {
        self.table.is_connected(address)
    }

    /// Details of a device's connection.
    pub fn info(&self, address: &Address) -> Option<ConnectionInfo> {
        self.table
            .snapshot(address)
            .map(|s| ConnectionInfo::from_snapshot(address.clone(), &s))
    }

    /// Details of every connection, sorted by address.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .table
            .inner
            .read()
            .iter()
            .map(|(address, entry)| {
                ConnectionInfo::from_snapshot(address.clone(), &entry.snapshot.borrow())
            })
            .collect();
        infos.sort_by(|a, b| a.address.cmp(&b.address));
        infos
    }

    /// Number of connections counting against the cap.
    pub fn active_count(&self) -> usize {
        self.table
            .inner
            .read()
            .values()
            .filter(|entry| entry.state().occupies_slot())
            .count()
    }

    /// The configured connection cap.
    pub fn max_connections(&self) -> usize {
        self.connection.max_connections
    }

    /// Subscribe to lifecycle events of every connection.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Register a callback for lifecycle events.
    ///
    /// Returns a handle that can be used to unregister the callback.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        CallbackHandle::listen(callback_id, "connection", self.events.subscribe(), callback)
    }

    /// Subscribe to bytes sent and received on every connection.
    pub fn subscribe_data(&self) -> broadcast::Receiver<DataEvent> {
        self.activity.subscribe()
    }

    /// Register a callback for bytes sent and received.
    pub fn on_data<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&DataEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        CallbackHandle::listen(callback_id, "data", self.activity.subscribe(), callback)
    }

    /// Disconnect every device concurrently.
    ///
    /// Returns the first error, after every disconnect has finished.
    pub async fn shutdown(&self) -> Result<()> {
        let addresses: Vec<Address> = self.table.inner.read().keys().cloned().collect();
        info!("Shutting down {} connections", addresses.len());

        let results = join_all(addresses.iter().map(|a| self.disconnect(a))).await;
        results.into_iter().collect()
    }

    /// A status view for the registry.
    pub(crate) fn status(&self) -> Arc<dyn ConnectionStatus> {
        Arc::new(self.table.clone())
    }

    fn channel(&self, address: &Address) -> Result<Arc<TransferChannel>> {
        self.table
            .snapshot(address)
            .filter(|s| s.state.is_connected())
            .and_then(|s| s.channel)
            .ok_or_else(|| Error::NotConnected {
                address: address.to_string(),
            })
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        // Dropping the command senders makes every machine tear down.
        self.table.inner.write().clear();
    }
}
