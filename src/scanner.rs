//! Device discovery.
//!
//! A scan runs as a background session for a bounded time. Every sighting is
//! normalised, filtered and merged into the registry before it reaches the
//! session stream or any subscriber. Only one session runs at a time.

use futures::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info, trace, warn};

use crate::callback::CallbackHandle;
use crate::config::ScannerConfig;
use crate::device::{Address, BluetoothDevice, DeviceFilter, Sighting};
use crate::error::{Error, Result};
use crate::registry::DeviceRegistry;
use crate::transport::{Advertisement, EventStream, Transport, TransportEvent};

/// Capacity of the discovery broadcast.
const DISCOVERY_CAPACITY: usize = 256;

/// Sightings not yet taken by the session stream, one per address.
#[derive(Default)]
struct SightingBuffer {
    state: Mutex<BufferState>,
    ready: Notify,
}

#[derive(Default)]
struct BufferState {
    order: VecDeque<Address>,
    latest: HashMap<Address, BluetoothDevice>,
    finished: bool,
}

impl SightingBuffer {
    /// Queue a sighting, replacing an unconsumed one for the same address.
    fn push(&self, device: BluetoothDevice) {
        {
            let mut state = self.state.lock();
            let address = device.address.clone();
            if state.latest.insert(address.clone(), device).is_none() {
                state.order.push_back(address);
            }
        }
        self.ready.notify_one();
    }

    fn finish(&self) {
        self.state.lock().finished = true;
        self.ready.notify_one();
    }

    async fn next(&self) -> Option<BluetoothDevice> {
        loop {
            let notified = self.ready.notified();
            {
                let mut state = self.state.lock();
                if let Some(address) = state.order.pop_front() {
                    return state.latest.remove(&address);
                }
                if state.finished {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// A running scan.
///
/// Yields devices as they are seen and ends when the scan times out or is
/// stopped. Dropping the session stops the scan.
pub struct ScanSession {
    devices: BoxStream<'static, BluetoothDevice>,
    stop: Arc<watch::Sender<bool>>,
}

impl ScanSession {
    /// Stop the scan early. The stream ends once buffered sightings are drained.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

impl Stream for ScanSession {
    type Item = BluetoothDevice;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.devices.poll_next_unpin(cx)
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

impl std::fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSession")
            .field("stopped", &*self.stop.borrow())
            .finish()
    }
}

struct SessionControl {
    stop: Arc<watch::Sender<bool>>,
    finished: watch::Receiver<bool>,
}

/// Everything a session task owns.
struct Session {
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    filter: DeviceFilter,
    events: EventStream,
    duration: Duration,
    stop: watch::Receiver<bool>,
    buffer: Arc<SightingBuffer>,
    discovered: broadcast::Sender<BluetoothDevice>,
    active: Arc<AtomicBool>,
    finished: watch::Sender<bool>,
}

impl Session {
    async fn run(mut self) {
        let deadline = tokio::time::sleep(self.duration);
        tokio::pin!(deadline);
        let mut sightings = 0usize;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("Scan timed out after {:?}", self.duration);
                    break;
                }
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        debug!("Scan stopped");
                        break;
                    }
                }
                event = self.events.next() => match event {
                    Some(TransportEvent::Discovered(advertisement)) => {
                        if self.handle(advertisement) {
                            sightings += 1;
                        }
                    }
                    Some(_) => {}
                    None => {
                        warn!("Transport event feed ended during scan");
                        break;
                    }
                },
            }
        }

        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        self.buffer.finish();
        self.active.store(false, Ordering::SeqCst);
        self.finished.send_replace(true);
        info!("Scan finished with {} sightings", sightings);
    }

    /// Merge and forward one advertisement. Returns whether it was kept.
    fn handle(&self, advertisement: Advertisement) -> bool {
        let address = match Address::parse(&advertisement.address) {
            Ok(address) => address,
            Err(_) => {
                trace!("Ignoring advertisement from {}", advertisement.address);
                return false;
            }
        };

        if !self.filter.matches(advertisement.device_class) {
            trace!("Filtered out {} ({})", address, advertisement.device_class);
            return false;
        }

        let device = self.registry.merge(Sighting::new(
            address,
            advertisement.name,
            advertisement.rssi,
            advertisement.device_class,
        ));

        trace!("Discovered {}", device);
        self.buffer.push(device.clone());
        let _ = self.discovered.send(device);
        true
    }
}

/// Runs scan sessions against a transport.
pub struct Scanner {
    transport: Arc<dyn Transport>,
    registry: Arc<DeviceRegistry>,
    config: ScannerConfig,
    active: Arc<AtomicBool>,
    current: Mutex<Option<SessionControl>>,
    discovered: broadcast::Sender<BluetoothDevice>,
    callback_counter: AtomicU64,
}

impl Scanner {
    /// Create a scanner merging into `registry`.
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<DeviceRegistry>,
        config: ScannerConfig,
    ) -> Self {
        let (discovered, _) = broadcast::channel(DISCOVERY_CAPACITY);

        Self {
            transport,
            registry,
            config,
            active: Arc::new(AtomicBool::new(false)),
            current: Mutex::new(None),
            discovered,
            callback_counter: AtomicU64::new(1),
        }
    }

    /// Start a scan lasting `duration`.
    ///
    /// # Errors
    ///
    /// - [`Error::ScanInProgress`] if a scan is already running.
    /// - [`Error::Transport`] if the radio refused to scan.
    pub async fn scan(&self, duration: Duration) -> Result<ScanSession> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::ScanInProgress);
        }

        let events = match self.transport.events().await {
            Ok(events) => events,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(Error::transport("subscribing to discovery events", e));
            }
        };

        if let Err(e) = self.transport.begin_scan().await {
            self.active.store(false, Ordering::SeqCst);
            return Err(Error::transport("starting scan", e));
        }

        info!("Scanning for {:?}", duration);

        let (stop_tx, stop) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let (finished, finished_rx) = watch::channel(false);
        let buffer = Arc::new(SightingBuffer::default());

        *self.current.lock() = Some(SessionControl {
            stop: stop_tx.clone(),
            finished: finished_rx,
        });

        tokio::spawn(
            Session {
                transport: self.transport.clone(),
                registry: self.registry.clone(),
                filter: self.config.device_filter,
                events,
                duration,
                stop,
                buffer: buffer.clone(),
                discovered: self.discovered.clone(),
                active: self.active.clone(),
                finished,
            }
            .run(),
        );

        let devices = stream::unfold(buffer, |buffer| async move {
            let device = buffer.next().await?;
            Some((device, buffer))
        })
        .boxed();

        Ok(ScanSession {
            devices,
            stop: stop_tx,
        })
    }

    /// Start a scan lasting the configured default time.
    pub async fn scan_default(&self) -> Result<ScanSession> {
        self.scan(self.config.default_timeout).await
    }

    /// Stop the running scan and wait for it to wind down.
    ///
    /// Does nothing if no scan is running.
    pub async fn stop_scan(&self) {
        let Some(control) = self.current.lock().take() else {
            return;
        };

        control.stop.send_replace(true);
        let mut finished = control.finished;
        while !*finished.borrow() {
            if finished.changed().await.is_err() {
                break;
            }
        }
    }

    /// Check whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// The configured default scan duration.
    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout
    }

    /// Subscribe to every merged sighting of every scan.
    pub fn subscribe(&self) -> broadcast::Receiver<BluetoothDevice> {
        self.discovered.subscribe()
    }

    /// Register a callback for discovered devices.
    ///
    /// Returns a handle that can be used to unregister the callback.
    pub fn on_discovered<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&BluetoothDevice) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        CallbackHandle::listen(callback_id, "discovery", self.discovered.subscribe(), callback)
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(control) = self.current.get_mut().take() {
            control.stop.send_replace(true);
        }
    }
}
