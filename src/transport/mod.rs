//! Radio transport abstraction.
//!
//! The manager never talks to a Bluetooth stack directly. Everything goes
//! through the [`Transport`] trait: scanning, opening and closing links,
//! writing, and an event feed carrying discoveries, link state changes and
//! inbound data.
//!
//! Two implementations ship with the crate:
//!
//! - [`BleTransport`] drives a real adapter through btleplug.
//! - [`MemoryTransport`] simulates a radio in memory.

pub mod ble;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use tracing::trace;

use crate::device::{Address, DeviceClass};

pub use ble::{BleTransport, BleTransportOptions};
pub use memory::{MemoryTransport, OpenBehavior};

/// Opaque identifier of an open transport link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle(u64);

impl LinkHandle {
    /// Create a handle from a transport-assigned id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The transport-assigned id.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// A raw advertisement or inquiry result.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    /// Address as reported by the stack, not yet normalised.
    pub address: String,
    /// Advertised name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Radio technology.
    pub device_class: DeviceClass,
}

/// Event produced by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A device was seen while scanning.
    Discovered(Advertisement),
    /// A link finished opening.
    LinkUp {
        /// The new link.
        handle: LinkHandle,
        /// The remote device.
        address: Address,
    },
    /// A link went away without being closed by the manager.
    LinkDown {
        /// The lost link.
        handle: LinkHandle,
        /// Reason reported by the stack.
        reason: String,
    },
    /// Bytes arrived on a link.
    DataArrived {
        /// The link the bytes arrived on.
        handle: LinkHandle,
        /// The payload.
        data: Bytes,
    },
}

/// Stream of transport events.
pub type EventStream = BoxStream<'static, TransportEvent>;

/// Failure reported by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The operation did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The device could not be reached.
    #[error("device {0} is not reachable")]
    Unreachable(String),

    /// The handle does not name an open link.
    #[error("unknown link {0}")]
    UnknownLink(LinkHandle),

    /// The link closed underneath the operation.
    #[error("{0} is closed")]
    LinkClosed(LinkHandle),

    /// Error from the btleplug stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

/// A specialized Result type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// The radio stack as seen by the manager.
///
/// Implementations must be cheap to share behind an `Arc`. `events` may be
/// called any number of times; each call returns an independent stream that
/// receives every event published after the call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start discovery.
    async fn begin_scan(&self) -> TransportResult<()>;

    /// Stop discovery. Stopping an idle radio succeeds.
    async fn stop_scan(&self) -> TransportResult<()>;

    /// Open a link to a device.
    async fn open_link(&self, address: &Address) -> TransportResult<LinkHandle>;

    /// Close a link opened by [`Transport::open_link`].
    async fn close_link(&self, handle: LinkHandle) -> TransportResult<()>;

    /// Write bytes to a link, returning how many were accepted.
    ///
    /// Accepting fewer bytes than offered is not an error; the caller
    /// retries with the remainder.
    async fn write(&self, handle: LinkHandle, data: &[u8]) -> TransportResult<usize>;

    /// Take inbound data that was held back while reads were paused.
    ///
    /// Returns an empty buffer when nothing is held.
    async fn read(&self, handle: LinkHandle) -> TransportResult<Bytes>;

    /// Pause or resume delivery of [`TransportEvent::DataArrived`] for a link.
    ///
    /// While paused, inbound data is held by the transport and handed out by
    /// [`Transport::read`]. Resuming publishes whatever is still held, in
    /// order, before any newer data.
    async fn set_read_paused(&self, handle: LinkHandle, paused: bool) -> TransportResult<()>;

    /// Largest payload a single write on this link can carry.
    fn max_payload_size(&self, handle: LinkHandle) -> usize;

    /// Subscribe to the event feed.
    async fn events(&self) -> TransportResult<EventStream>;

    /// Human-readable description of the radio.
    async fn adapter_info(&self) -> TransportResult<String>;
}

/// Fan-out of transport events to any number of subscribers.
///
/// Subscribers get unbounded queues so no event is ever dropped for a slow
/// reader; closed subscribers are pruned on the next publish.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
}

impl EventHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        rx.boxed()
    }

    /// Deliver an event to every live subscriber.
    pub fn publish(&self, event: TransportEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
        if subscribers.is_empty() {
            trace!("No subscribers for {:?}", event);
        }
    }
}

/// Per-link gate for inbound data honouring paused reads.
///
/// Callers keep one gate per link inside whatever lock protects their link
/// table and publish through it, so data order is preserved across pause and
/// resume.
#[derive(Debug, Default)]
pub struct ReadGate {
    paused: bool,
    held: VecDeque<Bytes>,
}

impl ReadGate {
    /// Publish `data` or hold it if reads are paused.
    pub fn deliver(&mut self, hub: &EventHub, handle: LinkHandle, data: Bytes) {
        if self.paused {
            self.held.push_back(data);
        } else {
            hub.publish(TransportEvent::DataArrived { handle, data });
        }
    }

    /// Take the oldest held chunk, or an empty buffer.
    pub fn take_held(&mut self) -> Bytes {
        self.held.pop_front().unwrap_or_default()
    }

    /// Pause or resume, flushing held data on resume.
    pub fn set_paused(&mut self, hub: &EventHub, handle: LinkHandle, paused: bool) {
        if !paused && !self.held.is_empty() {
            trace!("Releasing {} held bytes on {}", self.held_len(), handle);
        }
        if !paused {
            for data in self.held.drain(..) {
                hub.publish(TransportEvent::DataArrived { handle, data });
            }
        }
        self.paused = paused;
    }

    /// Whether reads are paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Bytes currently held back.
    pub fn held_len(&self) -> usize {
        self.held.iter().map(Bytes::len).sum()
    }
}
