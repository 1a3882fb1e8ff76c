//! Connection lifecycle.
//!
//! Every connected (or connecting) device is owned by one
//! [`machine`](self::machine) task. The task receives connect and disconnect
//! commands, watches the transport's event feed for its link, retries failed
//! attempts with backoff and publishes a [`Snapshot`] of its state that the
//! pool reads without talking to the task.

mod machine;
mod state;

pub use state::ConnectionState;

pub(crate) use machine::{Command, Machine, MachineParts, Reply};

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

use crate::device::Address;
use crate::error::ErrorKind;
use crate::transfer::TransferChannel;
use crate::transport::LinkHandle;

/// What happened to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionEventKind {
    /// The state machine moved between two states.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// The link is up and data can flow.
    Connected,
    /// Every attempt failed; the connection was dropped.
    ConnectFailed {
        /// Attempts made.
        attempts: u32,
    },
    /// The link went away without being asked to.
    LinkLost,
    /// The connection was torn down and dropped.
    Disconnected,
}

/// Lifecycle event for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionEvent {
    /// The device.
    pub address: Address,
    /// What happened.
    pub kind: ConnectionEventKind,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConnectionEventKind::StateChanged { from, to } => {
                write!(f, "{}: {} -> {}", self.address, from, to)
            }
            ConnectionEventKind::Connected => write!(f, "{}: connected", self.address),
            ConnectionEventKind::ConnectFailed { attempts } => {
                write!(f, "{}: connect failed after {} attempts", self.address, attempts)
            }
            ConnectionEventKind::LinkLost => write!(f, "{}: link lost", self.address),
            ConnectionEventKind::Disconnected => write!(f, "{}: disconnected", self.address),
        }
    }
}

/// State published by a machine after every change.
#[derive(Debug, Clone, Default)]
pub(crate) struct Snapshot {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_error: Option<ErrorKind>,
    pub link: Option<LinkHandle>,
    pub channel: Option<Arc<TransferChannel>>,
    pub connected_since: Option<DateTime<Utc>>,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ConnectionInfo {
    /// The device.
    pub address: Address,
    /// Current state.
    pub state: ConnectionState,
    /// Failed attempts since the last successful connect.
    pub retry_count: u32,
    /// Kind of the most recent failure.
    pub last_error: Option<ErrorKind>,
    /// Id of the open link, while connected or disconnecting.
    pub link_id: Option<u64>,
    /// When the current link came up.
    pub connected_since: Option<DateTime<Utc>>,
    /// Bytes written on the current link.
    pub bytes_sent: u64,
    /// Bytes received on the current link.
    pub bytes_received: u64,
}

impl ConnectionInfo {
    pub(crate) fn from_snapshot(address: Address, snapshot: &Snapshot) -> Self {
        let (bytes_sent, bytes_received) = snapshot
            .channel
            .as_ref()
            .map(|c| (c.stats().bytes_sent(), c.stats().bytes_received()))
            .unwrap_or_default();

        Self {
            address,
            state: snapshot.state,
            retry_count: snapshot.retry_count,
            last_error: snapshot.last_error,
            link_id: snapshot.link.map(|h| h.id()),
            connected_since: snapshot.connected_since,
            bytes_sent,
            bytes_received,
        }
    }
}
