//! Error types for the blue-manager crate.

use thiserror::Error;

use crate::transport::TransportError;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// A scan session is already running.
    #[error("A scan is already in progress")]
    ScanInProgress,

    /// Every connection attempt failed.
    #[error("Failed to connect to {address} after {attempts} attempts")]
    ConnectFailed {
        /// The device address.
        address: String,
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// The concurrent connection cap has been reached.
    #[error("Maximum connections ({max}) already active")]
    TooManyConnections {
        /// The configured maximum.
        max: usize,
    },

    /// Operation requires a connection but the device is not connected.
    #[error("Device not connected: {address}")]
    NotConnected {
        /// The device address.
        address: String,
    },

    /// The operation was aborted because the connection was torn down.
    #[error("Connection to {address} was torn down")]
    Disconnected {
        /// The device address.
        address: String,
    },

    /// A queue stayed full, or no data arrived, within the allowed time.
    #[error("Backpressure on {address}: {detail}")]
    Backpressure {
        /// The device address.
        address: String,
        /// What timed out.
        detail: String,
    },

    /// Failure reported by the radio transport.
    #[error("Transport error while {context}: {source}")]
    Transport {
        /// What the manager was doing when the transport failed.
        context: String,
        /// The underlying transport failure.
        #[source]
        source: TransportError,
    },

    /// The string is not a Bluetooth device address.
    #[error("Invalid Bluetooth address: {value}")]
    InvalidAddress {
        /// The rejected input.
        value: String,
    },

    /// A configuration value is out of range.
    #[error("Invalid configuration: {name} = {value}")]
    InvalidConfig {
        /// The name of the setting.
        name: String,
        /// The rejected value.
        value: String,
    },

    /// A received frame could not be decoded.
    #[error("Invalid frame: {context}")]
    InvalidFrame {
        /// Description of what was wrong with the frame.
        context: String,
    },

    /// Text could not be decoded into bytes.
    #[error("Invalid encoding: {context}")]
    InvalidEncoding {
        /// Description of what was wrong with the text.
        context: String,
    },

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,
}

impl Error {
    /// Wrap a transport failure with what the manager was doing.
    pub(crate) fn transport(context: impl Into<String>, source: impl Into<TransportError>) -> Self {
        Self::Transport {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ScanInProgress => ErrorKind::ScanInProgress,
            Self::ConnectFailed { .. } => ErrorKind::ConnectFailed,
            Self::TooManyConnections { .. } => ErrorKind::TooManyConnections,
            Self::NotConnected { .. } => ErrorKind::NotConnected,
            Self::Disconnected { .. } => ErrorKind::Disconnected,
            Self::Backpressure { .. } => ErrorKind::Backpressure,
            Self::Transport { .. } => ErrorKind::TransportError,
            Self::InvalidAddress { .. } => ErrorKind::InvalidAddress,
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::InvalidFrame { .. } => ErrorKind::InvalidFrame,
            Self::InvalidEncoding { .. } => ErrorKind::InvalidEncoding,
            Self::BluetoothUnavailable => ErrorKind::BluetoothUnavailable,
        }
    }
}

/// Coarse classification of an [`Error`], cheap to copy and compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ErrorKind {
    /// See [`Error::ScanInProgress`].
    ScanInProgress,
    /// See [`Error::ConnectFailed`].
    ConnectFailed,
    /// See [`Error::TooManyConnections`].
    TooManyConnections,
    /// See [`Error::NotConnected`].
    NotConnected,
    /// See [`Error::Disconnected`].
    Disconnected,
    /// See [`Error::Backpressure`].
    Backpressure,
    /// See [`Error::Transport`].
    TransportError,
    /// See [`Error::InvalidAddress`].
    InvalidAddress,
    /// See [`Error::InvalidConfig`].
    InvalidConfig,
    /// See [`Error::InvalidFrame`].
    InvalidFrame,
    /// See [`Error::InvalidEncoding`].
    InvalidEncoding,
    /// See [`Error::BluetoothUnavailable`].
    BluetoothUnavailable,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ScanInProgress => "ScanInProgress",
            Self::ConnectFailed => "ConnectFailed",
            Self::TooManyConnections => "TooManyConnections",
            Self::NotConnected => "NotConnected",
            Self::Disconnected => "Disconnected",
            Self::Backpressure => "Backpressure",
            Self::TransportError => "TransportError",
            Self::InvalidAddress => "InvalidAddress",
            Self::InvalidConfig => "InvalidConfig",
            Self::InvalidFrame => "InvalidFrame",
            Self::InvalidEncoding => "InvalidEncoding",
            Self::BluetoothUnavailable => "BluetoothUnavailable",
        };
        f.write_str(name)
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
