//! Manager configuration.
//!
//! Configuration is loaded by the embedding application and handed to the
//! manager as plain values. Every section has defaults suitable for a
//! typical BLE central.

use std::time::Duration;

use crate::device::DeviceFilter;
use crate::error::{Error, Result};
use crate::protocol::framing::DEFAULT_MAX_FRAME_LEN;
use crate::protocol::FrameCheck;

/// Default number of concurrent connections, matching common BLE central limits.
pub const DEFAULT_MAX_CONNECTIONS: usize = 7;

/// Top-level configuration for [`BluetoothManager`](crate::BluetoothManager).
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ManagerConfig {
    /// Discovery settings.
    pub scanner: ScannerConfig,
    /// Connection lifecycle settings.
    pub connection: ConnectionConfig,
    /// Data transfer settings.
    pub transfer: TransferConfig,
}

impl ManagerConfig {
    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()?;
        self.transfer.validate()
    }
}

/// Discovery settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ScannerConfig {
    /// Scan duration used when the caller does not pick one.
    pub default_timeout: Duration,
    /// Which device classes are reported.
    pub device_filter: DeviceFilter,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            device_filter: DeviceFilter::All,
        }
    }
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    ///
    /// The delay doubles with each failure and is capped at `max`.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(8),
        }
    }
}

/// Connection lifecycle settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConnectionConfig {
    /// Cap on connections that are connecting, connected or retrying.
    pub max_connections: usize,
    /// Time allowed for a single `open_link`.
    pub connect_timeout: Duration,
    /// Time allowed for `close_link`.
    pub disconnect_timeout: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_retries: u32,
    /// Delay between attempts.
    pub backoff: BackoffPolicy,
    /// Whether a lost link goes through the retry path.
    pub reconnect_on_link_loss: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            reconnect_on_link_loss: true,
        }
    }
}

impl ConnectionConfig {
    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(invalid("connection.max_connections", self.max_connections));
        }
        if self.max_retries == 0 {
            return Err(invalid("connection.max_retries", self.max_retries));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid(
                "connection.connect_timeout",
                format!("{:?}", self.connect_timeout),
            ));
        }
        if self.backoff.base > self.backoff.max {
            return Err(invalid(
                "connection.backoff.base",
                format!("{:?} > max {:?}", self.backoff.base, self.backoff.max),
            ));
        }
        Ok(())
    }
}

/// Data transfer settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TransferConfig {
    /// Pending writes queued per connection.
    pub outbound_capacity: usize,
    /// Received bytes buffered per connection.
    pub inbound_capacity: usize,
    /// Buffered byte count at which transport reads are paused.
    pub inbound_high_watermark: usize,
    /// Buffered byte count at or below which paused reads resume.
    pub inbound_low_watermark: usize,
    /// Largest single transport write, further limited by the link.
    pub max_chunk_size: usize,
    /// How long `send` waits for queue space.
    pub send_timeout: Duration,
    /// How long `receive` waits for data.
    pub receive_timeout: Duration,
    /// Retries for a failed transport write before the link is declared lost.
    pub max_write_retries: u32,
    /// Pause between write retries.
    pub write_retry_delay: Duration,
    /// Trailer used by `send_frame` and expected by `receive_frame`.
    pub frame_check: FrameCheck,
    /// Largest frame payload `receive_frame` accepts.
    pub max_frame_len: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            inbound_capacity: 16 * 1024,
            inbound_high_watermark: 12 * 1024,
            inbound_low_watermark: 4 * 1024,
            max_chunk_size: 512,
            send_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(5),
            max_write_retries: 3,
            write_retry_delay: Duration::from_millis(50),
            frame_check: FrameCheck::Sum8,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl TransferConfig {
    fn validate(&self) -> Result<()> {
        if self.outbound_capacity == 0 {
            return Err(invalid("transfer.outbound_capacity", self.outbound_capacity));
        }
        if self.inbound_capacity == 0 {
            return Err(invalid("transfer.inbound_capacity", self.inbound_capacity));
        }
        if self.max_chunk_size == 0 {
            return Err(invalid("transfer.max_chunk_size", self.max_chunk_size));
        }
        if self.max_frame_len == 0 {
            return Err(invalid("transfer.max_frame_len", self.max_frame_len));
        }
        if self.inbound_high_watermark == 0 || self.inbound_high_watermark > self.inbound_capacity
        {
            return Err(invalid(
                "transfer.inbound_high_watermark",
                self.inbound_high_watermark,
            ));
        }
        if self.inbound_low_watermark >= self.inbound_high_watermark {
            return Err(invalid(
                "transfer.inbound_low_watermark",
                self.inbound_low_watermark,
            ));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: impl ToString) -> Error {
    Error::InvalidConfig {
        name: name.to_string(),
        value: value.to_string(),
    }
}
