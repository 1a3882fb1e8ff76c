//! Device records.
//!
//! A [`BluetoothDevice`] is a value snapshot of what the registry knows about
//! one device. Records are replaced wholesale on every sighting; the
//! `connected` flag is filled in from the connection pool when a snapshot is
//! taken and is never stored.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// RSSI assumed for a device whose first sighting carried no signal strength.
pub const UNKNOWN_RSSI: i16 = -100;

/// A Bluetooth device address in canonical `XX:XX:XX:XX:XX:XX` form.
///
/// Parsing accepts `:` or `-` separators, or twelve bare hex digits, in any
/// case. The canonical form is upper case with `:` separators, so two
/// spellings of the same address compare equal once parsed.
///
/// Platforms that hide hardware addresses (macOS) identify peripherals by a
/// UUID instead. A hyphenated UUID is accepted as-is and canonicalised to
/// upper case.
///
/// ```
/// use blue_manager::Address;
///
/// let a: Address = "aa-bb-cc-dd-ee-01".parse().unwrap();
/// let b: Address = "AABBCCDDEE01".parse().unwrap();
/// assert_eq!(a, b);
/// assert_eq!(a.as_str(), "AA:BB:CC:DD:EE:01");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct Address(String);

impl Address {
    /// Parse an address, see the type-level docs for accepted spellings.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress {
            value: value.to_string(),
        };

        let trimmed = value.trim();
        if trimmed.len() == UUID_LEN {
            return parse_uuid(trimmed).ok_or_else(invalid);
        }

        let digits: Vec<u8> = match trimmed.len() {
            12 => trimmed.bytes().collect(),
            17 => {
                let bytes = trimmed.as_bytes();
                let separator = bytes[2];
                if separator != b':' && separator != b'-' {
                    return Err(invalid());
                }
                let mut digits = Vec::with_capacity(12);
                for (i, &b) in bytes.iter().enumerate() {
                    if i % 3 == 2 {
                        if b != separator {
                            return Err(invalid());
                        }
                    } else {
                        digits.push(b);
                    }
                }
                digits
            }
            _ => return Err(invalid()),
        };

        if !digits.iter().all(u8::is_ascii_hexdigit) {
            return Err(invalid());
        }

        let mut canonical = String::with_capacity(17);
        for (i, pair) in digits.chunks(2).enumerate() {
            if i > 0 {
                canonical.push(':');
            }
            canonical.push(pair[0].to_ascii_uppercase() as char);
            canonical.push(pair[1].to_ascii_uppercase() as char);
        }

        Ok(Self(canonical))
    }

    /// The canonical textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a platform UUID rather than a hardware address.
    pub fn is_uuid(&self) -> bool {
        self.0.len() == UUID_LEN
    }
}

/// Length of a hyphenated UUID.
const UUID_LEN: usize = 36;

fn parse_uuid(value: &str) -> Option<Address> {
    for (i, b) in value.bytes().enumerate() {
        let valid = match i {
            8 | 13 | 18 | 23 => b == b'-',
            _ => b.is_ascii_hexdigit(),
        };
        if !valid {
            return None;
        }
    }
    Some(Address(value.to_ascii_uppercase()))
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// Radio technology a device was seen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceClass {
    /// BR/EDR (Classic) device.
    Classic,
    /// Bluetooth Low Energy device.
    Ble,
    /// Not reported by the transport.
    #[default]
    Unknown,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classic => write!(f, "Classic"),
            Self::Ble => write!(f, "BLE"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Which devices a scan reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceFilter {
    /// Every device.
    #[default]
    All,
    /// Only BLE devices.
    Ble,
    /// Only Classic devices.
    Classic,
}

impl DeviceFilter {
    /// Check whether a device of the given class passes this filter.
    pub fn matches(&self, class: DeviceClass) -> bool {
        match self {
            Self::All => true,
            Self::Ble => class == DeviceClass::Ble,
            Self::Classic => class == DeviceClass::Classic,
        }
    }
}

/// Coarse description of signal quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SignalStrength {
    /// Below -90 dBm.
    Weak,
    /// -90 to -71 dBm.
    Fair,
    /// -70 to -51 dBm.
    Good,
    /// -50 dBm or stronger.
    Excellent,
}

impl SignalStrength {
    /// Classify an RSSI reading.
    pub fn from_rssi(rssi: i16) -> Self {
        match rssi {
            r if r >= -50 => Self::Excellent,
            r if r >= -70 => Self::Good,
            r if r >= -90 => Self::Fair,
            _ => Self::Weak,
        }
    }
}

/// Snapshot of a known device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BluetoothDevice {
    /// Advertised name, empty if unresolved.
    pub name: String,
    /// Unique identity key.
    pub address: Address,
    /// Signal strength of the latest sighting in dBm.
    pub rssi: i16,
    /// Radio technology.
    pub device_class: DeviceClass,
    /// Whether the device is connected right now.
    pub connected: bool,
    /// Time of the latest sighting.
    pub last_seen: DateTime<Utc>,
}

impl BluetoothDevice {
    /// Describe the signal quality of the latest sighting.
    pub fn signal_strength(&self) -> SignalStrength {
        SignalStrength::from_rssi(self.rssi)
    }

    /// Name for display, falling back to the address when unresolved.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            self.address.as_str()
        } else {
            &self.name
        }
    }
}

impl fmt::Display for BluetoothDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) {} dBm{}",
            self.display_name(),
            self.address,
            self.rssi,
            if self.connected { " [connected]" } else { "" }
        )
    }
}

/// One normalised discovery result, ready to be merged into the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    /// Device address.
    pub address: Address,
    /// Name, if the advertisement carried one.
    pub name: Option<String>,
    /// RSSI in dBm, if reported. Always zero or negative.
    pub rssi: Option<i16>,
    /// Radio technology.
    pub device_class: DeviceClass,
    /// When the sighting happened.
    pub seen_at: DateTime<Utc>,
}

impl Sighting {
    /// Normalise raw advertisement fields.
    ///
    /// Some platforms report RSSI as a positive magnitude; those values are
    /// negated. Blank names are treated as missing.
    pub fn new(
        address: Address,
        name: Option<String>,
        rssi: Option<i16>,
        device_class: DeviceClass,
    ) -> Self {
        Self {
            address,
            name: name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            rssi: rssi.map(|r| if r > 0 { r.saturating_neg() } else { r }),
            device_class,
            seen_at: Utc::now(),
        }
    }
}
