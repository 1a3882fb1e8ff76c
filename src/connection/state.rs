//! Connection states and the legal transitions between them.

use std::fmt;

/// Lifecycle state of one device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link and no attempt in progress.
    #[default]
    Idle,
    /// A link is being opened.
    Connecting,
    /// The link is up and data can flow.
    Connected,
    /// The link is being closed.
    Disconnecting,
    /// The last attempt failed and a retry may follow.
    Failed,
}

impl ConnectionState {
    /// Check whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Connected, Failed)
                | (Disconnecting, Idle)
                | (Failed, Connecting)
                | (Failed, Idle)
        )
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check whether a connection in this state counts against the cap.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}
