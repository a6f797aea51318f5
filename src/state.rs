//! Connection state shared by the engine and the signal client

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a broken session is recovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    /// Resume signaling and restart ICE on the existing peer connections
    Quick,
    /// Tear everything down and run the whole connect sequence again
    Full,
}

/// Why a session ended up disconnected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Disconnect requested by the user
    User,
    /// Network or protocol failure
    NetworkError(Error),
}

impl DisconnectReason {
    pub fn is_network_error(&self) -> bool {
        matches!(self, DisconnectReason::NetworkError(_))
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            DisconnectReason::NetworkError(e) => Some(e),
            DisconnectReason::User => None,
        }
    }
}

/// Lifecycle state of a connection
///
/// A disconnect reason can only be attached to `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    DisconnectedWith(DisconnectReason),
    Connecting,
    Reconnecting,
    Connected,
}

impl ConnectionState {
    pub fn disconnected(reason: Option<DisconnectReason>) -> Self {
        match reason {
            Some(reason) => ConnectionState::DisconnectedWith(reason),
            None => ConnectionState::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_reconnecting(&self) -> bool {
        matches!(self, ConnectionState::Reconnecting)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::DisconnectedWith(_)
        )
    }

    pub fn reason(&self) -> Option<&DisconnectReason> {
        match self {
            ConnectionState::DisconnectedWith(reason) => Some(reason),
            _ => None,
        }
    }

    /// Same variant, ignoring any attached reason
    pub fn same_kind(&self, other: &ConnectionState) -> bool {
        (self.is_disconnected() && other.is_disconnected())
            || std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Disconnected state for a cleanup, keeping the first recorded reason
    pub(crate) fn after_cleanup(&self, reason: Option<DisconnectReason>) -> Self {
        match self {
            ConnectionState::DisconnectedWith(existing) => {
                ConnectionState::DisconnectedWith(existing.clone())
            }
            _ => ConnectionState::disconnected(reason),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::DisconnectedWith(DisconnectReason::User) => {
                write!(f, "disconnected (user)")
            }
            ConnectionState::DisconnectedWith(DisconnectReason::NetworkError(e)) => {
                write!(f, "disconnected ({})", e)
            }
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}
