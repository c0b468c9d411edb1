//! Connection lifecycle state.

use serde::Serialize;
use std::fmt;

/// Where the broker connection currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection; the resting state
    #[default]
    Disconnected,
    /// A connection attempt is in flight
    Connecting,
    /// The broker accepted the session
    Connected,
    /// The transport reported a failure
    Errored,
}

impl ConnectionState {
    /// Whether a connection attempt is in flight or established
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }

    /// Lowercase label used in logs and terminal output
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Errored => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
