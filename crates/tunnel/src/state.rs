//! Connection state machine and the events a tunnel broadcasts.

use std::fmt;

use serde::Serialize;

/// Where the tunnel is in its connection lifecycle.
///
/// ```text
/// disconnected -> connecting -> connected -> authenticating -> registered
///       ^                                                          |
///       +------------------- disconnect / close ------------------+
///
/// any --(transport failure)--> error --(run_forever)--> reconnecting -> connecting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Registered,
    Reconnecting,
    Error,
}

impl TunnelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Registered => "registered",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    /// A transport exists, whether or not registration has finished.
    pub fn has_transport(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticating | Self::Registered)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the hosting process may want to log or react to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TunnelEvent {
    StateChanged { state: TunnelState },

    /// The control plane acknowledged registration.
    Registered { robot_id: String },

    /// A job assignment arrived.
    JobAssigned { job_id: String },

    /// An assignment was declined, with the reason sent back.
    JobRejected { job_id: String, reason: String },

    /// The control plane sent an `error` frame.
    ControlPlaneError { message: String },

    /// The transport closed or failed.
    Disconnected { reason: String },

    /// `run_forever` will try again after `delay_ms`. `attempt` counts
    /// failures since the last successful registration.
    Reconnecting { attempt: u32, delay_ms: u64 },
}
