//! Robot side of the control-plane tunnel.
//!
//! A robot behind NAT keeps one outbound, mutually authenticated
//! WebSocket to the control plane. Over it the robot registers, sends
//! heartbeats, receives job assignments and reports progress and
//! outcomes. Frames are JSON objects tagged by `type`; see [`protocol`].

pub mod config;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod runner;
pub mod state;
pub mod tls;
pub mod tunnel;

pub use config::{TlsConfig, TunnelConfig};
pub use error::TunnelError;
pub use handler::{JobDecision, JobHandler, Reporter};
pub use state::{TunnelEvent, TunnelState};
pub use tunnel::AgentTunnel;
