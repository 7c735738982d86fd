//! Tunnel error taxonomy.

use fleet_core::error::CoreError;

use crate::tls::TlsError;

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Connect, send or receive failed at the transport level.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// A frame could not be encoded, or too many could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("No register_ack within {secs}s")]
    RegistrationTimeout { secs: u64 },

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Tunnel is not connected")]
    NotConnected,

    #[error("Invalid tunnel configuration: {0}")]
    InvalidConfig(#[from] CoreError),
}

impl TunnelError {
    /// Whether `run_forever` should keep trying after this error. Bad
    /// configuration and TLS material fail the same way every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidConfig(_) | Self::Tls(_))
    }
}
