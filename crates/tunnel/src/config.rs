//! Tunnel configuration.

use std::path::PathBuf;
use std::time::Duration;

use fleet_core::backoff::BackoffConfig;
use fleet_core::capabilities::{
    parse_list, robot_name_from_host, validate_robot_name, RobotCapabilities, RobotType,
};
use fleet_core::env;
use fleet_core::error::CoreError;
use fleet_core::types::{generate_robot_id, RobotId};

/// Default interval between heartbeat frames.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default wait for `register_ack` after sending `register`.
pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on the WebSocket + TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-certificate material for the mutually authenticated tunnel.
///
/// All three paths are required for `wss://` unless `allow_insecure` is
/// set, which also permits plain `ws://` for development.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA certificate (PEM) that signed the control plane's certificate.
    pub ca_cert_path: Option<PathBuf>,
    /// This robot's certificate (PEM), presented during the handshake.
    pub client_cert_path: Option<PathBuf>,
    /// Private key (PEM) matching `client_cert_path`.
    pub client_key_path: Option<PathBuf>,
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// All three files are configured.
    pub fn is_complete(&self) -> bool {
        self.ca_cert_path.is_some()
            && self.client_cert_path.is_some()
            && self.client_key_path.is_some()
    }
}

/// Everything an [`AgentTunnel`](crate::tunnel::AgentTunnel) needs.
/// Immutable once the tunnel is built.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// `wss://` endpoint of the control plane.
    pub control_plane_url: String,
    pub tls: TlsConfig,
    pub robot_name: String,
    pub robot_id: RobotId,
    pub capabilities: RobotCapabilities,
    pub heartbeat_interval: Duration,
    pub registration_timeout: Duration,
    pub connect_timeout: Duration,
    /// Reconnect delay: initial, cap and growth factor.
    pub reconnect: BackoffConfig,
}

impl TunnelConfig {
    /// Configuration with defaults for everything but the endpoint and name.
    pub fn new(control_plane_url: impl Into<String>, robot_name: impl Into<String>) -> Self {
        Self {
            control_plane_url: control_plane_url.into(),
            tls: TlsConfig::default(),
            robot_name: robot_name.into(),
            robot_id: generate_robot_id(),
            capabilities: RobotCapabilities::detect(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            registration_timeout: DEFAULT_REGISTRATION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: BackoffConfig::default(),
        }
    }

    pub fn is_secure_url(&self) -> bool {
        self.control_plane_url.starts_with("wss://")
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let url = self.control_plane_url.as_str();
        if !url.starts_with("wss://") && !url.starts_with("ws://") {
            return Err(CoreError::Validation(format!(
                "Control plane URL must use wss:// (got '{url}')"
            )));
        }
        if !self.is_secure_url() && !self.tls.allow_insecure {
            return Err(CoreError::Validation(
                "Plain ws:// requires TLS_ALLOW_INSECURE=true".to_string(),
            ));
        }
        if self.is_secure_url() && !self.tls.is_complete() && !self.tls.allow_insecure {
            return Err(CoreError::Validation(
                "TLS_CA_CERT, TLS_CLIENT_CERT and TLS_CLIENT_KEY are required".to_string(),
            ));
        }
        if self.robot_id.trim().is_empty() {
            return Err(CoreError::Validation("Robot id must not be empty".to_string()));
        }
        validate_robot_name(&self.robot_name)?;
        self.capabilities.validate()?;

        for (name, interval) in [
            ("Heartbeat interval", self.heartbeat_interval),
            ("Registration timeout", self.registration_timeout),
            ("Connect timeout", self.connect_timeout),
        ] {
            if interval.is_zero() {
                return Err(CoreError::Validation(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        self.reconnect.validate()
    }

    /// Load configuration from environment variables.
    ///
    /// | Env Var                    | Default                 |
    /// |----------------------------|-------------------------|
    /// | `CONTROL_PLANE_URL`        | required                |
    /// | `TLS_CA_CERT`              | required for `wss://`   |
    /// | `TLS_CLIENT_CERT`          | required for `wss://`   |
    /// | `TLS_CLIENT_KEY`           | required for `wss://`   |
    /// | `TLS_ALLOW_INSECURE`       | `false`                 |
    /// | `ROBOT_NAME`               | hostname, else `robot`  |
    /// | `ROBOT_ID`                 | generated UUID          |
    /// | `ROBOT_TYPE`               | `unattended`            |
    /// | `ROBOT_TAGS`               | empty                   |
    /// | `SUPPORTED_BROWSERS`       | `chromium`              |
    /// | `DESKTOP_SUPPORTED`        | `false`                 |
    /// | `MAX_CONCURRENT_JOBS`      | `1`                     |
    /// | `HEARTBEAT_INTERVAL_SECS`  | `30`                    |
    /// | `RECONNECT_DELAY_SECS`     | `1`                     |
    /// | `MAX_RECONNECT_DELAY_SECS` | `60`                    |
    /// | `RECONNECT_MULTIPLIER`     | `2.0`                   |
    pub fn from_env() -> Result<Self, CoreError> {
        let mut config = Self::new(env::require("CONTROL_PLANE_URL")?, default_robot_name());

        config.tls = TlsConfig {
            ca_cert_path: env::optional("TLS_CA_CERT").map(PathBuf::from),
            client_cert_path: env::optional("TLS_CLIENT_CERT").map(PathBuf::from),
            client_key_path: env::optional("TLS_CLIENT_KEY").map(PathBuf::from),
            allow_insecure: env::flag_or("TLS_ALLOW_INSECURE", false)?,
        };
        if let Some(name) = env::optional("ROBOT_NAME") {
            config.robot_name = name;
        }
        if let Some(id) = env::optional("ROBOT_ID") {
            config.robot_id = id;
        }

        let caps = &mut config.capabilities;
        caps.robot_type = env::parse_or::<RobotType>("ROBOT_TYPE", caps.robot_type)?;
        if let Some(tags) = env::optional("ROBOT_TAGS") {
            caps.tags = parse_list(&tags);
        }
        if let Some(browsers) = env::optional("SUPPORTED_BROWSERS") {
            caps.supported_browsers = parse_list(&browsers);
        }
        caps.desktop_supported = env::flag_or("DESKTOP_SUPPORTED", caps.desktop_supported)?;
        caps.max_concurrent_jobs = env::parse_or("MAX_CONCURRENT_JOBS", caps.max_concurrent_jobs)?;
        caps.normalize();

        config.heartbeat_interval = Duration::from_secs(env::parse_or(
            "HEARTBEAT_INTERVAL_SECS",
            DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
        )?);
        config.reconnect = BackoffConfig {
            initial_delay: Duration::from_secs(env::parse_or("RECONNECT_DELAY_SECS", 1)?),
            max_delay: Duration::from_secs(env::parse_or("MAX_RECONNECT_DELAY_SECS", 60)?),
            multiplier: env::parse_or("RECONNECT_MULTIPLIER", 2.0)?,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Host name made safe for the robot-name rules, or `robot`.
fn default_robot_name() -> String {
    let host = env::optional("HOSTNAME").or_else(|| {
        std::fs::read_to_string("/etc/hostname")
            .ok()
            .map(|s| s.trim().to_string())
    });
    host.as_deref()
        .and_then(robot_name_from_host)
        .unwrap_or_else(|| "robot".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secure() -> TunnelConfig {
        let mut config = TunnelConfig::new("wss://plane.example.com/robots", "bot-01");
        config.tls = TlsConfig {
            ca_cert_path: Some("ca.pem".into()),
            client_cert_path: Some("robot.pem".into()),
            client_key_path: Some("robot.key".into()),
            allow_insecure: false,
        };
        config
    }

    #[test]
    fn complete_mtls_config_is_valid() {
        assert!(secure().validate().is_ok());
    }

    #[test]
    fn missing_client_material_is_rejected() {
        let mut config = secure();
        config.tls.client_key_path = None;
        assert!(config.validate().is_err());

        config.tls.allow_insecure = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn plain_ws_requires_insecure_flag() {
        let mut config = secure();
        config.control_plane_url = "ws://127.0.0.1:9000".into();
        assert!(config.validate().is_err());

        config.tls.allow_insecure = true;
        assert!(config.validate().is_ok());

        config.control_plane_url = "http://127.0.0.1:9000".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_robot_identity_is_rejected() {
        let mut config = secure();
        config.robot_name = "bot 01".into();
        assert!(config.validate().is_err());

        let mut config = secure();
        config.capabilities.max_concurrent_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_reconnect_policy_is_rejected() {
        let mut config = secure();
        config.reconnect.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = secure();
        config.heartbeat_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_name_follows_naming_rules() {
        assert!(validate_robot_name(&default_robot_name()).is_ok());
    }
}
