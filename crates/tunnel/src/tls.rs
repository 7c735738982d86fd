//! Client-side TLS for the control-plane tunnel.
//!
//! With complete material the robot presents its client certificate and
//! only trusts servers signed by the configured CA (mutual TLS).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use tokio_tungstenite::Connector;

use crate::config::{TlsConfig, TunnelConfig};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Client certificate path not configured")]
    MissingCert,

    #[error("Client private key path not configured")]
    MissingKey,

    #[error("Failed to read {path}: {reason}")]
    Pem { path: PathBuf, reason: String },

    #[error("No certificates found in {0}")]
    EmptyCertFile(PathBuf),

    #[error("Invalid TLS material: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Build a rustls client config that trusts `ca_cert_path` and presents
/// the client certificate chain and key.
pub fn client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>, TlsError> {
    let ca_path = tls.ca_cert_path.as_deref().ok_or(TlsError::MissingCaCert)?;
    let cert_path = tls.client_cert_path.as_deref().ok_or(TlsError::MissingCert)?;
    let key_path = tls.client_key_path.as_deref().ok_or(TlsError::MissingKey)?;

    let mut roots = RootCertStore::empty();
    for ca in load_certs(ca_path)? {
        roots.add(ca)?;
    }
    let chain = load_certs(cert_path)?;
    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| pem_error(key_path, e))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)?;
    Ok(Arc::new(config))
}

/// TLS settings for the configured endpoint.
///
/// `None` lets tokio-tungstenite pick: plain TCP for `ws://`, server-only
/// TLS with the bundled web roots for `wss://`. That fallback is only
/// reached when `allow_insecure` is set and material is incomplete.
pub fn for_endpoint(config: &TunnelConfig) -> Result<Option<Arc<ClientConfig>>, TlsError> {
    if !config.is_secure_url() {
        return Ok(None);
    }
    if !config.tls.is_complete() && config.tls.allow_insecure {
        tracing::warn!("TLS client material incomplete, connecting without a client certificate");
        return Ok(None);
    }
    client_config(&config.tls).map(Some)
}

/// Connector handed to tokio-tungstenite for one connection attempt.
pub fn connector(tls: Option<&Arc<ClientConfig>>) -> Option<Connector> {
    tls.map(|c| Connector::Rustls(Arc::clone(c)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| pem_error(path, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| pem_error(path, e))?;
    if certs.is_empty() {
        return Err(TlsError::EmptyCertFile(path.to_path_buf()));
    }
    Ok(certs)
}

fn pem_error(path: &Path, e: impl std::fmt::Display) -> TlsError {
    TlsError::Pem {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn missing_paths_are_reported_in_order() {
        let mut tls = TlsConfig::default();
        assert_matches!(client_config(&tls), Err(TlsError::MissingCaCert));

        tls.ca_cert_path = Some("ca.pem".into());
        assert_matches!(client_config(&tls), Err(TlsError::MissingCert));

        tls.client_cert_path = Some("robot.pem".into());
        assert_matches!(client_config(&tls), Err(TlsError::MissingKey));
    }

    #[test]
    fn unreadable_ca_is_a_pem_error() {
        let tls = TlsConfig {
            ca_cert_path: Some("/nonexistent/ca.pem".into()),
            client_cert_path: Some("/nonexistent/robot.pem".into()),
            client_key_path: Some("/nonexistent/robot.key".into()),
            allow_insecure: false,
        };
        assert_matches!(client_config(&tls), Err(TlsError::Pem { path, .. }) if path.ends_with("ca.pem"));
    }

    #[test]
    fn empty_ca_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("fleet-empty-ca-{}.pem", std::process::id()));
        std::fs::write(&path, "no certificates here\n").unwrap();
        let tls = TlsConfig {
            ca_cert_path: Some(path.clone()),
            client_cert_path: Some(path.clone()),
            client_key_path: Some(path.clone()),
            allow_insecure: false,
        };
        let result = client_config(&tls);
        std::fs::remove_file(&path).ok();
        assert_matches!(result, Err(TlsError::EmptyCertFile(_)));
    }

    #[test]
    fn plain_ws_needs_no_connector() {
        let mut config = TunnelConfig::new("ws://127.0.0.1:1", "bot");
        config.tls.allow_insecure = true;
        assert!(for_endpoint(&config).unwrap().is_none());
    }

    #[test]
    fn insecure_wss_falls_back_to_default_connector() {
        let mut config = TunnelConfig::new("wss://plane.example.com", "bot");
        config.tls.allow_insecure = true;
        assert!(for_endpoint(&config).unwrap().is_none());
    }
}
