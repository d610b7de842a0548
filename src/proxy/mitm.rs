//! On-demand certificate minting for CONNECT interception.
//!
//! TLS from the client terminates at the gateway: every CONNECT target gets
//! a leaf certificate signed by a process-local CA, so the decrypted request
//! can be rewritten and scheduled like any plain one.

use std::sync::Arc;

use dashmap::DashMap;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tracing::debug;

use crate::error::{GatewayError, Result};

const CA_COMMON_NAME: &str = "scrapegate interception CA";

/// A self-signed CA minted at startup plus a cache of per-host server
/// configurations. The CA lives only as long as the process; clients are
/// expected to trust it out of band.
pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    configs: DashMap<String, Arc<ServerConfig>>,
}

impl CertificateAuthority {
    pub fn new() -> Result<Self> {
        let ca_key = KeyPair::generate().map_err(tls_error)?;

        let mut params = CertificateParams::new(Vec::new()).map_err(tls_error)?;
        params
            .distinguished_name
            .push(DnType::CommonName, CA_COMMON_NAME);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_cert = params.self_signed(&ca_key).map_err(tls_error)?;

        Ok(Self {
            ca_cert,
            ca_key,
            configs: DashMap::new(),
        })
    }

    /// Server configuration presenting a leaf for `host`, minting and
    /// caching it on first use.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.configs.get(host) {
            return Ok(config.value().clone());
        }

        debug!("Minting interception certificate for {}", host);

        let leaf_key = KeyPair::generate().map_err(tls_error)?;

        let mut params = CertificateParams::new(vec![host.to_string()]).map_err(tls_error)?;
        params.distinguished_name.push(DnType::CommonName, host);

        let leaf = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(tls_error)?;

        let chain = vec![leaf.der().clone(), self.ca_cert.der().clone()];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(tls_error)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        self.configs.insert(host.to_string(), config.clone());

        Ok(config)
    }

    /// PEM of the CA certificate, for clients that want to trust it.
    pub fn ca_certificate_pem(&self) -> String {
        self.ca_cert.pem()
    }
}

fn tls_error(error: impl std::fmt::Display) -> GatewayError {
    GatewayError::Tls(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mints_config_for_host() {
        let authority = CertificateAuthority::new().unwrap();
        let config = authority.server_config_for("example.com").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_configs_are_cached_per_host() {
        let authority = CertificateAuthority::new().unwrap();
        let first = authority.server_config_for("example.com").unwrap();
        let second = authority.server_config_for("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = authority.server_config_for("other.example").unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn test_ca_pem_is_exported() {
        let authority = CertificateAuthority::new().unwrap();
        let pem = authority.ca_certificate_pem();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_mints_config_for_ip_target() {
        let authority = CertificateAuthority::new().unwrap();
        assert!(authority.server_config_for("192.0.2.7").is_ok());
    }
}
