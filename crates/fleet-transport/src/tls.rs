//! mTLS certificate management and rustls configuration.
//!
//! Generates a self-signed cluster CA and node certificates signed by it,
//! and turns PEM material into the acceptor/connector pair the transport
//! wraps its TCP streams with. Every node presents its certificate and
//! verifies the other side against the cluster CA.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

use crate::error::{TransportError, TransportResult};

/// A generated certificate and private key pair.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Self-signed CA that issues node certificates.
pub struct CertificateAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// Calendar year `years` from now.
fn year_from_now(years: i32) -> i32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    1970 + (secs / 31_556_952) as i32 + years
}

impl CertificateAuthority {
    /// Generate a fresh cluster CA, valid for ten years.
    pub fn generate() -> anyhow::Result<Self> {
        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Fleet");
        dn.push(DnType::CommonName, "Fleet Cluster CA");
        params.distinguished_name = dn;
        params.not_after = rcgen::date_time_ymd(year_from_now(10), 1, 1);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        info!("generated cluster CA certificate");
        Ok(Self { cert, key })
    }

    pub fn pair(&self) -> CertKeyPair {
        CertKeyPair {
            cert_pem: self.cert.pem(),
            key_pem: self.key.serialize_pem(),
        }
    }

    /// Issue a node certificate with one SAN per address (IP or DNS name).
    pub fn issue(&self, node_id: &str, addresses: &[String]) -> anyhow::Result<CertKeyPair> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Fleet");
        dn.push(DnType::CommonName, node_id);
        params.distinguished_name = dn;

        for addr in addresses {
            if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
                params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
            } else {
                params
                    .subject_alt_names
                    .push(rcgen::SanType::DnsName(addr.clone().try_into()?));
            }
        }
        params.not_after = rcgen::date_time_ymd(year_from_now(2), 1, 1);

        let node_key = KeyPair::generate()?;
        let node_cert = params.signed_by(&node_key, &self.cert, &self.key)?;

        info!(%node_id, sans = addresses.len(), "generated node certificate");

        Ok(CertKeyPair {
            cert_pem: node_cert.pem(),
            key_pem: node_key.serialize_pem(),
        })
    }
}

/// TLS acceptor and connector sharing one node identity.
#[derive(Clone)]
pub struct TlsSettings {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings").finish_non_exhaustive()
    }
}

fn tls_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

fn parse_certs(pem: &str) -> TransportResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::Tls("no certificate found in PEM".into()));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> TransportResult<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())?
        .ok_or_else(|| TransportError::Tls("no private key found in PEM".into()))
}

impl TlsSettings {
    /// Build mutual-TLS settings from PEM strings.
    pub fn from_pem(cert_pem: &str, key_pem: &str, ca_pem: &str) -> TransportResult<Self> {
        let certs = parse_certs(cert_pem)?;
        let key = parse_key(key_pem)?;

        let mut roots = RootCertStore::empty();
        for ca in parse_certs(ca_pem)? {
            roots.add(ca).map_err(tls_err)?;
        }
        let roots = Arc::new(roots);
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let verifier = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
            .build()
            .map_err(tls_err)?;
        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(tls_err)?;

        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(tls_err)?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(tls_err)?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
        })
    }

    pub fn from_pem_files(cert: &Path, key: &Path, ca: &Path) -> TransportResult<Self> {
        let cert_pem = std::fs::read_to_string(cert)?;
        let key_pem = std::fs::read_to_string(key)?;
        let ca_pem = std::fs::read_to_string(ca)?;
        Self::from_pem(&cert_pem, &key_pem, &ca_pem)
    }
}

/// Server name to verify when dialing `host`.
pub(crate) fn server_name(host: &str) -> TransportResult<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(tls_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_ca_succeeds() {
        let ca = CertificateAuthority::generate().unwrap();
        let pair = ca.pair();
        assert!(pair.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(pair.key_pem.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn issue_node_cert_with_ip_and_dns() {
        let ca = CertificateAuthority::generate().unwrap();
        let node = ca
            .issue(
                "node-1",
                &["10.0.0.1".to_string(), "node1.fleet.local".to_string()],
            )
            .unwrap();

        assert!(node.cert_pem.contains("BEGIN CERTIFICATE"));
        assert_ne!(node.cert_pem, ca.pair().cert_pem);
    }

    #[test]
    fn settings_from_generated_material() {
        let ca = CertificateAuthority::generate().unwrap();
        let node = ca.issue("node-1", &["127.0.0.1".to_string()]).unwrap();
        TlsSettings::from_pem(&node.cert_pem, &node.key_pem, &ca.pair().cert_pem).unwrap();
    }

    #[test]
    fn settings_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::generate().unwrap();
        let node = ca.issue("node-1", &["127.0.0.1".to_string()]).unwrap();

        let cert = dir.path().join("node.pem");
        let key = dir.path().join("node-key.pem");
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&cert, &node.cert_pem).unwrap();
        std::fs::write(&key, &node.key_pem).unwrap();
        std::fs::write(&ca_path, ca.pair().cert_pem).unwrap();

        TlsSettings::from_pem_files(&cert, &key, &ca_path).unwrap();
    }

    #[test]
    fn settings_reject_garbage() {
        let err = TlsSettings::from_pem("nope", "nope", "nope").unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }

    #[test]
    fn server_name_accepts_ip_and_dns() {
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("node1.fleet.local").is_ok());
    }
}
