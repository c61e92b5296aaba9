//! TLS client configuration for the broker connection
//!
//! Builds a rustls [`ClientConfig`] from PEM files on disk:
//! - CA bundle (mandatory when TLS is on; no silent fallback to system roots)
//! - optional client certificate + key for mutual TLS
//! - optional "insecure" mode that still validates the chain against the CA
//!   but accepts a certificate whose names do not match the host (brokers
//!   addressed by a raw IP are the usual reason)
//!
//! rustls only speaks TLS 1.2 and 1.3, which matches the 1.2 floor the agent
//! requires.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore,
    SignatureScheme,
};
use thiserror::Error;

/// TLS material and trust options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// PEM bundle of trusted CAs
    pub ca_cert: Option<PathBuf>,
    /// PEM client certificate chain
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`
    pub client_key: Option<PathBuf>,
    /// Accept a server certificate whose names do not match the host
    pub insecure: bool,
}

/// Errors while loading TLS material
#[derive(Debug, Error)]
pub enum TlsError {
    /// TLS enabled without a CA file
    #[error("TLS requested but no CA certificate configured (mqtt.ca_cert)")]
    MissingCa,

    /// A configured PEM file could not be read
    #[error("Cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// PEM file held no certificate
    #[error("No certificate found in {}", .0.display())]
    NoCertificates(PathBuf),

    /// PEM file held no private key
    #[error("No private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    /// Server certificate verifier could not be built
    #[error("Verifier setup failed: {0}")]
    Verifier(String),

    /// rustls rejected the configuration
    #[error("TLS error: {0}")]
    Rustls(#[from] RustlsError),
}

impl TlsSettings {
    /// Build the rustls client configuration
    ///
    /// Fails fast on missing or unreadable material instead of downgrading.
    pub fn build_client_config(&self) -> Result<ClientConfig, TlsError> {
        let ca_path = self.ca_cert.as_deref().ok_or(TlsError::MissingCa)?;
        let roots = load_root_store(ca_path)?;

        let builder = if self.insecure {
            warn!(
                "TLS: insecure mode, server certificate names are NOT checked (chain still verified against {})",
                ca_path.display()
            );
            let verifier = NameTolerantVerifier::new(roots)?;
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
        } else {
            ClientConfig::builder().with_root_certificates(roots)
        };

        let config = match (&self.client_cert, &self.client_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = load_certs(cert_path)?;
                let key = load_private_key(key_path)?;
                debug!("TLS: client certificate {}", cert_path.display());
                builder.with_client_auth_cert(certs, key)?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                warn!("TLS: client_cert and client_key must both be set, continuing without client auth");
                builder.with_no_client_auth()
            }
        };

        Ok(config)
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(load_certs(path)?);
    debug!(
        "TLS: loaded {} CA certificate(s) from {} ({} ignored)",
        added,
        path.display(),
        ignored
    );

    if added == 0 {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(roots)
}

/// Full WebPKI verification, except that a name mismatch is accepted
#[derive(Debug)]
struct NameTolerantVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl NameTolerantVerifier {
    fn new(roots: RootCertStore) -> Result<Self, TlsError> {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for NameTolerantVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(RustlsError::InvalidCertificate(CertificateError::NotValidForName)) => {
                debug!("TLS: accepting certificate not valid for {:?}", server_name);
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn tls_without_ca_is_rejected() {
        let settings = TlsSettings::default();
        assert!(matches!(
            settings.build_client_config(),
            Err(TlsError::MissingCa)
        ));
    }

    #[test]
    fn unreadable_ca_is_reported_with_path() {
        let settings = TlsSettings {
            ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        match settings.build_client_config() {
            Err(TlsError::Io { path, .. }) => assert_eq!(path, PathBuf::from("/nonexistent/ca.pem")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn file_without_certificates_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not a pem file").unwrap();

        let settings = TlsSettings {
            ca_cert: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert!(matches!(
            settings.build_client_config(),
            Err(TlsError::NoCertificates(_))
        ));
    }
}
