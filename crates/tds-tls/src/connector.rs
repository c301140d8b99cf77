//! TLS connector for establishing encrypted connections.

use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::{TlsConfig, TlsVersion};
use crate::error::TlsError;
use crate::prelogin_wrapper::TlsPreloginWrapper;

/// A certificate verifier that accepts any server certificate.
///
/// Installed only when `trust_server_certificate` is set.
#[derive(Debug)]
struct DangerousServerCertVerifier;

impl ServerCertVerifier for DangerousServerCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// TLS connector for TDS connections.
pub struct TlsConnector {
    config: TlsConfig,
    inner: TokioTlsConnector,
}

impl TlsConnector {
    /// Create a new TLS connector with the given configuration.
    pub fn new(config: TlsConfig) -> Result<Self, TlsError> {
        let client_config = Self::build_client_config(&config)?;
        let inner = TokioTlsConnector::from(Arc::new(client_config));

        Ok(Self { config, inner })
    }

    fn build_client_config(config: &TlsConfig) -> Result<ClientConfig, TlsError> {
        let versions = Self::select_versions(config);
        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_protocol_versions(&versions)?;

        if config.trust_server_certificate {
            tracing::warn!(
                "trust_server_certificate is enabled; server certificate validation is disabled"
            );

            return Ok(builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(DangerousServerCertVerifier))
                .with_no_client_auth());
        }

        let root_store = Self::build_root_store(config)?;
        Ok(builder
            .with_root_certificates(root_store)
            .with_no_client_auth())
    }

    fn build_root_store(config: &TlsConfig) -> Result<RootCertStore, TlsError> {
        let mut certs = config.root_certificates.clone();
        if let Some(path) = &config.ca_file {
            certs.extend(load_ca_file(path)?);
        }

        let mut root_store = RootCertStore::empty();
        if certs.is_empty() {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
        }
        Ok(root_store)
    }

    fn select_versions(config: &TlsConfig) -> Vec<&'static rustls::SupportedProtocolVersion> {
        let versions: Vec<_> = [TlsVersion::Tls12, TlsVersion::Tls13]
            .into_iter()
            .filter(|v| config.min_protocol_version <= *v && *v <= config.max_protocol_version)
            .map(TlsVersion::to_rustls)
            .collect();

        if versions.is_empty() {
            vec![&rustls::version::TLS12]
        } else {
            versions
        }
    }

    /// Perform a TLS handshake directly over the given stream.
    pub async fn connect<S>(&self, stream: S, server_name: &str) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name = self.config.server_name.as_deref().unwrap_or(server_name);
        let dns_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;

        tracing::debug!(server_name = %server_name, "performing TLS handshake");

        let tls_stream = self
            .inner
            .connect(dns_name, stream)
            .await
            .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;

        tracing::debug!("TLS handshake completed");
        Ok(tls_stream)
    }

    /// Perform the handshake inside TDS pre-login packets.
    ///
    /// On return the wrapper is in pass-through mode and the stream carries
    /// bare TLS records.
    pub async fn connect_prelogin<S>(
        &self,
        stream: S,
        server_name: &str,
    ) -> Result<TlsStream<TlsPreloginWrapper<S>>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut tls = self
            .connect(TlsPreloginWrapper::new(stream), server_name)
            .await?;
        tls.get_mut().0.handshake_complete();
        Ok(tls)
    }

    /// Get the underlying configuration.
    #[must_use]
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Read trusted roots from a PEM or DER file, chosen by extension.
fn load_ca_file(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let data = std::fs::read(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("pem") | Some("crt") => {
            let certs = rustls_pemfile::certs(&mut data.as_slice())
                .collect::<Result<Vec<_>, _>>()?;
            if certs.is_empty() {
                return Err(TlsError::InvalidCertificate(format!(
                    "no certificates in {}",
                    path.display()
                )));
            }
            Ok(certs)
        }
        Some("der") => Ok(vec![CertificateDer::from(data)]),
        _ => Err(TlsError::InvalidCertificate(format!(
            "unsupported certificate file {} (expected .pem, .crt or .der)",
            path.display()
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        assert!(TlsConnector::new(TlsConfig::default()).is_ok());
    }

    #[test]
    fn test_trust_server_certificate() {
        let config = TlsConfig::new().trust_server_certificate(true);
        let connector = TlsConnector::new(config).unwrap();
        assert!(connector.config().trust_server_certificate);
    }

    #[test]
    fn test_version_selection() {
        let config = TlsConfig::new().min_protocol_version(TlsVersion::Tls13);
        assert_eq!(TlsConnector::select_versions(&config).len(), 1);

        let inverted = TlsConfig::new()
            .min_protocol_version(TlsVersion::Tls13)
            .max_protocol_version(TlsVersion::Tls12);
        assert_eq!(TlsConnector::select_versions(&inverted).len(), 1);
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsConfig::new().with_ca_file("/nonexistent/ca.pem");
        assert!(matches!(TlsConnector::new(config), Err(TlsError::Io(_))));
    }

    #[test]
    fn test_unsupported_ca_extension() {
        let dir = std::env::temp_dir().join("tds-tls-ca-test.txt");
        std::fs::write(&dir, b"not a cert").unwrap();
        assert!(matches!(
            load_ca_file(&dir),
            Err(TlsError::InvalidCertificate(_))
        ));
        let _ = std::fs::remove_file(&dir);
    }
}
