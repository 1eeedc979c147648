//! Server and client TLS contexts.
//!
//! Contexts are built once at startup by the composition root and shared by
//! `Arc` with every connection; each record engine gets its own session.

use std::path::PathBuf;
use std::sync::{Arc, Once};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore,
    ServerConfig, SignatureScheme,
};
use switchyard_protocol::{pki, DEFAULT_VERIFY_DEPTH};

use crate::NetworkError;

/// File locations and options for one TLS endpoint.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Verification roots; several files when tenants use distinct CAs.
    pub ca_files: Vec<PathBuf>,
    pub passphrase: Option<String>,
    pub verify_depth: usize,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_file: None,
            key_file: None,
            ca_files: Vec::new(),
            passphrase: None,
            verify_depth: DEFAULT_VERIFY_DEPTH,
        }
    }
}

/// PEM material loaded from [`TlsSettings`].
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    pub cert_pem: Option<String>,
    pub key_pem: Option<String>,
    pub ca_pems: Vec<String>,
    pub passphrase: Option<String>,
    pub verify_depth: usize,
}

impl Default for TlsMaterial {
    fn default() -> Self {
        Self {
            cert_pem: None,
            key_pem: None,
            ca_pems: Vec::new(),
            passphrase: None,
            verify_depth: DEFAULT_VERIFY_DEPTH,
        }
    }
}

fn read_pem(path: &PathBuf) -> Result<String, NetworkError> {
    std::fs::read_to_string(path)
        .map_err(|e| NetworkError::TlsConfig(format!("read {}: {e}", path.display())))
}

impl TlsMaterial {
    pub fn load(settings: &TlsSettings) -> Result<Self, NetworkError> {
        Ok(Self {
            cert_pem: settings.cert_file.as_ref().map(read_pem).transpose()?,
            key_pem: settings.key_file.as_ref().map(read_pem).transpose()?,
            ca_pems: settings.ca_files.iter().map(read_pem).collect::<Result<_, _>>()?,
            passphrase: settings.passphrase.clone(),
            verify_depth: settings.verify_depth,
        })
    }

    fn identity(&self) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>, NetworkError> {
        match (&self.cert_pem, &self.key_pem) {
            (Some(cert), Some(key)) => Ok(Some((
                load_cert_chain(cert)?,
                load_private_key(key, self.passphrase.as_deref())?,
            ))),
            (None, None) => Ok(None),
            _ => Err(NetworkError::TlsConfig(
                "certificate and key must be configured together".into(),
            )),
        }
    }

    fn roots(&self) -> Result<Option<Arc<RootCertStore>>, NetworkError> {
        if self.ca_pems.is_empty() {
            return Ok(None);
        }
        let mut roots = RootCertStore::empty();
        for pem in &self.ca_pems {
            for cert in load_cert_chain(pem)? {
                roots
                    .add(cert)
                    .map_err(|e| NetworkError::TlsConfig(format!("invalid CA certificate: {e}")))?;
            }
        }
        Ok(Some(Arc::new(roots)))
    }
}

fn load_cert_chain(pem: &str) -> Result<Vec<CertificateDer<'static>>, NetworkError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NetworkError::TlsConfig(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(NetworkError::TlsConfig("no certificate found in PEM".into()));
    }
    Ok(certs)
}

fn load_private_key(pem: &str, passphrase: Option<&str>) -> Result<PrivateKeyDer<'static>, NetworkError> {
    if pem.contains("ENCRYPTED PRIVATE KEY") {
        let der = pki::decode_private_key(pem, passphrase)?;
        return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der.to_vec())));
    }
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| NetworkError::TlsConfig(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| NetworkError::TlsConfig("no private key found in PEM".into()))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

// ── Server ──

/// Rejects client chains longer than the configured depth before handing
/// them to the wrapped verifier.
#[derive(Debug)]
struct DepthLimitedVerifier {
    inner: Arc<dyn ClientCertVerifier>,
    max_depth: usize,
}

impl ClientCertVerifier for DepthLimitedVerifier {
    fn offer_client_auth(&self) -> bool {
        self.inner.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.inner.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let depth = intermediates.len() + 1;
        if depth > self.max_depth {
            return Err(rustls::Error::General(format!(
                "client chain depth {depth} exceeds {}",
                self.max_depth
            )));
        }
        self.inner.verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accept-side context. Certificate and key are mandatory. With CA files
/// configured, client certificates are verified when presented; clients
/// without one still connect so that unregistered nodes can reach the
/// administrative topic.
#[derive(Clone)]
pub struct ServerTlsContext {
    config: Arc<ServerConfig>,
}

impl ServerTlsContext {
    pub fn new(material: &TlsMaterial) -> Result<Self, NetworkError> {
        let (certs, key) = material
            .identity()?
            .ok_or_else(|| NetworkError::TlsConfig("server certificate and key are required".into()))?;
        let provider = provider();
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| NetworkError::TlsConfig(e.to_string()))?;

        let builder = match material.roots()? {
            Some(roots) => {
                let inner = WebPkiClientVerifier::builder_with_provider(roots, provider)
                    .allow_unauthenticated()
                    .build()
                    .map_err(|e| NetworkError::TlsConfig(e.to_string()))?;
                builder.with_client_cert_verifier(Arc::new(DepthLimitedVerifier {
                    inner,
                    max_depth: material.verify_depth.max(1),
                }))
            }
            None => builder.with_no_client_auth(),
        };

        let config = builder
            .with_single_cert(certs, key)
            .map_err(|e| NetworkError::TlsConfig(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn from_settings(settings: &TlsSettings) -> Result<Self, NetworkError> {
        Self::new(&TlsMaterial::load(settings)?)
    }

    pub(crate) fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

// ── Client ──

/// Verifies the server chain against the CA bundle but not the host name:
/// nodes reach the master by whatever address they were configured with.
#[derive(Debug)]
struct ChainOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

fn is_name_mismatch(err: &CertificateError) -> bool {
    // Newer rustls releases attach context to this variant.
    matches!(err, CertificateError::NotValidForName) || format!("{err:?}").starts_with("NotValidForName")
}

impl ServerCertVerifier for ChainOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(ref e)) if is_name_mismatch(e) => {
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
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts any server certificate; handshake signatures are still checked.
/// Used before a node has received its CA.
#[derive(Debug)]
struct UnverifiedServer {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for UnverifiedServer {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

static UNVERIFIED_SERVER_WARNING: Once = Once::new();

/// Connect-side context. The client certificate is optional (absent before
/// registration); the CA bundle is optional too, in which case the server is
/// not authenticated.
#[derive(Clone)]
pub struct ClientTlsContext {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl ClientTlsContext {
    pub fn new(material: &TlsMaterial) -> Result<Self, NetworkError> {
        let provider = provider();
        let identity = material.identity()?;

        let verifier: Arc<dyn ServerCertVerifier> = match material.roots()? {
            Some(roots) => {
                let inner = WebPkiServerVerifier::builder_with_provider(roots, provider.clone())
                    .build()
                    .map_err(|e| NetworkError::TlsConfig(e.to_string()))?;
                Arc::new(ChainOnlyVerifier { inner })
            }
            None => {
                if identity.is_some() {
                    UNVERIFIED_SERVER_WARNING.call_once(|| {
                        tracing::warn!(
                            "client certificate configured without a CA: server identity is not verified"
                        );
                    });
                }
                Arc::new(UnverifiedServer {
                    provider: provider.clone(),
                })
            }
        };

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| NetworkError::TlsConfig(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let config = match identity {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| NetworkError::TlsConfig(e.to_string()))?,
            None => builder.with_no_client_auth(),
        };

        let server_name = ServerName::try_from("localhost")
            .map_err(|e| NetworkError::TlsConfig(e.to_string()))?;
        Ok(Self {
            config: Arc::new(config),
            server_name,
        })
    }

    pub fn from_settings(settings: &TlsSettings) -> Result<Self, NetworkError> {
        Self::new(&TlsMaterial::load(settings)?)
    }

    pub(crate) fn config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    pub(crate) fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchyard_protocol::testing::{write_pem, TestAuthority};

    fn server_material(ca: &TestAuthority) -> TlsMaterial {
        let (cert, key) = ca.issue_server("master");
        TlsMaterial {
            cert_pem: Some(cert),
            key_pem: Some(key),
            ca_pems: vec![ca.cert_pem().to_string()],
            ..TlsMaterial::default()
        }
    }

    #[test]
    fn test_server_requires_identity() {
        assert!(matches!(
            ServerTlsContext::new(&TlsMaterial::default()),
            Err(NetworkError::TlsConfig(_))
        ));
    }

    #[test]
    fn test_server_context_with_client_auth() {
        let ca = TestAuthority::new("Test CA");
        assert!(ServerTlsContext::new(&server_material(&ca)).is_ok());
    }

    #[test]
    fn test_cert_without_key_rejected() {
        let ca = TestAuthority::new("Test CA");
        let mut material = server_material(&ca);
        material.key_pem = None;
        assert!(ClientTlsContext::new(&material).is_err());
    }

    #[test]
    fn test_client_context_variants() {
        let ca = TestAuthority::new("Test CA");
        assert!(ClientTlsContext::new(&TlsMaterial::default()).is_ok());
        let (cert, key) = ca.issue_client("n1", "Alpha");
        let with_cert = TlsMaterial {
            cert_pem: Some(cert),
            key_pem: Some(key),
            ..TlsMaterial::default()
        };
        assert!(ClientTlsContext::new(&with_cert).is_ok());
    }

    #[test]
    fn test_load_from_files_with_multiple_cas() {
        let dir = tempfile::tempdir().unwrap();
        let ca = TestAuthority::new("Tenant A CA");
        let other = TestAuthority::new("Tenant B CA");
        let (cert, key) = ca.issue_server("master");
        let settings = TlsSettings {
            cert_file: Some(write_pem(dir.path(), "server.crt", &cert)),
            key_file: Some(write_pem(dir.path(), "server.key", &key)),
            ca_files: vec![
                write_pem(dir.path(), "a.crt", ca.cert_pem()),
                write_pem(dir.path(), "b.crt", other.cert_pem()),
            ],
            ..TlsSettings::default()
        };
        let material = TlsMaterial::load(&settings).unwrap();
        assert_eq!(material.ca_pems.len(), 2);
        assert!(ServerTlsContext::new(&material).is_ok());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let settings = TlsSettings {
            cert_file: Some(PathBuf::from("/nonexistent/server.crt")),
            ..TlsSettings::default()
        };
        assert!(matches!(
            TlsMaterial::load(&settings),
            Err(NetworkError::TlsConfig(_))
        ));
    }
}
