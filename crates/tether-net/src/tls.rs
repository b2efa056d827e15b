//! TLS configuration for the handshake step.
//!
//! Clients wrap their connected socket with a [`TlsConfig`]; listeners wrap
//! accepted sockets with a [`ServerTlsConfig`]. In both cases the plain stream
//! is moved into the TLS stream, never copied.
//!
//! # Client
//!
//! ```ignore
//! use tether_net::tls::{Certificate, TlsConfig};
//!
//! let ca = Certificate::from_pem_file("/etc/tether/ca.crt")?;
//! let tls = TlsConfig::new().add_root_certificate(ca).use_only_custom_roots();
//! let config = TcpClientConfig::new("gateway.local", 3389).tls(tls);
//! ```
//!
//! # Server
//!
//! ```ignore
//! use tether_net::tls::{Identity, ServerTlsConfig};
//!
//! let identity = Identity::from_pem_files("server.crt", "server.key")?;
//! let config = TcpServerConfig::new("0.0.0.0", 3389).tls(ServerTlsConfig::new(identity));
//! ```

use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{NetworkError, Result};

fn read_pem_file(path: &Path, what: &str) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| NetworkError::Tls(format!("Failed to read {what} '{}': {e}", path.display())))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| NetworkError::Tls(format!("Failed to parse PEM certificate: {e}")))?;
    if certs.is_empty() {
        return Err(NetworkError::Tls("No certificates found in PEM data".to_string()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(Cursor::new(pem));
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| NetworkError::Tls(format!("Failed to parse private key PEM: {e}")))?
        .ok_or_else(|| NetworkError::Tls("No private key found in PEM data".to_string()))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsVersion {
    /// TLS 1.2 and newer.
    #[default]
    Tls1_2,
    /// TLS 1.3 only.
    Tls1_3,
}

impl TlsVersion {
    pub(crate) fn to_rustls_versions(self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        match self {
            TlsVersion::Tls1_2 => vec![&rustls::version::TLS13, &rustls::version::TLS12],
            TlsVersion::Tls1_3 => vec![&rustls::version::TLS13],
        }
    }
}

/// An ALPN protocol identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlpnProtocol(Vec<u8>);

impl AlpnProtocol {
    /// Wrap raw protocol identifier bytes.
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

fn alpn_list(protocols: &[AlpnProtocol]) -> Vec<Vec<u8>> {
    protocols.iter().map(|p| p.0.clone()).collect()
}

/// One or more X.509 certificates, typically CA roots to trust.
#[derive(Clone)]
pub struct Certificate {
    der_certs: Vec<CertificateDer<'static>>,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("cert_count", &self.der_certs.len())
            .finish()
    }
}

impl Certificate {
    /// Parse PEM bytes; a chain yields several certificates.
    pub fn from_pem(pem_data: impl AsRef<[u8]>) -> Result<Self> {
        Ok(Self {
            der_certs: parse_certs(pem_data.as_ref())?,
        })
    }

    pub fn from_pem_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_pem(read_pem_file(path.as_ref(), "certificate file")?)
    }

    /// Wrap a single DER certificate.
    pub fn from_der(der_data: impl Into<Vec<u8>>) -> Self {
        Self {
            der_certs: vec![CertificateDer::from(der_data.into())],
        }
    }

    pub(crate) fn der_certs(&self) -> &[CertificateDer<'static>] {
        &self.der_certs
    }
}

/// A certificate chain and its private key.
///
/// Used as the server identity for accepted TLS connections and as the
/// client identity for mutual TLS.
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            private_key: self.private_key.clone_key(),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("cert_count", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Build from separate certificate and key PEM blobs.
    pub fn from_pem(cert_pem: impl AsRef<[u8]>, key_pem: impl AsRef<[u8]>) -> Result<Self> {
        Ok(Self {
            cert_chain: parse_certs(cert_pem.as_ref())?,
            private_key: parse_key(key_pem.as_ref())?,
        })
    }

    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_pem = read_pem_file(cert_path.as_ref(), "certificate file")?;
        let key_pem = read_pem_file(key_path.as_ref(), "key file")?;
        Self::from_pem(cert_pem, key_pem)
    }

    /// Build from one PEM blob holding both the chain and the key.
    pub fn from_pem_combined(pem_data: impl AsRef<[u8]>) -> Result<Self> {
        Self::from_pem(pem_data.as_ref(), pem_data.as_ref())
    }

    /// Build from DER parts, as produced by certificate generators.
    pub fn from_der(cert_chain: Vec<CertificateDer<'static>>, private_key: PrivateKeyDer<'static>) -> Self {
        Self {
            cert_chain,
            private_key,
        }
    }
}

/// Client-side TLS settings.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Additional root certificates to trust.
    pub root_certificates: Vec<Certificate>,
    /// Trust only `root_certificates`, not the bundled web roots.
    pub use_only_custom_roots: bool,
    /// Client identity for mutual TLS.
    pub identity: Option<Identity>,
    /// Minimum TLS version.
    pub min_version: TlsVersion,
    /// ALPN protocols to advertise.
    pub alpn_protocols: Vec<AlpnProtocol>,
    /// Skip server certificate verification entirely.
    pub danger_accept_invalid_certs: bool,
    /// Name to verify and send as SNI instead of the dialed host.
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_root_certificate(mut self, cert: Certificate) -> Self {
        self.root_certificates.push(cert);
        self
    }

    pub fn use_only_custom_roots(mut self) -> Self {
        self.use_only_custom_roots = true;
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    pub fn alpn_protocol(mut self, protocol: AlpnProtocol) -> Self {
        self.alpn_protocols.push(protocol);
        self
    }

    /// Accept any server certificate.
    ///
    /// # Warning
    ///
    /// This disables certificate verification and makes the connection
    /// vulnerable to man-in-the-middle attacks.
    pub fn danger_accept_invalid_certs(mut self) -> Self {
        self.danger_accept_invalid_certs = true;
        self
    }

    /// Verify the server against `name` rather than the dialed host.
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Build the rustls client configuration.
    pub fn build_rustls_config(&self) -> Result<Arc<ClientConfig>> {
        let builder = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&self.min_version.to_rustls_versions())
            .map_err(|e| NetworkError::Tls(format!("Unsupported protocol versions: {e}")))?;

        let builder = if self.danger_accept_invalid_certs {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider())))
        } else {
            builder.with_root_certificates(self.build_root_store()?)
        };

        let mut config = match &self.identity {
            Some(identity) => builder
                .with_client_auth_cert(identity.cert_chain.clone(), identity.private_key.clone_key())
                .map_err(|e| NetworkError::Tls(format!("Invalid client certificate: {e}")))?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = alpn_list(&self.alpn_protocols);

        Ok(Arc::new(config))
    }

    /// A connector for wrapping dialed sockets.
    pub fn connector(&self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(self.build_rustls_config()?))
    }

    /// The name to present for `host`.
    pub(crate) fn server_name_for(&self, host: &str) -> Result<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_string())
            .map_err(|e| NetworkError::Tls(format!("Invalid server name '{name}': {e}")))
    }

    fn build_root_store(&self) -> Result<RootCertStore> {
        let mut root_store = RootCertStore::empty();

        if !self.use_only_custom_roots {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        for der_cert in self.root_certificates.iter().flat_map(|c| c.der_certs()) {
            root_store
                .add(der_cert.clone())
                .map_err(|e| NetworkError::Tls(format!("Failed to add root certificate: {e}")))?;
        }

        if root_store.is_empty() {
            return Err(NetworkError::Tls(
                "No root certificates available with use_only_custom_roots".to_string(),
            ));
        }

        Ok(root_store)
    }
}

/// Server-side TLS settings.
#[derive(Debug, Clone)]
pub struct ServerTlsConfig {
    /// Certificate chain and key presented to clients.
    pub identity: Identity,
    /// Minimum TLS version.
    pub min_version: TlsVersion,
    /// ALPN protocols to accept, in preference order.
    pub alpn_protocols: Vec<AlpnProtocol>,
}

impl ServerTlsConfig {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            min_version: TlsVersion::default(),
            alpn_protocols: Vec::new(),
        }
    }

    pub fn min_version(mut self, version: TlsVersion) -> Self {
        self.min_version = version;
        self
    }

    pub fn alpn_protocol(mut self, protocol: AlpnProtocol) -> Self {
        self.alpn_protocols.push(protocol);
        self
    }

    /// Build the rustls server configuration.
    pub fn build_rustls_config(&self) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&self.min_version.to_rustls_versions())
            .map_err(|e| NetworkError::Tls(format!("Unsupported protocol versions: {e}")))?
            .with_no_client_auth()
            .with_single_cert(
                self.identity.cert_chain.clone(),
                self.identity.private_key.clone_key(),
            )
            .map_err(|e| NetworkError::Tls(format!("Invalid server certificate: {e}")))?;
        config.alpn_protocols = alpn_list(&self.alpn_protocols);
        Ok(Arc::new(config))
    }

    /// An acceptor for wrapping accepted sockets.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(self.build_rustls_config()?))
    }
}

/// Verifier that accepts every server certificate but still checks
/// handshake signatures with the provider's algorithms.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed() -> (String, String) {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.pem(), key_pair.serialize_pem())
    }

    #[test]
    fn test_certificate_from_pem() {
        let (cert_pem, _) = self_signed();
        let cert = Certificate::from_pem(&cert_pem).unwrap();
        assert_eq!(cert.der_certs().len(), 1);
    }

    #[test]
    fn test_certificate_from_empty_pem_fails() {
        let err = Certificate::from_pem("not a certificate").unwrap_err();
        assert!(matches!(err, NetworkError::Tls(_)));
    }

    #[test]
    fn test_identity_from_pem_files() {
        let (cert_pem, key_pem) = self_signed();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("server.crt");
        let key_path = dir.path().join("server.key");
        std::fs::write(&cert_path, cert_pem).unwrap();
        std::fs::write(&key_path, key_pem).unwrap();

        let identity = Identity::from_pem_files(&cert_path, &key_path).unwrap();
        assert_eq!(identity.cert_chain.len(), 1);
    }

    #[test]
    fn test_identity_from_combined_pem() {
        let (cert_pem, key_pem) = self_signed();
        let identity = Identity::from_pem_combined(format!("{cert_pem}{key_pem}")).unwrap();
        assert_eq!(identity.cert_chain.len(), 1);
    }

    #[test]
    fn test_missing_file_is_tls_error() {
        let err = Certificate::from_pem_file("/nonexistent/ca.crt").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ca.crt"));
    }

    #[test]
    fn test_client_config_with_default_roots() {
        assert!(TlsConfig::new().build_rustls_config().is_ok());
    }

    #[test]
    fn test_only_custom_roots_without_certs_fails() {
        let result = TlsConfig::new().use_only_custom_roots().build_rustls_config();
        assert!(result.is_err());
    }

    #[test]
    fn test_accept_invalid_certs_builds_without_roots() {
        let config = TlsConfig::new()
            .use_only_custom_roots()
            .danger_accept_invalid_certs()
            .alpn_protocol(AlpnProtocol::new("tether/1"));
        let built = config.build_rustls_config().unwrap();
        assert_eq!(built.alpn_protocols, vec![b"tether/1".to_vec()]);
    }

    #[test]
    fn test_server_config_builds() {
        let (cert_pem, key_pem) = self_signed();
        let identity = Identity::from_pem(cert_pem, key_pem).unwrap();
        let config = ServerTlsConfig::new(identity).min_version(TlsVersion::Tls1_3);
        assert!(config.acceptor().is_ok());
    }

    #[test]
    fn test_server_name_override() {
        let config = TlsConfig::new().server_name("localhost");
        let name = config.server_name_for("127.0.0.1").unwrap();
        assert_eq!(name, ServerName::try_from("localhost").unwrap());
    }

    #[test]
    fn test_tls_version_lists() {
        assert_eq!(TlsVersion::Tls1_2.to_rustls_versions().len(), 2);
        assert_eq!(TlsVersion::Tls1_3.to_rustls_versions().len(), 1);
    }
}
