//! TLS configuration for connections that dial one address and assert another identity.
//!
//! The TCP destination (a tunnel on loopback) and the TLS server name (the
//! real cluster endpoint) are independent. The server name is what goes out
//! as SNI and what the certificate is verified against; the dialed address
//! plays no part in TLS at all.

use crate::{Error, Result};
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::Item;
use rustls_pki_types::ServerName;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// SSL/TLS connection mode matching the PostgreSQL `sslmode` values accepted here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// No TLS (plaintext connection)
    Disable,
    /// Plaintext; never sends SSLRequest
    Allow,
    /// Try TLS, continue in plaintext if the server declines
    Prefer,
    /// TLS required
    #[default]
    Require,
}

impl SslMode {
    /// Whether an SSLRequest is sent during startup
    pub fn requests_tls(&self) -> bool {
        matches!(self, Self::Prefer | Self::Require)
    }

    /// Whether a server refusing TLS is fatal
    pub fn requires_tls(&self) -> bool {
        matches!(self, Self::Require)
    }
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disable => write!(f, "disable"),
            Self::Allow => write!(f, "allow"),
            Self::Prefer => write!(f, "prefer"),
            Self::Require => write!(f, "require"),
        }
    }
}

impl std::str::FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disable" => Ok(Self::Disable),
            "allow" => Ok(Self::Allow),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            _ => Err(Error::Config(format!(
                "invalid sslmode '{}': expected require, prefer, allow, or disable",
                s
            ))),
        }
    }
}

/// TLS configuration for Postgres connections.
///
/// By default the server certificate chain is validated against the system
/// root certificates and its name against the SNI server name.
///
/// # Examples
///
/// ```no_run
/// # fn example() -> dsql_probe::Result<()> {
/// use dsql_probe::connection::TlsConfig;
///
/// // System roots
/// let tls = TlsConfig::builder().build()?;
///
/// // Custom CA bundle
/// let tls = TlsConfig::builder()
///     .ca_cert_path("/etc/ssl/certs/internal-ca.pem")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TlsConfig {
    ca_cert_path: Option<PathBuf>,
    danger_accept_invalid_certs: bool,
    client_config: Arc<ClientConfig>,
}

impl TlsConfig {
    /// Create a new TLS configuration builder.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Get the rustls ClientConfig for this TLS configuration.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Path of the custom CA bundle, if one was configured
    pub fn ca_cert_path(&self) -> Option<&Path> {
        self.ca_cert_path.as_deref()
    }

    /// Check if certificate verification is disabled.
    pub fn danger_accept_invalid_certs(&self) -> bool {
        self.danger_accept_invalid_certs
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_cert_path", &self.ca_cert_path)
            .field(
                "danger_accept_invalid_certs",
                &self.danger_accept_invalid_certs,
            )
            .field("client_config", &"<ClientConfig>")
            .finish()
    }
}

/// Builder for TLS configuration.
#[derive(Debug, Default)]
pub struct TlsConfigBuilder {
    ca_cert_path: Option<PathBuf>,
    danger_accept_invalid_certs: bool,
}

impl TlsConfigBuilder {
    /// Trust only the certificates in this PEM file instead of the system roots.
    pub fn ca_cert_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    /// ⚠️ **DANGER**: Accept any server certificate.
    ///
    /// Handshake signatures are still checked, but the chain and the name are
    /// not, so anyone on the path can impersonate the server. Only for testing
    /// against servers with throwaway certificates.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.danger_accept_invalid_certs = accept;
        self
    }

    /// Build the TLS configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the CA file cannot be read or holds no
    /// certificates, or if no root certificates are available at all.
    pub fn build(self) -> Result<TlsConfig> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("unsupported TLS protocol versions: {}", e)))?;

        let client_config = if self.danger_accept_invalid_certs {
            tracing::warn!("TLS certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification::new(
                    provider,
                )))
                .with_no_client_auth()
        } else {
            let root_store = match &self.ca_cert_path {
                Some(path) => load_custom_ca(path)?,
                None => load_system_roots()?,
            };
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        };

        Ok(TlsConfig {
            ca_cert_path: self.ca_cert_path,
            danger_accept_invalid_certs: self.danger_accept_invalid_certs,
            client_config: Arc::new(client_config),
        })
    }
}

/// System roots via rustls-native-certs, falling back to the bundled webpki roots.
fn load_system_roots() -> Result<RootCertStore> {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::debug!("skipping native certificate source: {}", err);
    }

    let mut store = RootCertStore::empty();
    let (added, _ignored) = store.add_parsable_certificates(result.certs);

    if added == 0 {
        tracing::debug!("no native root certificates found, using bundled webpki roots");
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    if store.is_empty() {
        return Err(Error::Config(
            "no root certificates available for TLS verification".to_string(),
        ));
    }

    Ok(store)
}

/// Load CA certificates from a PEM file.
fn load_custom_ca(ca_path: &Path) -> Result<RootCertStore> {
    let ca_cert_data = fs::read(ca_path).map_err(|e| {
        Error::Config(format!(
            "failed to read CA certificate file '{}': {}",
            ca_path.display(),
            e
        ))
    })?;

    let mut reader = std::io::Cursor::new(&ca_cert_data);
    let mut root_store = RootCertStore::empty();

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                root_store.add(cert).map_err(|e| {
                    Error::Config(format!(
                        "invalid CA certificate in '{}': {}",
                        ca_path.display(),
                        e
                    ))
                })?;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config(format!(
                    "failed to parse CA certificate from '{}'",
                    ca_path.display()
                )));
            }
        }
    }

    if root_store.is_empty() {
        return Err(Error::Config(format!(
            "no valid certificates found in '{}'",
            ca_path.display()
        )));
    }

    Ok(root_store)
}

/// Parse a hostname into the TLS server name sent as SNI.
///
/// A trailing dot is dropped. Only ASCII letters, digits, `-` and `.` are
/// accepted, up to 253 characters.
///
/// # Errors
///
/// Returns `Error::Config` if the hostname is invalid.
pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>> {
    let hostname = hostname.trim_end_matches('.');

    if hostname.is_empty() || hostname.len() > 253 {
        return Err(Error::Config(format!(
            "invalid hostname for TLS: '{}'",
            hostname
        )));
    }

    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return Err(Error::Config(format!(
            "invalid hostname for TLS: '{}'",
            hostname
        )));
    }

    ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::Config(format!("invalid hostname for TLS: '{}'", hostname)))
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};
    use std::sync::Arc;

    /// Accepts any certificate but still checks handshake signatures.
    #[derive(Debug)]
    pub struct NoCertificateVerification(Arc<CryptoProvider>);

    impl NoCertificateVerification {
        pub fn new(provider: Arc<CryptoProvider>) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
