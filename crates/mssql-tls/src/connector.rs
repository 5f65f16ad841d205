//! rustls connector.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector as TokioTlsConnector;
use tokio_rustls::client::TlsStream;

use crate::config::{TDS8_ALPN, TlsConfig};
use crate::error::TlsError;

/// Verifier for `trust_server_certificate`: skips chain and name checks
/// but still verifies handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for AcceptAnyServerCert {
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
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_schemes()
    }
}

/// TLS connector for SQL Server connections.
pub struct TlsConnector {
    config: TlsConfig,
    client_config: Arc<ClientConfig>,
}

impl TlsConnector {
    /// Build a connector from settings.
    pub fn new(config: TlsConfig) -> Result<Self, TlsError> {
        let client_config = Arc::new(build_client_config(&config)?);
        Ok(Self {
            config,
            client_config,
        })
    }

    /// Run the handshake over `stream`.
    ///
    /// `host` is the dialed host; `host_name_in_certificate` overrides it.
    pub async fn connect<S>(&self, stream: S, host: &str) -> Result<TlsStream<S>, TlsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = self.config.server_name(host);
        let server_name = ServerName::try_from(name.to_owned())
            .map_err(|_| TlsError::InvalidServerName(name.to_owned()))?;

        tracing::debug!(server_name = %name, strict = self.config.strict_mode, "starting TLS handshake");
        let stream = TokioTlsConnector::from(Arc::clone(&self.client_config))
            .connect(server_name, stream)
            .await
            .map_err(TlsError::Handshake)?;

        let (_, session) = stream.get_ref();
        tracing::debug!(
            version = ?session.protocol_version(),
            alpn = ?session.alpn_protocol().map(String::from_utf8_lossy),
            "TLS handshake complete"
        );
        Ok(stream)
    }

    /// Whether the connector negotiates TLS before PRELOGIN.
    #[must_use]
    pub fn is_strict_mode(&self) -> bool {
        self.config.strict_mode
    }

    /// Settings the connector was built from.
    #[must_use]
    pub fn config(&self) -> &TlsConfig {
        &self.config
    }

    /// The rustls configuration in use.
    #[must_use]
    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }
}

impl std::fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConnector")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Leaf certificate presented by the server, used for channel bindings.
#[must_use]
pub fn peer_certificate<S>(stream: &TlsStream<S>) -> Option<&CertificateDer<'static>> {
    stream.get_ref().1.peer_certificates()?.first()
}

fn build_client_config(config: &TlsConfig) -> Result<ClientConfig, TlsError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versions = config.min_protocol_version.supported_versions();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&versions)?;

    let mut client_config = if config.trust_server_certificate {
        tracing::warn!(
            "trust_server_certificate is enabled; the server certificate will not be validated"
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(
                signature_algorithms(&provider),
            )))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(root_store(config)?)
            .with_no_client_auth()
    };

    if config.strict_mode {
        client_config.alpn_protocols = vec![TDS8_ALPN.to_vec()];
    }
    Ok(client_config)
}

fn signature_algorithms(provider: &CryptoProvider) -> WebPkiSupportedAlgorithms {
    provider.signature_verification_algorithms
}

fn root_store(config: &TlsConfig) -> Result<RootCertStore, TlsError> {
    if config.root_certificates.is_empty() {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    }
    let mut store = RootCertStore::empty();
    for cert in &config.root_certificates {
        store
            .add(cert.clone())
            .map_err(|e| TlsError::Certificate(e.to_string()))?;
    }
    Ok(store)
}
