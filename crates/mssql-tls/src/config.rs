//! TLS configuration.

use std::io::BufRead;

use rustls::pki_types::CertificateDer;

use crate::error::TlsError;

/// ALPN protocol id announced in strict (TLS-first) mode.
pub const TDS8_ALPN: &[u8] = b"tds/8.0";

/// TLS settings for one connection.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// Accept any server certificate.
    ///
    /// Insecure; logged at `warn` level whenever a connector is built.
    pub trust_server_certificate: bool,

    /// Name expected in the server certificate when it differs from the
    /// host being dialed.
    pub host_name_in_certificate: Option<String>,

    /// Extra trust anchors. When empty the Mozilla roots are used.
    pub root_certificates: Vec<CertificateDer<'static>>,

    /// TLS-first negotiation with the `tds/8.0` ALPN id.
    pub strict_mode: bool,

    /// Lowest accepted TLS version.
    pub min_protocol_version: TlsVersion,
}

impl TlsConfig {
    /// Default settings: verify against the Mozilla roots, TLS 1.2+.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept any server certificate.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_server_certificate = trust;
        self
    }

    /// Validate the certificate against `name` instead of the dialed host.
    #[must_use]
    pub fn host_name_in_certificate(mut self, name: impl Into<String>) -> Self {
        self.host_name_in_certificate = Some(name.into());
        self
    }

    /// Trust one extra certificate authority.
    #[must_use]
    pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
        self.root_certificates.push(cert);
        self
    }

    /// Trust every certificate in a PEM bundle.
    pub fn add_root_certificates_pem(mut self, mut pem: impl BufRead) -> Result<Self, TlsError> {
        for cert in rustls_pemfile::certs(&mut pem) {
            let cert = cert.map_err(|e| TlsError::Certificate(e.to_string()))?;
            self.root_certificates.push(cert);
        }
        Ok(self)
    }

    /// Negotiate TLS before any TDS traffic.
    #[must_use]
    pub fn strict_mode(mut self, enabled: bool) -> Self {
        self.strict_mode = enabled;
        self
    }

    /// Raise the minimum TLS version.
    #[must_use]
    pub fn min_protocol_version(mut self, version: TlsVersion) -> Self {
        self.min_protocol_version = version;
        self
    }

    /// Name used for SNI and certificate validation.
    #[must_use]
    pub fn server_name<'a>(&'a self, host: &'a str) -> &'a str {
        self.host_name_in_certificate.as_deref().unwrap_or(host)
    }
}

/// TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TlsVersion {
    /// TLS 1.2
    #[default]
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    pub(crate) fn supported_versions(self) -> Vec<&'static rustls::SupportedProtocolVersion> {
        match self {
            Self::Tls12 => vec![&rustls::version::TLS13, &rustls::version::TLS12],
            Self::Tls13 => vec![&rustls::version::TLS13],
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_override() {
        let config = TlsConfig::new();
        assert_eq!(config.server_name("db.local"), "db.local");
        let config = config.host_name_in_certificate("sql.example.com");
        assert_eq!(config.server_name("10.0.0.5"), "sql.example.com");
    }

    #[test]
    fn test_empty_pem_bundle() {
        let config = TlsConfig::new()
            .add_root_certificates_pem(&b""[..])
            .unwrap();
        assert!(config.root_certificates.is_empty());
    }

    #[test]
    fn test_version_selection() {
        assert_eq!(TlsVersion::Tls12.supported_versions().len(), 2);
        assert_eq!(TlsVersion::Tls13.supported_versions().len(), 1);
    }
}
