//! TLS error type.

use thiserror::Error;

/// Errors raised while configuring or negotiating TLS.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// The TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// The server name is not a valid DNS name or IP address.
    #[error("invalid server name for certificate validation: {0}")]
    InvalidServerName(String),

    /// A configured certificate could not be parsed or added.
    #[error("invalid certificate: {0}")]
    Certificate(String),

    /// The rustls configuration could not be built.
    #[error("TLS configuration error: {0}")]
    Configuration(String),

    /// Transport failure around the handshake.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by rustls.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}
