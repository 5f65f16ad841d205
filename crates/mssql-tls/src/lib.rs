//! # mssql-tls
//!
//! TLS for SQL Server connections.
//!
//! Two negotiation shapes exist:
//!
//! ```text
//! in-band:  TCP -> PRELOGIN (clear) -> TLS in PRELOGIN packets -> LOGIN7
//! strict:   TCP -> TLS (ALPN tds/8.0) -> PRELOGIN -> LOGIN7
//! ```
//!
//! The in-band handshake runs over a [`PreloginStream`], which frames the
//! TLS records as PRELOGIN packets until the handshake completes. Whether
//! TLS then covers only the login exchange or the whole connection is
//! decided by the client from the PRELOGIN answer; see [`TlsLifetime`].

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;
pub mod handshake;

pub use config::{TDS8_ALPN, TlsConfig, TlsVersion};
pub use connector::{TlsConnector, peer_certificate};
pub use error::TlsError;
pub use handshake::PreloginStream;

pub use tokio_rustls::client::TlsStream;

/// When the TLS handshake happens relative to PRELOGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsNegotiationMode {
    /// Handshake after a cleartext PRELOGIN, framed in PRELOGIN packets.
    PostPreLogin,
    /// Handshake directly on the transport before any TDS traffic.
    Strict,
}

impl TlsNegotiationMode {
    /// Whether TLS starts before PRELOGIN.
    #[must_use]
    pub fn is_tls_first(self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// How long TLS stays on the connection once negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsLifetime {
    /// Only the LOGIN7 packet is encrypted; the transport reverts to
    /// cleartext right after it is sent.
    LoginOnly,
    /// Every packet after the handshake is encrypted.
    Connection,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_mode() {
        assert!(TlsNegotiationMode::Strict.is_tls_first());
        assert!(!TlsNegotiationMode::PostPreLogin.is_tls_first());
    }
}
