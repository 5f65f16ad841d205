//! Authentication and key-provider error type.

use thiserror::Error;

/// Errors raised by authentication strategies and column-encryption key
/// providers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The configured credentials cannot be used for this connection.
    #[error("unsupported authentication method: {0}")]
    UnsupportedMethod(String),

    /// Malformed Kerberos service principal name.
    #[error("invalid SPN {spn:?}: {reason}")]
    InvalidSpn {
        /// The SPN as configured.
        spn: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// The strategy was driven out of order.
    #[error("authentication exchange out of sequence: {0}")]
    Sequence(&'static str),

    /// The external security provider or ticket source failed.
    #[error("ticket source failure: {0}")]
    TicketSource(String),

    /// Federated token acquisition failed.
    #[error("failed to acquire access token: {0}")]
    TokenAcquisition(String),

    /// No provider is registered under the name found in column metadata.
    #[error("column encryption key provider not found: {0}")]
    KeyProviderNotFound(String),

    /// A provider with this name is already registered.
    #[error("column encryption key provider already registered: {0}")]
    KeyProviderExists(String),

    /// The provider failed to wrap or unwrap a key.
    #[error("key provider {provider} failed: {message}")]
    KeyProvider {
        /// Provider name.
        provider: String,
        /// Failure description.
        message: String,
    },

    /// The CEK envelope signature does not verify.
    #[error("column encryption key signature mismatch for {0}")]
    SignatureMismatch(String),

    /// The CEK envelope is malformed.
    #[error("invalid column encryption key envelope: {0}")]
    InvalidCekEnvelope(String),

    /// Cell encryption or decryption failed.
    #[error("AEAD failure: {0}")]
    Aead(String),

    /// Channel binding data could not be produced.
    #[error("channel binding failure: {0}")]
    ChannelBinding(String),
}

impl AuthError {
    pub(crate) fn provider(provider: &str, message: impl std::fmt::Display) -> Self {
        Self::KeyProvider {
            provider: provider.to_owned(),
            message: message.to_string(),
        }
    }
}
