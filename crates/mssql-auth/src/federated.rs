//! Federated (Entra ID) authentication.
//!
//! Two shapes exist on the wire. With a pre-acquired access token the
//! token rides in the LOGIN7 FEDAUTH feature extension. With a token
//! library the login announces the workflow, the server answers with
//! FEDAUTHINFO naming the STS URL and SPN, and the client sends the token
//! it acquires in a FEDAUTH token message.

use std::sync::Arc;

use crate::error::AuthError;
use crate::strategy::AuthStrategy;

/// Workflow byte announced for library-acquired tokens.
pub const WORKFLOW_PASSWORD: u8 = 0x01;
/// Integrated (Windows) workflow.
pub const WORKFLOW_INTEGRATED: u8 = 0x02;
/// Managed identity or service principal, or any other token library.
pub const WORKFLOW_DEFAULT: u8 = 0x03;

/// Acquires access tokens for a resource announced by the server.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// Acquire a token for `spn` from `sts_url`.
    async fn token(&self, spn: &str, sts_url: &str) -> Result<String, AuthError>;
}

/// A fixed token, for callers that manage refresh themselves.
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    /// Wrap a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken([REDACTED])")
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self, _spn: &str, _sts_url: &str) -> Result<String, AuthError> {
        if self.0.is_empty() {
            return Err(AuthError::TokenAcquisition("empty access token".into()));
        }
        Ok(self.0.clone())
    }
}

/// UTF-16LE token bytes as carried on the wire.
#[must_use]
pub fn encode_token(token: &str) -> Vec<u8> {
    token.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Single-round strategy over an already acquired token.
pub struct FederatedTokenStrategy {
    token: Vec<u8>,
    produced: bool,
}

impl FederatedTokenStrategy {
    /// Strategy for `token`.
    pub fn new(token: &str) -> Self {
        Self {
            token: encode_token(token),
            produced: false,
        }
    }

    /// Acquire a token from `provider` and wrap it.
    pub async fn acquire(
        provider: &Arc<dyn TokenProvider>,
        spn: &str,
        sts_url: &str,
    ) -> Result<Self, AuthError> {
        tracing::debug!(%spn, %sts_url, "acquiring federated access token");
        let token = provider.token(spn, sts_url).await?;
        Ok(Self::new(&token))
    }
}

impl AuthStrategy for FederatedTokenStrategy {
    fn name(&self) -> &'static str {
        "FederatedToken"
    }

    fn initial_bytes(&mut self) -> Result<Vec<u8>, AuthError> {
        if self.produced {
            return Err(AuthError::Sequence("token already produced"));
        }
        if self.token.is_empty() {
            return Err(AuthError::TokenAcquisition("empty access token".into()));
        }
        self.produced = true;
        Ok(self.token.clone())
    }

    fn next_bytes(&mut self, _server: &[u8]) -> Result<Vec<u8>, AuthError> {
        Err(AuthError::Sequence("federated authentication is single-round"))
    }

    fn free(&mut self) {
        self.token.fill(0);
        self.token.clear();
    }
}

impl std::fmt::Debug for FederatedTokenStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederatedTokenStrategy")
            .field("produced", &self.produced)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_single_round() {
        let mut strategy = FederatedTokenStrategy::new("ab");
        assert_eq!(strategy.initial_bytes().unwrap(), vec![b'a', 0, b'b', 0]);
        assert!(strategy.initial_bytes().is_err());
        assert!(strategy.next_bytes(&[]).is_err());
        strategy.free();
        strategy.free();
        assert!(strategy.token.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_from_provider() {
        let provider: Arc<dyn TokenProvider> = Arc::new(StaticToken::new("eyJ0"));
        let mut strategy =
            FederatedTokenStrategy::acquire(&provider, "https://database.windows.net/", "https://sts")
                .await
                .unwrap();
        assert_eq!(strategy.initial_bytes().unwrap(), encode_token("eyJ0"));

        let empty: Arc<dyn TokenProvider> = Arc::new(StaticToken::new(""));
        assert!(matches!(
            FederatedTokenStrategy::acquire(&empty, "spn", "sts").await,
            Err(AuthError::TokenAcquisition(_))
        ));
    }

    #[test]
    fn test_static_token_debug_redacts() {
        assert_eq!(format!("{:?}", StaticToken::new("secret")), "StaticToken([REDACTED])");
    }
}
