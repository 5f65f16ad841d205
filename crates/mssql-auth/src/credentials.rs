//! Credential types.

use std::borrow::Cow;
use std::sync::Arc;

use crate::federated::{TokenProvider, WORKFLOW_DEFAULT};
use crate::strategy::StrategyFactory;

/// How a connection authenticates.
#[derive(Clone)]
pub enum Credentials {
    /// SQL Server login; the password travels obfuscated in LOGIN7.
    SqlServer {
        /// Login name.
        username: Cow<'static, str>,
        /// Password.
        password: Cow<'static, str>,
    },

    /// Integrated authentication through a pluggable strategy
    /// (Kerberos, NTLM, SSPI).
    Integrated(StrategyFactory),

    /// Pre-acquired federated access token.
    AccessToken(Cow<'static, str>),

    /// Token acquired after the server names its STS.
    FederatedLibrary {
        /// Token source.
        provider: Arc<dyn TokenProvider>,
        /// Workflow byte announced in LOGIN7.
        workflow: u8,
    },
}

impl Credentials {
    /// SQL Server login.
    pub fn sql_server(
        username: impl Into<Cow<'static, str>>,
        password: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::SqlServer {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Integrated authentication.
    pub fn integrated(factory: StrategyFactory) -> Self {
        Self::Integrated(factory)
    }

    /// Pre-acquired access token.
    pub fn access_token(token: impl Into<Cow<'static, str>>) -> Self {
        Self::AccessToken(token.into())
    }

    /// Library-acquired token with the default workflow.
    pub fn federated(provider: Arc<dyn TokenProvider>) -> Self {
        Self::FederatedLibrary {
            provider,
            workflow: WORKFLOW_DEFAULT,
        }
    }

    /// Whether LOGIN7 carries a username and password.
    #[must_use]
    pub fn is_sql_auth(&self) -> bool {
        matches!(self, Self::SqlServer { .. })
    }

    /// Whether the FEDAUTH feature extension is used.
    #[must_use]
    pub fn is_federated(&self) -> bool {
        matches!(self, Self::AccessToken(_) | Self::FederatedLibrary { .. })
    }

    /// Whether PRELOGIN must announce FEDAUTHREQUIRED.
    #[must_use]
    pub fn requires_fedauth_prelogin(&self) -> bool {
        matches!(self, Self::FederatedLibrary { .. })
    }

    /// Human-readable method name.
    #[must_use]
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::SqlServer { .. } => "SQL Server Authentication",
            Self::Integrated(_) => "Integrated Authentication",
            Self::AccessToken(_) => "Access Token",
            Self::FederatedLibrary { .. } => "Federated Authentication",
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SqlServer { username, .. } => f
                .debug_struct("SqlServer")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::Integrated(_) => f.debug_tuple("Integrated").finish(),
            Self::AccessToken(_) => f.debug_tuple("AccessToken").field(&"[REDACTED]").finish(),
            Self::FederatedLibrary { workflow, .. } => f
                .debug_struct("FederatedLibrary")
                .field("workflow", workflow)
                .finish_non_exhaustive(),
        }
    }
}
