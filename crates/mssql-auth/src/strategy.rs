//! The authentication strategy driven by the login state machine.
//!
//! A session asks its strategy for the first token to put in LOGIN7, feeds
//! every SSPI token the server returns to [`AuthStrategy::next_bytes`], and
//! calls [`AuthStrategy::free`] exactly once when the exchange ends,
//! whether it succeeded or not.

use std::sync::Arc;

use crate::channel_binding::ChannelBinding;
use crate::error::AuthError;

/// A multi-round authentication exchange.
pub trait AuthStrategy: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Token carried in LOGIN7.
    fn initial_bytes(&mut self) -> Result<Vec<u8>, AuthError>;

    /// Answer to a server SSPI token. An empty answer ends the exchange
    /// from the client's side.
    fn next_bytes(&mut self, server: &[u8]) -> Result<Vec<u8>, AuthError>;

    /// Release resources. Safe to call more than once.
    fn free(&mut self);
}

/// What a strategy is authenticating against.
#[derive(Debug, Clone, Default)]
pub struct AuthTarget {
    /// Host as dialed.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Explicit service principal name, if configured.
    pub spn: Option<String>,
    /// Channel binding from the TLS session, when one is active.
    pub channel_binding: Option<ChannelBinding>,
}

impl AuthTarget {
    /// Target with the default SPN.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Override the SPN.
    #[must_use]
    pub fn with_spn(mut self, spn: impl Into<String>) -> Self {
        self.spn = Some(spn.into());
        self
    }

    /// Attach a channel binding.
    #[must_use]
    pub fn with_channel_binding(mut self, binding: ChannelBinding) -> Self {
        self.channel_binding = Some(binding);
        self
    }

    /// Configured SPN, or `MSSQLSvc/host:port`.
    #[must_use]
    pub fn service_principal_name(&self) -> String {
        self.spn
            .clone()
            .unwrap_or_else(|| format!("MSSQLSvc/{}:{}", self.host, self.port))
    }
}

/// Builds a fresh strategy for each connection attempt.
pub type StrategyFactory =
    Arc<dyn Fn(&AuthTarget) -> Result<Box<dyn AuthStrategy>, AuthError> + Send + Sync>;

/// Result of one step of a platform security context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityStep {
    /// More round trips are needed; send this token.
    Continue(Vec<u8>),
    /// The context is established; send this token (possibly empty).
    Complete(Vec<u8>),
}

/// Delegate for an OS security provider (SSPI on Windows, GSS elsewhere).
///
/// The provider internals live outside this crate; the strategy only
/// shuttles tokens.
pub trait SecurityContext: Send {
    /// Advance the context. `input` is `None` on the first call.
    fn step(
        &mut self,
        target: &str,
        input: Option<&[u8]>,
        channel_bindings: Option<&[u8]>,
    ) -> Result<SecurityStep, AuthError>;

    /// Release provider handles.
    fn release(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Initial,
    Continuing,
    Complete,
    Freed,
}

/// Strategy that delegates to a [`SecurityContext`].
///
/// Covers the Negotiate and NTLM packages; the package name only affects
/// logging.
pub struct SspiStrategy<C> {
    package: &'static str,
    context: C,
    target: String,
    bindings: Option<Vec<u8>>,
    progress: Progress,
}

impl<C: SecurityContext> SspiStrategy<C> {
    /// Negotiate package (Kerberos with NTLM fallback).
    pub fn negotiate(context: C, target: &AuthTarget) -> Self {
        Self::with_package("Negotiate", context, target)
    }

    /// NTLM challenge/response.
    pub fn ntlm(context: C, target: &AuthTarget) -> Self {
        Self::with_package("NTLM", context, target)
    }

    fn with_package(package: &'static str, context: C, target: &AuthTarget) -> Self {
        Self {
            package,
            context,
            target: target.service_principal_name(),
            bindings: target
                .channel_binding
                .as_ref()
                .map(ChannelBinding::as_sspi_channel_bindings),
            progress: Progress::Initial,
        }
    }

    fn advance(&mut self, input: Option<&[u8]>) -> Result<Vec<u8>, AuthError> {
        match self
            .context
            .step(&self.target, input, self.bindings.as_deref())?
        {
            SecurityStep::Continue(token) => {
                self.progress = Progress::Continuing;
                Ok(token)
            }
            SecurityStep::Complete(token) => {
                tracing::debug!(package = self.package, "security context established");
                self.progress = Progress::Complete;
                Ok(token)
            }
        }
    }
}

impl<C: SecurityContext> AuthStrategy for SspiStrategy<C> {
    fn name(&self) -> &'static str {
        self.package
    }

    fn initial_bytes(&mut self) -> Result<Vec<u8>, AuthError> {
        if self.progress != Progress::Initial {
            return Err(AuthError::Sequence("initial token already produced"));
        }
        self.advance(None)
    }

    fn next_bytes(&mut self, server: &[u8]) -> Result<Vec<u8>, AuthError> {
        match self.progress {
            Progress::Continuing => self.advance(Some(server)),
            Progress::Complete => Ok(Vec::new()),
            Progress::Initial => Err(AuthError::Sequence("server token before initial token")),
            Progress::Freed => Err(AuthError::Sequence("strategy already released")),
        }
    }

    fn free(&mut self) {
        if self.progress != Progress::Freed {
            self.context.release();
            self.progress = Progress::Freed;
        }
    }
}

impl<C> std::fmt::Debug for SspiStrategy<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SspiStrategy")
            .field("package", &self.package)
            .field("target", &self.target)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TwoLeg {
        seen: Vec<Option<Vec<u8>>>,
        bindings: Option<Vec<u8>>,
        releases: usize,
    }

    impl SecurityContext for TwoLeg {
        fn step(
            &mut self,
            target: &str,
            input: Option<&[u8]>,
            channel_bindings: Option<&[u8]>,
        ) -> Result<SecurityStep, AuthError> {
            assert_eq!(target, "MSSQLSvc/db.example.com:1433");
            self.bindings = channel_bindings.map(<[u8]>::to_vec);
            self.seen.push(input.map(<[u8]>::to_vec));
            Ok(match input {
                None => SecurityStep::Continue(b"NEGOTIATE".to_vec()),
                Some(_) => SecurityStep::Complete(b"AUTHENTICATE".to_vec()),
            })
        }

        fn release(&mut self) {
            self.releases += 1;
        }
    }

    #[test]
    fn test_default_spn() {
        let target = AuthTarget::new("db.example.com", 1433);
        assert_eq!(target.service_principal_name(), "MSSQLSvc/db.example.com:1433");
        let target = target.with_spn("MSSQLSvc/alias:1500");
        assert_eq!(target.service_principal_name(), "MSSQLSvc/alias:1500");
    }

    #[test]
    fn test_ntlm_exchange() {
        let target = AuthTarget::new("db.example.com", 1433);
        let mut strategy = SspiStrategy::ntlm(TwoLeg::default(), &target);
        assert_eq!(strategy.name(), "NTLM");

        assert!(strategy.next_bytes(b"early").is_err());
        assert_eq!(strategy.initial_bytes().unwrap(), b"NEGOTIATE");
        assert!(strategy.initial_bytes().is_err());
        assert_eq!(strategy.next_bytes(b"CHALLENGE").unwrap(), b"AUTHENTICATE");
        assert!(strategy.next_bytes(b"more").unwrap().is_empty());
        assert_eq!(
            strategy.context.seen,
            vec![None, Some(b"CHALLENGE".to_vec())]
        );

        strategy.free();
        strategy.free();
        assert_eq!(strategy.context.releases, 1);
        assert!(strategy.next_bytes(b"x").is_err());
    }

    #[test]
    fn test_channel_bindings_passed_through() {
        let target = AuthTarget::new("db.example.com", 1433)
            .with_channel_binding(ChannelBinding::tls_unique(&[1, 2, 3]).unwrap());
        let mut strategy = SspiStrategy::negotiate(TwoLeg::default(), &target);
        strategy.initial_bytes().unwrap();
        let bindings = strategy.context.bindings.clone().unwrap();
        assert_eq!(bindings.len(), 32 + "tls-unique:".len() + 3);
    }
}
