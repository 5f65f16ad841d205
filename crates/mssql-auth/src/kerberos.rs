//! Kerberos over an external ticket source.
//!
//! Ticket acquisition (keytab, credential cache, KDC traffic) is owned by a
//! [`TicketSource`]. The strategy here parses the SPN, asks the source for
//! an AP-REQ, passes through the optional mutual-authentication round and
//! evicts the cached credentials when released.

use std::fmt;
use std::sync::Arc;

use crate::error::AuthError;
use crate::strategy::AuthStrategy;

/// Parsed `MSSQLSvc/host:port[@REALM]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spn {
    /// Host part.
    pub host: String,
    /// Port part.
    pub port: u16,
    /// Realm from the SPN, or the default realm.
    pub realm: String,
}

impl Spn {
    /// Parse an SPN, falling back to `default_realm` when none is given.
    ///
    /// The port is required and must be numeric. At most one `@` may
    /// appear.
    pub fn parse(spn: &str, default_realm: &str) -> Result<Self, AuthError> {
        let invalid = |reason| AuthError::InvalidSpn {
            spn: spn.to_owned(),
            reason,
        };

        let mut parts = spn.split('@');
        let principal = parts.next().unwrap_or_default();
        let realm = parts.next();
        if parts.next().is_some() {
            return Err(invalid("more than one realm separator"));
        }

        let (_, host_port) = principal
            .split_once('/')
            .ok_or_else(|| invalid("missing service class"))?;
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| invalid("port is required"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port.parse().map_err(|_| invalid("port is not numeric"))?;

        Ok(Self {
            host: host.to_owned(),
            port,
            realm: realm.unwrap_or(default_realm).to_owned(),
        })
    }

    /// The SPN without realm.
    #[must_use]
    pub fn service_name(&self) -> String {
        format!("MSSQLSvc/{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Spn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MSSQLSvc/{}:{}@{}", self.host, self.port, self.realm)
    }
}

/// Supplies Kerberos tokens.
pub trait TicketSource: Send + Sync {
    /// SPNEGO-wrapped AP-REQ for `spn`.
    fn initial_token(&self, spn: &Spn) -> Result<Vec<u8>, AuthError>;

    /// Answer to the server's AP-REP. Most deployments need no answer.
    fn continue_token(&self, _spn: &Spn, _server: &[u8]) -> Result<Vec<u8>, AuthError> {
        Ok(Vec::new())
    }

    /// Drop any cached credentials for `spn`.
    fn evict(&self, spn: &Spn);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    Sent,
    Done,
    Freed,
}

/// Kerberos strategy.
pub struct KerberosStrategy {
    source: Arc<dyn TicketSource>,
    spn: Spn,
    state: State,
}

impl KerberosStrategy {
    /// Create a strategy for an already-parsed SPN.
    pub fn new(source: Arc<dyn TicketSource>, spn: Spn) -> Self {
        Self {
            source,
            spn,
            state: State::Initial,
        }
    }

    /// Parse `spn` and create a strategy.
    pub fn from_spn(
        source: Arc<dyn TicketSource>,
        spn: &str,
        default_realm: &str,
    ) -> Result<Self, AuthError> {
        Ok(Self::new(source, Spn::parse(spn, default_realm)?))
    }

    /// The target principal.
    #[must_use]
    pub fn spn(&self) -> &Spn {
        &self.spn
    }
}

impl AuthStrategy for KerberosStrategy {
    fn name(&self) -> &'static str {
        "Kerberos"
    }

    fn initial_bytes(&mut self) -> Result<Vec<u8>, AuthError> {
        if self.state != State::Initial {
            return Err(AuthError::Sequence("initial token already produced"));
        }
        tracing::debug!(spn = %self.spn, "requesting Kerberos service ticket");
        let token = self.source.initial_token(&self.spn)?;
        self.state = State::Sent;
        Ok(token)
    }

    fn next_bytes(&mut self, server: &[u8]) -> Result<Vec<u8>, AuthError> {
        match self.state {
            State::Sent => {
                let token = self.source.continue_token(&self.spn, server)?;
                self.state = State::Done;
                Ok(token)
            }
            State::Done => Ok(Vec::new()),
            State::Initial => Err(AuthError::Sequence("server token before initial token")),
            State::Freed => Err(AuthError::Sequence("strategy already released")),
        }
    }

    fn free(&mut self) {
        if self.state != State::Freed {
            self.source.evict(&self.spn);
            self.state = State::Freed;
        }
    }
}

impl Drop for KerberosStrategy {
    fn drop(&mut self) {
        self.free();
    }
}

impl fmt::Debug for KerberosStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KerberosStrategy")
            .field("spn", &self.spn)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct FakeSource {
        cache: Mutex<Vec<String>>,
        fail: bool,
    }

    impl TicketSource for FakeSource {
        fn initial_token(&self, spn: &Spn) -> Result<Vec<u8>, AuthError> {
            if self.fail {
                return Err(AuthError::TicketSource("no credentials in keytab".into()));
            }
            self.cache.lock().push(spn.to_string());
            Ok(b"AP-REQ".to_vec())
        }

        fn evict(&self, spn: &Spn) {
            self.cache.lock().retain(|s| *s != spn.to_string());
        }
    }

    #[test]
    fn test_parse_spn() {
        let spn = Spn::parse("MSSQLSvc/mssql.domain.com:1433", "domain.com").unwrap();
        assert_eq!(spn.host, "mssql.domain.com");
        assert_eq!(spn.port, 1433);
        assert_eq!(spn.realm, "domain.com");
        assert_eq!(spn.service_name(), "MSSQLSvc/mssql.domain.com:1433");

        let spn = Spn::parse("MSSQLSvc/mssql.domain.com:1433@DOMAIN.COM", "domain.com").unwrap();
        assert_eq!(spn.realm, "DOMAIN.COM");
        assert_eq!(spn.service_name(), "MSSQLSvc/mssql.domain.com:1433");
    }

    #[test]
    fn test_parse_spn_rejects() {
        for bad in [
            "MSSQLSvc/mssql.domain.com",
            "MSSQLSvc/mssql.domain.com:1433@domain.com@test",
            "MSSQLSvc/mssql.domain.com:port@domain.com",
            "MSSQLSvc/mssql.domain.com:port",
            "mssql.domain.com:1433",
        ] {
            assert!(
                matches!(Spn::parse(bad, "domain.com"), Err(AuthError::InvalidSpn { .. })),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_exchange_and_free_evicts() {
        let source = Arc::new(FakeSource::default());
        let mut strategy =
            KerberosStrategy::from_spn(source.clone(), "MSSQLSvc/db:1433", "EXAMPLE.COM").unwrap();

        assert!(strategy.next_bytes(&[]).is_err());
        assert_eq!(strategy.initial_bytes().unwrap(), b"AP-REQ");
        assert_eq!(source.cache.lock().len(), 1);
        assert!(strategy.next_bytes(b"AP-REP").unwrap().is_empty());

        strategy.free();
        assert!(source.cache.lock().is_empty());
        strategy.free();
        assert!(strategy.initial_bytes().is_err());
    }

    #[test]
    fn test_drop_evicts() {
        let source = Arc::new(FakeSource::default());
        {
            let mut strategy = KerberosStrategy::from_spn(source.clone(), "MSSQLSvc/db:1433", "R").unwrap();
            strategy.initial_bytes().unwrap();
        }
        assert!(source.cache.lock().is_empty());
    }

    #[test]
    fn test_ticket_source_failure() {
        let source = Arc::new(FakeSource {
            fail: true,
            ..FakeSource::default()
        });
        let mut strategy = KerberosStrategy::from_spn(source, "MSSQLSvc/db:1433", "R").unwrap();
        assert!(matches!(strategy.initial_bytes(), Err(AuthError::TicketSource(_))));
    }
}
