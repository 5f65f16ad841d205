//! Client configuration.
//!
//! A [`Config`] is built once, with builder methods, and never changes for
//! the life of a connection. Connection-string parsing is left to callers.

use std::time::Duration;

use mssql_auth::{Credentials, KeyProviderRegistry};
use mssql_tls::TlsConfig;
use tds_protocol::EncryptionLevel;
use tds_protocol::packet::{MAX_PACKET_SIZE, MIN_PACKET_SIZE};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::state::LogFlags;

/// Default TDS port.
pub const DEFAULT_PORT: u16 = 1433;

/// Default requested packet size.
pub const DEFAULT_PACKET_SIZE: u16 = 4096;

/// How the connection negotiates TLS.
///
/// The modes differ in what is sent in PRELOGIN and in how long TLS stays
/// on the connection:
///
/// | mode | PRELOGIN byte | TLS |
/// |------|---------------|-----|
/// | `NotSupported` | 2 | never |
/// | `Off` | 0 | LOGIN7 only, or whole connection if the server insists |
/// | `On` | 1 | whole connection |
/// | `Required` | 1 | whole connection; fails if the server cannot encrypt |
/// | `Strict` | 4 | TLS before PRELOGIN, whole connection |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncryptionMode {
    /// Client cannot encrypt.
    NotSupported,
    /// Encrypt the login exchange only, unless the server asks for more.
    #[default]
    Off,
    /// Encrypt everything.
    On,
    /// Encrypt everything and refuse servers that cannot.
    Required,
    /// TDS 8.0: TLS first, with ALPN `tds/8.0`.
    Strict,
}

impl EncryptionMode {
    /// Value sent in the PRELOGIN ENCRYPTION option.
    #[must_use]
    pub fn prelogin_level(self) -> EncryptionLevel {
        match self {
            Self::NotSupported => EncryptionLevel::NotSupported,
            Self::Off => EncryptionLevel::Off,
            Self::On | Self::Required => EncryptionLevel::On,
            Self::Strict => EncryptionLevel::Strict,
        }
    }

    /// Whether TLS runs before PRELOGIN.
    #[must_use]
    pub fn is_strict(self) -> bool {
        matches!(self, Self::Strict)
    }
}

/// How VECTOR parameters are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VectorTypeSupport {
    /// Vectors travel as JSON text in NVARCHAR(MAX).
    #[default]
    Off,
    /// Float32 vectors use the binary VECTOR type. Float16 vectors still
    /// travel as JSON.
    Native,
}

/// Timeouts for the phases of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Time to open the transport (default: 15s).
    pub connect_timeout: Duration,
    /// Time from PRELOGIN to LOGINACK, TLS included (default: 30s).
    pub login_timeout: Duration,
    /// Time for one request and its complete response (default: none).
    pub command_timeout: Option<Duration>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            login_timeout: Duration::from_secs(30),
            command_timeout: None,
        }
    }
}

impl TimeoutConfig {
    /// Defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transport connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the login timeout.
    #[must_use]
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }
}

/// Retry policy for establishing a connection.
///
/// Only [`Client::connect`](crate::Client::connect) retries, and only for
/// errors where [`Error::is_transient`] holds. Requests are never retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (default: 3).
    pub max_retries: u32,
    /// Delay before the first retry (default: 100ms).
    pub initial_backoff: Duration,
    /// Upper bound on any delay (default: 10s).
    pub max_backoff: Duration,
    /// Growth factor between retries (default: 2.0).
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the retry count.
    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the first delay.
    #[must_use]
    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Delay before retry number `attempt` (1-based). Zero for attempt 0.
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let millis = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempt` retries.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Connection settings.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Server host name or address.
    pub host: String,
    /// Server port (default: 1433).
    pub port: u16,
    /// Named instance, sent in PRELOGIN.
    pub instance: Option<String>,
    /// Initial database.
    pub database: Option<String>,
    /// Authentication.
    pub credentials: Credentials,
    /// Encryption negotiation.
    pub encryption: EncryptionMode,
    /// Certificate validation settings.
    pub tls: TlsConfig,
    /// Requested packet size (default: 4096).
    pub packet_size: u16,
    /// Timeouts.
    pub timeouts: TimeoutConfig,
    /// Connect retry policy.
    pub retry: RetryPolicy,
    /// VECTOR parameter encoding.
    pub vector_support: VectorTypeSupport,
    /// Request the native JSON type.
    pub json_support: bool,
    /// Request Always Encrypted.
    pub column_encryption: bool,
    /// Request UTF-8 collation support.
    pub utf8: bool,
    /// Application name shown by the server.
    pub application_name: String,
    /// Client host name shown by the server.
    pub workstation: String,
    /// Service principal name for integrated authentication.
    pub spn: Option<String>,
    /// Activity id sent in the PRELOGIN trace id; random when unset.
    pub activity_id: Option<Uuid>,
    /// Omit the PRELOGIN trace id.
    pub no_trace_id: bool,
    /// Diagnostic logging switches.
    pub log_flags: LogFlags,
    /// Column master key providers used to decrypt encrypted columns.
    pub key_providers: KeyProviderRegistry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            instance: None,
            database: None,
            credentials: Credentials::sql_server("", ""),
            encryption: EncryptionMode::default(),
            tls: TlsConfig::default(),
            packet_size: DEFAULT_PACKET_SIZE,
            timeouts: TimeoutConfig::default(),
            retry: RetryPolicy::default(),
            vector_support: VectorTypeSupport::default(),
            json_support: true,
            column_encryption: false,
            utf8: false,
            application_name: "mssql-client".to_string(),
            workstation: String::new(),
            spn: None,
            activity_id: None,
            no_trace_id: false,
            log_flags: LogFlags::empty(),
            key_providers: KeyProviderRegistry::global().clone(),
        }
    }
}

impl Config {
    /// Defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the named instance.
    #[must_use]
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the encryption mode.
    #[must_use]
    pub fn encryption(mut self, mode: EncryptionMode) -> Self {
        self.encryption = mode;
        self
    }

    /// Set TLS settings.
    #[must_use]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    /// Skip server certificate validation.
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.tls = self.tls.trust_server_certificate(trust);
        self
    }

    /// Set the packet size, clamped to the protocol range.
    #[must_use]
    pub fn packet_size(mut self, size: u16) -> Self {
        self.packet_size = size.clamp(MIN_PACKET_SIZE as u16, MAX_PACKET_SIZE as u16);
        self
    }

    /// Set timeouts.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the connect retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set VECTOR parameter encoding.
    #[must_use]
    pub fn vector_support(mut self, support: VectorTypeSupport) -> Self {
        self.vector_support = support;
        self
    }

    /// Request or skip the native JSON type.
    #[must_use]
    pub fn json_support(mut self, enabled: bool) -> Self {
        self.json_support = enabled;
        self
    }

    /// Request Always Encrypted.
    #[must_use]
    pub fn column_encryption(mut self, enabled: bool) -> Self {
        self.column_encryption = enabled;
        self
    }

    /// Request UTF-8 collation support.
    #[must_use]
    pub fn utf8(mut self, enabled: bool) -> Self {
        self.utf8 = enabled;
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Set the workstation name.
    #[must_use]
    pub fn workstation(mut self, name: impl Into<String>) -> Self {
        self.workstation = name.into();
        self
    }

    /// Set the service principal name for integrated authentication.
    #[must_use]
    pub fn spn(mut self, spn: impl Into<String>) -> Self {
        self.spn = Some(spn.into());
        self
    }

    /// Set the activity id sent in PRELOGIN.
    #[must_use]
    pub fn activity_id(mut self, id: Uuid) -> Self {
        self.activity_id = Some(id);
        self
    }

    /// Omit the PRELOGIN trace id.
    #[must_use]
    pub fn no_trace_id(mut self, omit: bool) -> Self {
        self.no_trace_id = omit;
        self
    }

    /// Set diagnostic logging switches.
    #[must_use]
    pub fn log_flags(mut self, flags: LogFlags) -> Self {
        self.log_flags = flags;
        self
    }

    /// Use a specific key provider registry instead of the global one.
    #[must_use]
    pub fn key_providers(mut self, registry: KeyProviderRegistry) -> Self {
        self.key_providers = registry;
        self
    }

    /// Check settings that cannot be enforced by the builder.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must not be zero".into()));
        }
        if usize::from(self.packet_size) < MIN_PACKET_SIZE {
            return Err(Error::Config(format!(
                "packet size {} is below the minimum {MIN_PACKET_SIZE}",
                self.packet_size
            )));
        }
        if self.encryption == EncryptionMode::NotSupported && self.credentials.is_federated() {
            return Err(Error::Config(
                "federated authentication requires encryption".into(),
            ));
        }
        Ok(())
    }

    /// TLS settings with the strict flag matching the encryption mode.
    pub(crate) fn tls_config(&self) -> TlsConfig {
        self.tls.clone().strict_mode(self.encryption.is_strict())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 1433);
        assert_eq!(config.packet_size, 4096);
        assert_eq!(config.encryption, EncryptionMode::Off);
        assert_eq!(config.vector_support, VectorTypeSupport::Off);
        assert!(!config.no_trace_id);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_prelogin_levels() {
        assert_eq!(
            EncryptionMode::NotSupported.prelogin_level(),
            EncryptionLevel::NotSupported
        );
        assert_eq!(EncryptionMode::Off.prelogin_level(), EncryptionLevel::Off);
        assert_eq!(EncryptionMode::On.prelogin_level(), EncryptionLevel::On);
        assert_eq!(EncryptionMode::Required.prelogin_level(), EncryptionLevel::On);
        assert_eq!(EncryptionMode::Strict.prelogin_level(), EncryptionLevel::Strict);
        assert!(EncryptionMode::Strict.is_strict());
    }

    #[test]
    fn test_packet_size_clamped() {
        assert_eq!(Config::new().packet_size(100).packet_size, 512);
        assert_eq!(Config::new().packet_size(u16::MAX).packet_size, 32767);
        assert_eq!(Config::new().packet_size(8192).packet_size, 8192);
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        assert!(matches!(
            Config::new().host("").validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_federated_requires_encryption() {
        let config = Config::new()
            .credentials(Credentials::access_token("token"))
            .encryption(EncryptionMode::NotSupported);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strict_mode_propagates_to_tls() {
        let config = Config::new().encryption(EncryptionMode::Strict);
        assert!(config.tls_config().strict_mode);
        assert!(!Config::new().tls_config().strict_mode);
    }

    #[test]
    fn test_backoff() {
        let policy = RetryPolicy::new()
            .initial_backoff(Duration::from_millis(100))
            .max_backoff(Duration::from_millis(350));
        assert_eq!(policy.backoff_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(350));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(0));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn backoff_never_exceeds_cap(
                attempt in 0u32..64,
                initial in 1u64..5_000,
                cap in 1u64..60_000,
            ) {
                let policy = RetryPolicy::new()
                    .initial_backoff(Duration::from_millis(initial))
                    .max_backoff(Duration::from_millis(cap));
                prop_assert!(policy.backoff_for_attempt(attempt) <= Duration::from_millis(cap));
            }

            #[test]
            fn packet_size_always_in_range(size in any::<u16>()) {
                let config = Config::new().packet_size(size);
                prop_assert!((512..=32767).contains(&config.packet_size));
                prop_assert!(config.validate().is_ok());
            }
        }
    }
}
