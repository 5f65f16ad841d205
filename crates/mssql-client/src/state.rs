//! Connection state.
//!
//! Two layers of state exist. The type-state markers make some operations
//! available only when they are valid:
//!
//! ```text
//! Disconnected -> Ready (via connect())
//! Ready -> InTransaction (via begin_transaction())
//! InTransaction -> Ready (via commit() or rollback())
//! ```
//!
//! [`Session`] carries the runtime protocol state of one connection: the
//! lifecycle phase, what login negotiated, and the diagnostic ids.

use std::marker::PhantomData;

use bitflags::bitflags;
use mssql_types::ParamContext;
use tds_protocol::{Collation, FeatureAcks, TdsVersion};
use uuid::Uuid;

use crate::config::{Config, VectorTypeSupport};

/// Marker trait for connection states.
///
/// Sealed so only the states defined here are valid.
pub trait ConnectionState: private::Sealed {}

/// Not yet connected; only `connect()` is available.
pub struct Disconnected;

/// Logged in, auto-commit mode.
pub struct Ready;

/// Inside an explicit transaction that must be committed or rolled back.
pub struct InTransaction;

impl ConnectionState for Disconnected {}
impl ConnectionState for Ready {}
impl ConnectionState for InTransaction {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Disconnected {}
    impl Sealed for super::Ready {}
    impl Sealed for super::InTransaction {}
}

/// Zero-sized type-state tag.
#[derive(Debug)]
pub struct StateMarker<S: ConnectionState> {
    _state: PhantomData<S>,
}

impl<S: ConnectionState> StateMarker<S> {
    pub(crate) fn new() -> Self {
        Self {
            _state: PhantomData,
        }
    }
}

/// Lifecycle phase of a session.
///
/// ```text
/// Connecting -> PreLogin -> (TlsHandshake) -> LoggingIn -> (SspiContinue)*
///   -> Ready <-> Executing
///   -> Closed | Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Dialing the transport.
    #[default]
    Connecting,
    /// PRELOGIN exchange.
    PreLogin,
    /// TLS handshake, in-band or strict.
    TlsHandshake,
    /// LOGIN7 sent, waiting for LOGINACK.
    LoggingIn,
    /// Exchanging authentication tokens.
    SspiContinue,
    /// Idle and usable.
    Ready,
    /// A request is in flight.
    Executing,
    /// Closed by the caller.
    Closed,
    /// A protocol failure left the connection unusable.
    Failed,
}

impl SessionState {
    /// Whether a new request may start.
    #[must_use]
    pub fn is_usable(self) -> bool {
        self == Self::Ready
    }

    /// Whether the session can never be used again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

bitflags! {
    /// Which protocol events a session logs at `debug` level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LogFlags: u32 {
        /// Server ERROR tokens.
        const ERRORS = 1;
        /// Server INFO tokens.
        const MESSAGES = 2;
        /// Row counts.
        const ROWS = 4;
        /// SQL text of batches and RPC statements.
        const SQL = 8;
        /// Parameter declarations.
        const PARAMS = 16;
        /// Transaction descriptor changes.
        const TRANSACTION = 32;
        /// Decoder internals.
        const DEBUG = 64;
        /// Connection retries.
        const RETRIES = 128;
        /// Session lifecycle transitions.
        const SESSION = 256;
        /// Raw packet traffic.
        const PACKETS = 512;
    }
}

/// Features the server acknowledged in FEATUREEXTACK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiatedFeatures {
    /// Always Encrypted version; 0 when not active.
    pub column_encryption_version: u8,
    /// Native JSON type is available.
    pub json_supported: bool,
    /// UTF-8 collations are available.
    pub utf8_supported: bool,
    /// FEDAUTH was acknowledged.
    pub fed_auth: bool,
}

impl From<&FeatureAcks> for NegotiatedFeatures {
    fn from(acks: &FeatureAcks) -> Self {
        Self {
            column_encryption_version: acks.column_encryption_version,
            json_supported: acks.json_supported(),
            utf8_supported: acks.utf8_supported,
            fed_auth: acks.fed_auth.is_some(),
        }
    }
}

impl NegotiatedFeatures {
    /// Whether COLMETADATA carries Always Encrypted metadata.
    #[must_use]
    pub fn column_encryption(&self) -> bool {
        self.column_encryption_version > 0
    }
}

/// How long TLS wraps the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsLifetime {
    /// No TLS at all.
    #[default]
    None,
    /// Only the LOGIN7 packet travelled over TLS.
    LoginOnly,
    /// TLS negotiated in-band and kept for the whole connection.
    Connection,
    /// TLS established before PRELOGIN (TDS 8.0).
    Strict,
}

/// Mutable per-connection protocol state.
#[derive(Debug, Clone)]
pub struct Session {
    pub(crate) state: SessionState,
    pub(crate) packet_size: usize,
    pub(crate) tds_version: Option<TdsVersion>,
    pub(crate) server_name: Option<String>,
    pub(crate) server_version: Option<String>,
    pub(crate) collation: Option<Collation>,
    pub(crate) database: Option<String>,
    pub(crate) features: NegotiatedFeatures,
    pub(crate) transaction_descriptor: u64,
    pub(crate) spid: u16,
    pub(crate) tls: TlsLifetime,
    connection_id: Uuid,
    activity_id: Uuid,
    log_flags: LogFlags,
}

impl Session {
    /// Fresh session for a connection attempt.
    ///
    /// The connection id is random; the activity id comes from the
    /// configuration when set.
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            state: SessionState::Connecting,
            packet_size: usize::from(config.packet_size),
            tds_version: None,
            server_name: None,
            server_version: None,
            collation: None,
            database: None,
            features: NegotiatedFeatures::default(),
            transaction_descriptor: 0,
            spid: 0,
            tls: TlsLifetime::None,
            connection_id: Uuid::new_v4(),
            activity_id: config.activity_id.unwrap_or_else(Uuid::new_v4),
            log_flags: config.log_flags,
        }
    }

    /// Move to `next`, logging when [`LogFlags::SESSION`] is set.
    pub(crate) fn transition(&mut self, next: SessionState) {
        if self.log_flags.contains(LogFlags::SESSION) && self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "session state change");
        }
        self.state = next;
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// TDS version from LOGINACK.
    #[must_use]
    pub fn tds_version(&self) -> Option<TdsVersion> {
        self.tds_version
    }

    /// Server program name from LOGINACK.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Server version from LOGINACK, as `major.minor.build`.
    #[must_use]
    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    /// Default collation announced by the server.
    #[must_use]
    pub fn collation(&self) -> Option<Collation> {
        self.collation
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Acknowledged feature extensions.
    #[must_use]
    pub fn features(&self) -> NegotiatedFeatures {
        self.features
    }

    /// Descriptor of the open transaction; 0 in auto-commit mode.
    #[must_use]
    pub fn transaction_descriptor(&self) -> u64 {
        self.transaction_descriptor
    }

    /// Server process id from the packet headers.
    #[must_use]
    pub fn spid(&self) -> u16 {
        self.spid
    }

    /// TLS coverage of the connection.
    #[must_use]
    pub fn tls(&self) -> TlsLifetime {
        self.tls
    }

    /// Connection id sent in the PRELOGIN trace id.
    #[must_use]
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Activity id sent in the PRELOGIN trace id.
    #[must_use]
    pub fn activity_id(&self) -> Uuid {
        self.activity_id
    }

    /// Enabled log categories.
    #[must_use]
    pub fn log_flags(&self) -> LogFlags {
        self.log_flags
    }

    pub(crate) fn logs(&self, flag: LogFlags) -> bool {
        self.log_flags.contains(flag)
    }

    /// Parameter typing rules that follow from negotiation.
    ///
    /// JSON is declared natively only when the server acknowledged it;
    /// float32 vectors go binary only when the configuration asks for it.
    pub(crate) fn param_context(&self, config: &Config) -> ParamContext {
        ParamContext {
            json_supported: self.features.json_supported,
            vector_native: config.vector_support == VectorTypeSupport::Native,
        }
    }
}
