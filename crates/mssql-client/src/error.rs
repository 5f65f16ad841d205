//! Client error types.

use std::sync::Arc;

use tds_protocol::ServerMessage;
use thiserror::Error;

/// Server error numbers worth retrying during connect.
///
/// 4060 cannot open database, 4221 login timeout during replica
/// synchronization, 40197/40501/40613 Azure SQL service busy or
/// unavailable, 49918-49920 Azure resource limits.
pub const TRANSIENT_SERVER_ERRORS: &[i32] = &[4060, 4221, 40197, 40501, 40613, 49918, 49919, 49920];

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Transport failure.
    #[error("IO error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// TLS negotiation failed.
    #[error("TLS error: {0}")]
    Tls(#[from] mssql_tls::TlsError),

    /// Malformed or unexpected wire data.
    #[error("protocol error: {0}")]
    Protocol(#[from] tds_protocol::ProtocolError),

    /// Packet framing failed.
    #[error("codec error: {0}")]
    Codec(#[from] mssql_codec::CodecError),

    /// Value conversion failed.
    #[error("type error: {0}")]
    Type(#[from] mssql_types::TypeError),

    /// Authentication or column decryption failed.
    #[error("authentication error: {0}")]
    Auth(#[from] mssql_auth::AuthError),

    /// The server returned an ERROR token.
    #[error("server error {number}, state {state}, class {class}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error state.
        state: u8,
        /// Severity class (0-25).
        class: u8,
        /// Message text.
        message: String,
        /// Server name.
        server: String,
        /// Procedure name, empty outside procedures.
        procedure: String,
        /// Line in the batch or procedure.
        line: i32,
    },

    /// Opening the transport timed out.
    #[error("connection timed out")]
    ConnectTimeout,

    /// Login did not finish in time.
    #[error("login timed out")]
    LoginTimeout,

    /// A request did not finish in time. The connection is unusable.
    #[error("command timed out")]
    CommandTimeout,

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// An earlier failure left the connection unusable.
    #[error("connection is poisoned by an earlier protocol failure")]
    Poisoned,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A parameter could not be encoded.
    #[error("parameter {name}: {source}")]
    Parameter {
        /// Parameter name.
        name: String,
        /// Underlying conversion error.
        #[source]
        source: mssql_types::TypeError,
    },

    /// The login exchange failed without a server error.
    #[error("login failed: {0}")]
    Login(String),

    /// The server redirected the connection elsewhere.
    #[error("routing required to {host}:{port}")]
    Routing {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },

    /// Bulk copy was misused.
    #[error("bulk copy error: {0}")]
    Bulk(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<&ServerMessage> for Error {
    fn from(msg: &ServerMessage) -> Self {
        Self::Server {
            number: msg.number,
            state: msg.state,
            class: msg.class,
            message: msg.message.clone(),
            server: msg.server.clone(),
            procedure: msg.procedure.clone(),
            line: msg.line,
        }
    }
}

impl Error {
    /// Whether a fresh connection attempt may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::ConnectTimeout | Self::LoginTimeout => true,
            Self::Codec(e) => e.is_connection_error(),
            Self::Server { number, .. } => TRANSIENT_SERVER_ERRORS.contains(number),
            _ => false,
        }
    }

    /// Whether the connection cannot be used after this error.
    ///
    /// Server errors of severity 20 and above end the session; protocol
    /// and framing failures leave the stream out of sync.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(e) => e.is_desync(),
            Self::Io(_)
            | Self::Tls(_)
            | Self::Codec(_)
            | Self::CommandTimeout
            | Self::ConnectionClosed
            | Self::Poisoned => true,
            Self::Server { class, .. } => *class >= 20,
            _ => false,
        }
    }

    /// Whether this is a server error with the given number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server { number: n, .. } if *n == number)
    }

    /// Severity class of a server error.
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server { class, .. } => Some(*class),
            _ => None,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
