//! # mssql-client
//!
//! Async SQL Server client speaking TDS 7.4 and TDS 8.0.
//!
//! A connection goes through PRELOGIN, an optional TLS handshake, LOGIN7
//! and any SSPI or federated-authentication round trips before it reaches
//! the `Ready` state. The client then runs SQL batches, parameterized RPCs
//! and bulk loads, decoding every response into a [`QueryResult`].
//!
//! ## Type-state connection management
//!
//! ```text
//! Disconnected -> Ready          (connect)
//! Ready -> InTransaction         (begin_transaction)
//! InTransaction -> Ready         (commit / rollback)
//! Ready -> closed                (close)
//! ```
//!
//! A request that fails with a fatal error (I/O failure, stream
//! desynchronization, severity 20 or higher) poisons the session and every
//! later request returns [`Error::Poisoned`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_client::{Client, Config, Credentials, EncryptionMode, IsolationLevel};
//!
//! let config = Config::new()
//!     .host("localhost")
//!     .database("test")
//!     .credentials(Credentials::sql_server("sa", "secret"))
//!     .encryption(EncryptionMode::On);
//! let mut client = Client::connect(config).await?;
//!
//! let result = client
//!     .query("SELECT name FROM users WHERE id = @p1", &[&1i32])
//!     .await?;
//! for row in result.rows() {
//!     let name: String = row.get(0)?;
//!     println!("{name}");
//! }
//!
//! let mut tx = client.begin_transaction(IsolationLevel::ReadCommitted).await?;
//! tx.execute("UPDATE users SET active = 1", &[]).await?;
//! let client = tx.commit().await?;
//! client.close().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod bulk;
pub mod client;
pub mod config;
pub mod encryption;
pub mod error;
mod login;
pub mod params;
mod response;
pub mod result;
pub mod row;
pub mod state;
pub mod transaction;
pub mod transport;

pub use bulk::{BulkCopy, BulkInsertResult, BulkOptions};
pub use client::Client;
pub use config::{Config, EncryptionMode, RetryPolicy, TimeoutConfig, VectorTypeSupport};
pub use encryption::CellDecryptor;
pub use error::{Error, Result};
pub use mssql_auth::Credentials;
pub use mssql_types::{FromSql, SqlValue, ToSql};
pub use params::{NamedParam, ToParams};
pub use result::{OutputParam, QueryResult, ResultSet};
pub use row::{Column, Row};
pub use state::{
    ConnectionState, Disconnected, InTransaction, LogFlags, NegotiatedFeatures, Ready, Session,
    SessionState, TlsLifetime,
};
pub use transaction::IsolationLevel;
pub use transport::{BoxedTransport, Dialer, MaybeTlsStream, TcpDialer, Transport};
