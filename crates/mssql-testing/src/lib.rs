//! # mssql-testing
//!
//! Test infrastructure for the SQL Server driver crates.
//!
//! The centerpiece is an in-process mock TDS server that performs the
//! PRELOGIN and LOGIN7 exchange, records every request the client sends
//! and answers each one through a caller-supplied handler. Fixtures build
//! column metadata and raw cells for handler replies.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mssql_testing::fixtures::{int, int_column, metadata, row};
//! use mssql_testing::{MockTdsServer, Reply, Request};
//!
//! let server = MockTdsServer::builder()
//!     .with_handler(|request: &Request| match request.statement().as_deref() {
//!         Some("SELECT 1") => Reply::new()
//!             .result_set(&metadata(vec![int_column("value")]), &[row(vec![int(1)])])
//!             .unwrap()
//!             .done(Some(1)),
//!         _ => Reply::affected(0),
//!     })
//!     .build()
//!     .await?;
//!
//! // Point a client at server.host() and server.port().
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_server;

pub use mock_server::{
    Handler, MockServerBuilder, MockServerError, MockTdsServer, Reply, Request,
};
