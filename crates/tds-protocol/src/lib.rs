//! # tds-protocol
//!
//! Wire structures of the MS-TDS (Tabular Data Stream) protocol used by
//! Microsoft SQL Server.
//!
//! This crate is IO-agnostic: it knows how bytes are laid out but never
//! touches a socket. Packet framing over a transport lives in `mssql-codec`,
//! conversion between wire bytes and Rust values in `mssql-types`.
//!
//! ## Contents
//!
//! - [`packet`]: the 8-byte packet header
//! - [`prelogin`] and [`login7`]: the handshake messages, with
//!   [`feature`] extensions and their acknowledgement
//! - [`types`]: wire type ids, the type descriptor table and `TYPE_INFO`
//! - [`plp`] and [`value`]: framing of single column or parameter values
//! - [`token`]: the token stream parser
//! - [`sql_batch`] and [`rpc`]: request payloads
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::token::{Token, TokenParser};
//!
//! // DONE, final, 3 rows
//! let raw = [0xFD, 0x10, 0x00, 0xC1, 0x00, 3, 0, 0, 0, 0, 0, 0, 0];
//! let mut parser = TokenParser::new(bytes::Bytes::copy_from_slice(&raw));
//! match parser.next_token().unwrap() {
//!     Some(Token::Done(done)) => assert_eq!(done.rows_affected(), Some(3)),
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod feature;
pub mod login7;
pub mod packet;
pub mod plp;
pub mod prelogin;
pub mod rpc;
pub mod sql_batch;
pub mod token;
pub mod types;
pub mod value;
pub mod version;

pub use error::ProtocolError;
pub use feature::{FeatureAcks, FeatureExtension, FeatureId, FedAuthLibrary};
pub use login7::Login7;
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    PacketType,
};
pub use prelogin::{EncryptionLevel, PreLogin, TraceId};
pub use rpc::{ParamFlags, ProcId, Procedure, RpcParam, RpcRequest};
pub use sql_batch::{decode_sql_batch, encode_sql_batch};
pub use token::{
    ColMetaData, ColumnData, Done, DoneStatus, EnvChange, EnvChangeType, EnvChangeValue,
    FedAuthInfo, LoginAck, RawRow, ReturnValue, ServerMessage, Token, TokenParser, TokenType,
};
pub use types::{Collation, ColumnFlags, TypeId, TypeInfo, UdtInfo};
pub use version::{DriverVersion, SqlServerVersion, TdsVersion};
