//! # mssql-codec
//!
//! Packet framing between a byte transport and the TDS message layer.
//!
//! ```text
//! transport -> TdsCodec (one packet) -> PacketBuffer (one message) -> client
//! ```
//!
//! [`TdsCodec`] plugs into `tokio_util::codec::Framed` and handles one
//! packet at a time. [`PacketBuffer`] builds on it: outgoing messages are
//! split at the negotiated packet size with EOM on the last packet only,
//! and incoming continuation packets are read transparently.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod packet_buffer;
pub mod packet_codec;

pub use error::CodecError;
pub use packet_buffer::{Message, PacketBuffer};
pub use packet_codec::{Packet, TdsCodec};
