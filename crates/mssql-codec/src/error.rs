//! Codec error types.

use std::io;

use tds_protocol::ProtocolError;
use tds_protocol::packet::PacketType;
use thiserror::Error;

/// Errors raised while framing packets.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Raw transport failure outside a send or receive.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The transport failed while a packet was being written.
    #[error("cannot send packet: {0}")]
    Send(#[source] io::Error),

    /// The transport failed while a packet was being read.
    #[error("cannot receive packet: {0}")]
    Receive(#[source] io::Error),

    /// Packet header length field is smaller than the header itself.
    #[error("invalid packet header")]
    InvalidHeader,

    /// Packet exceeds the configured maximum.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge {
        /// Actual size.
        size: usize,
        /// Maximum allowed.
        max: usize,
    },

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A read was started while an outgoing message was still unfinished.
    #[error("outgoing packet not finished")]
    PacketPending,

    /// A write primitive was called without `begin_packet`.
    #[error("no outgoing packet started")]
    NoPacketStarted,

    /// The incoming message ended before the requested bytes were read.
    #[error("unexpected end of message")]
    UnexpectedEndOfMessage,

    /// A continuation packet changed type mid-message.
    #[error("unexpected packet type: expected {expected:?}, got {actual:?}")]
    UnexpectedPacketType {
        /// Type of the message being read.
        expected: PacketType,
        /// Type carried by the continuation packet.
        actual: PacketType,
    },

    /// Malformed header contents.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl CodecError {
    /// Attach send context to a transport error.
    #[must_use]
    pub fn sending(self) -> Self {
        match self {
            Self::Io(e) => Self::Send(e),
            other => other,
        }
    }

    /// Attach receive context to a transport error.
    #[must_use]
    pub fn receiving(self) -> Self {
        match self {
            Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            Self::Io(e) => Self::Receive(e),
            other => other,
        }
    }

    /// Whether the connection can no longer be used.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Send(_) | Self::Receive(_) | Self::ConnectionClosed
        )
    }
}
