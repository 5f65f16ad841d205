//! Packet framing.
//!
//! Every logical message (a batch, an RPC call, a server response) is cut
//! into packets no larger than the negotiated size. Each packet carries an
//! 8-byte header:
//!
//! ```text
//! +------+--------+------------+------------+-----------+--------+
//! | type | status | length(BE) |  spid(BE)  | packet id | window |
//! |  1   |   1    |     2      |     2      |     1     |   1    |
//! +------+--------+------------+------------+-----------+--------+
//! ```
//!
//! `length` counts the header itself. Only the last packet of a message has
//! the EOM status bit set.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::ProtocolError;

/// Header length in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Largest packet the 15-bit length field may describe.
pub const MAX_PACKET_SIZE: usize = 32767;

/// Smallest packet size a server accepts.
pub const MIN_PACKET_SIZE: usize = 512;

/// Packet size in effect before login negotiates another.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Force a requested packet size into `MIN_PACKET_SIZE..=MAX_PACKET_SIZE`.
#[must_use]
pub fn clamp_packet_size(requested: usize) -> usize {
    requested.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE)
}

/// Message kind announced in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL text.
    SqlBatch = 0x01,
    /// Procedure call, including `sp_executesql`.
    Rpc = 0x03,
    /// Any server response.
    TabularResult = 0x04,
    /// Cancel the running request.
    Attention = 0x06,
    /// Rows of a bulk load.
    BulkLoad = 0x07,
    /// Federated authentication token.
    FedAuthToken = 0x08,
    /// Distributed transaction manager request.
    TransactionManager = 0x0E,
    /// LOGIN7.
    Tds7Login = 0x10,
    /// SSPI continuation.
    Sspi = 0x11,
    /// PRELOGIN, and the TLS records tunnelled through it.
    PreLogin = 0x12,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Ok(match byte {
            0x01 => Self::SqlBatch,
            0x03 => Self::Rpc,
            0x04 => Self::TabularResult,
            0x06 => Self::Attention,
            0x07 => Self::BulkLoad,
            0x08 => Self::FedAuthToken,
            0x0E => Self::TransactionManager,
            0x10 => Self::Tds7Login,
            0x11 => Self::Sspi,
            0x12 => Self::PreLogin,
            other => return Err(ProtocolError::InvalidPacketType(other)),
        })
    }
}

bitflags! {
    /// Status bits of a packet header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// No bits set: more packets of this message follow.
        const NORMAL = 0x00;
        /// Final packet of the message.
        const END_OF_MESSAGE = 0x01;
        /// Server should discard the message.
        const IGNORE = 0x02;
        /// Reset session state before running the request.
        const RESET_CONNECTION = 0x08;
        /// As `RESET_CONNECTION`, keeping the open transaction.
        const RESET_CONNECTION_SKIP_TRAN = 0x10;
    }
}

/// One packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Message kind.
    pub packet_type: PacketType,
    /// Status bits.
    pub status: PacketStatus,
    /// Packet length including these 8 bytes.
    pub length: u16,
    /// Server session id; zero on client packets.
    pub spid: u16,
    /// Sequence number within the message, wrapping at 255.
    pub packet_id: u8,
    /// Reserved.
    pub window: u8,
}

impl PacketHeader {
    /// A header with spid, packet id and window zeroed.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Read a header. Unknown packet types and status bits are rejected.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        let available = src.remaining();
        if available < PACKET_HEADER_SIZE {
            return Err(ProtocolError::IncompletePacket {
                expected: PACKET_HEADER_SIZE,
                actual: available,
            });
        }
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        src.copy_to_slice(&mut raw);

        Ok(Self {
            packet_type: PacketType::try_from(raw[0])?,
            status: PacketStatus::from_bits(raw[1])
                .ok_or(ProtocolError::InvalidPacketStatus(raw[1]))?,
            length: u16::from_be_bytes([raw[2], raw[3]]),
            spid: u16::from_be_bytes([raw[4], raw[5]]),
            packet_id: raw[6],
            window: raw[7],
        })
    }

    /// Reject a length shorter than the header or longer than `packet_size`.
    ///
    /// Returns the payload length on success.
    pub fn validate(&self, packet_size: usize) -> Result<usize, ProtocolError> {
        let length = usize::from(self.length);
        let limit = packet_size.max(MIN_PACKET_SIZE);
        if !(PACKET_HEADER_SIZE..=limit).contains(&length) {
            return Err(ProtocolError::InvalidLength {
                context: "packet header",
                length,
            });
        }
        Ok(length - PACKET_HEADER_SIZE)
    }

    /// Write the header.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_slice(&[self.packet_type as u8, self.status.bits()]);
        dst.put_u16(self.length);
        dst.put_u16(self.spid);
        dst.put_slice(&[self.packet_id, self.window]);
    }

    /// Bytes following the header.
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        (self.length as usize).saturating_sub(PACKET_HEADER_SIZE)
    }

    /// Whether EOM is set.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Same header with another sequence number.
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }

    /// Same header with another spid.
    #[must_use]
    pub const fn with_spid(mut self, spid: u16) -> Self {
        self.spid = spid;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = PacketHeader::new(
            PacketType::Rpc,
            PacketStatus::END_OF_MESSAGE | PacketStatus::RESET_CONNECTION,
            100,
        )
        .with_spid(54)
        .with_packet_id(3);

        let mut wire = Vec::new();
        header.encode(&mut wire);
        assert_eq!(wire, [0x03, 0x09, 0x00, 0x64, 0x00, 0x36, 0x03, 0x00]);
        assert_eq!(PacketHeader::decode(&mut &wire[..]).unwrap(), header);
        assert_eq!(header.payload_length(), 92);
    }

    #[test]
    fn test_validate_bounds() {
        let big = PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 4200);
        assert!(big.validate(4096).is_err());
        assert_eq!(big.validate(8192).unwrap(), 4192);

        let runt = PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 4);
        assert!(runt.validate(4096).is_err());

        let bare = PacketHeader::new(PacketType::Attention, PacketStatus::END_OF_MESSAGE, 8);
        assert_eq!(bare.validate(512).unwrap(), 0);
    }

    #[test]
    fn test_decode_rejects_bad_fields() {
        let status = [0x04, 0x40, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(
            PacketHeader::decode(&mut &status[..]),
            Err(ProtocolError::InvalidPacketStatus(0x40))
        );

        let kind = [0xFF, 0x01, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(
            PacketHeader::decode(&mut &kind[..]),
            Err(ProtocolError::InvalidPacketType(0xFF))
        );

        assert!(matches!(
            PacketHeader::decode(&mut &kind[..5]),
            Err(ProtocolError::IncompletePacket { expected: 8, actual: 5 })
        ));
    }

    #[test]
    fn test_clamp_packet_size() {
        assert_eq!(clamp_packet_size(100), MIN_PACKET_SIZE);
        assert_eq!(clamp_packet_size(DEFAULT_PACKET_SIZE), DEFAULT_PACKET_SIZE);
        assert_eq!(clamp_packet_size(65535), MAX_PACKET_SIZE);
    }
}
