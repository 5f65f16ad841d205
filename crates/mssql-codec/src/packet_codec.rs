//! Single-packet framing for `tokio_util::codec`.

use bytes::{Buf, BufMut, BytesMut};
use tds_protocol::packet::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// One TDS packet: header plus payload.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet header. `length` and `packet_id` are filled in on encode.
    pub header: PacketHeader,
    /// Payload bytes following the header.
    pub payload: BytesMut,
}

impl Packet {
    /// Create a packet.
    #[must_use]
    pub fn new(header: PacketHeader, payload: BytesMut) -> Self {
        Self { header, payload }
    }

    /// Size on the wire.
    #[must_use]
    pub fn total_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Whether this packet carries the EOM status bit.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// Packet codec.
///
/// Decoding accepts anything up to [`MAX_PACKET_SIZE`] because the server
/// may answer with the negotiated size before the client has seen the
/// ENVCHANGE announcing it. Encoding is bounded by the outgoing limit.
#[derive(Debug)]
pub struct TdsCodec {
    max_outgoing: usize,
    packet_id: u8,
    last_spid: u16,
}

impl TdsCodec {
    /// Create a codec bounded by the protocol maximum.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_outgoing: MAX_PACKET_SIZE,
            packet_id: 1,
            last_spid: 0,
        }
    }

    /// Bound outgoing packets to `size` bytes.
    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.set_max_packet_size(size);
        self
    }

    /// Change the outgoing bound.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_outgoing = size.clamp(PACKET_HEADER_SIZE + 1, MAX_PACKET_SIZE);
    }

    /// Restart packet numbering. Called at the start of every message.
    pub fn reset_packet_id(&mut self) {
        self.packet_id = 1;
    }

    /// Server process id seen on the most recent incoming packet.
    #[must_use]
    pub fn last_spid(&self) -> u16 {
        self.last_spid
    }

    fn next_packet_id(&mut self) -> u8 {
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        id
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let header = PacketHeader::decode(&mut &src[..PACKET_HEADER_SIZE])?;
        let length = usize::from(header.length);
        if length > MAX_PACKET_SIZE {
            return Err(CodecError::PacketTooLarge {
                size: length,
                max: MAX_PACKET_SIZE,
            });
        }
        header
            .validate(MAX_PACKET_SIZE)
            .map_err(|_| CodecError::InvalidHeader)?;
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut payload = src.split_to(length);
        payload.advance(PACKET_HEADER_SIZE);
        self.last_spid = header.spid;

        tracing::trace!(
            packet_type = ?header.packet_type,
            length,
            packet_id = header.packet_id,
            eom = header.is_end_of_message(),
            "received packet"
        );

        Ok(Some(Packet::new(header, payload)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(packet) => Ok(Some(packet)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::ConnectionClosed),
        }
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total = item.total_size();
        if total > self.max_outgoing {
            return Err(CodecError::PacketTooLarge {
                size: total,
                max: self.max_outgoing,
            });
        }

        let mut header = item.header;
        header.length = total as u16;
        header.packet_id = self.next_packet_id();

        dst.reserve(total);
        header.encode(dst);
        dst.put_slice(&item.payload);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = total,
            packet_id = header.packet_id,
            status = header.status.bits(),
            "sent packet"
        );

        Ok(())
    }
}
