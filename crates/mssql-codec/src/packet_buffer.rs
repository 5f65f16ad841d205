//! Message-level reads and writes over packet framing.
//!
//! [`PacketBuffer`] hides packet boundaries from the layers above it.
//! Writes accumulate into the current packet and a full packet is flushed
//! with the EOM bit clear as soon as more data follows; [`PacketBuffer::finish_packet`]
//! flushes the last one with EOM set. Reads pull continuation packets in
//! transparently until the EOM packet has been consumed.

use bytes::{Buf, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
    clamp_packet_size,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::CodecError;
use crate::packet_codec::{Packet, TdsCodec};

/// A complete message reassembled from one or more packets.
#[derive(Debug, Clone)]
pub struct Message {
    /// Type shared by every packet of the message.
    pub packet_type: PacketType,
    /// Concatenated payloads.
    pub payload: Bytes,
}

#[derive(Debug)]
struct Outgoing {
    packet_type: PacketType,
    first_status: PacketStatus,
    buf: BytesMut,
    sent: usize,
}

#[derive(Debug, Default)]
struct Incoming {
    packet_type: Option<PacketType>,
    payload: Bytes,
    eom: bool,
}

/// Buffered packet reader and writer over a byte transport.
pub struct PacketBuffer<T> {
    framed: Framed<T, TdsCodec>,
    packet_size: usize,
    spid: u16,
    outgoing: Option<Outgoing>,
    incoming: Incoming,
}

impl<T> std::fmt::Debug for PacketBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("packet_size", &self.packet_size)
            .field("spid", &self.spid)
            .field("outgoing", &self.outgoing.as_ref().map(|o| o.packet_type))
            .field("incoming", &self.incoming.packet_type)
            .finish_non_exhaustive()
    }
}

impl<T> PacketBuffer<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a transport using the default packet size.
    pub fn new(transport: T) -> Self {
        Self::with_packet_size(transport, DEFAULT_PACKET_SIZE)
    }

    /// Wrap a transport with an explicit packet size.
    pub fn with_packet_size(transport: T, packet_size: usize) -> Self {
        let packet_size = clamp_packet_size(packet_size);
        let codec = TdsCodec::new().with_max_packet_size(packet_size);
        Self {
            framed: Framed::new(transport, codec),
            packet_size,
            spid: 0,
            outgoing: None,
            incoming: Incoming::default(),
        }
    }

    /// Current outgoing packet size, header included.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Adopt a new packet size, typically from a PACKETSIZE ENVCHANGE.
    pub fn set_packet_size(&mut self, size: usize) {
        let size = clamp_packet_size(size);
        if size != self.packet_size {
            tracing::debug!(old = self.packet_size, new = size, "packet size changed");
        }
        self.packet_size = size;
        self.framed.codec_mut().set_max_packet_size(size);
    }

    /// SPID stamped into outgoing headers.
    pub fn set_spid(&mut self, spid: u16) {
        self.spid = spid;
    }

    /// SPID from the last packet the server sent.
    #[must_use]
    pub fn server_spid(&self) -> u16 {
        self.framed.codec().last_spid()
    }

    /// Borrow the transport.
    pub fn get_ref(&self) -> &T {
        self.framed.get_ref()
    }

    /// Mutably borrow the transport.
    pub fn get_mut(&mut self) -> &mut T {
        self.framed.get_mut()
    }

    /// Release the transport. Buffered but unread bytes are dropped.
    pub fn into_inner(self) -> T {
        self.framed.into_inner()
    }

    fn max_payload(&self) -> usize {
        self.packet_size - PACKET_HEADER_SIZE
    }

    // =======================================================================
    // Writing
    // =======================================================================

    /// Start a new outgoing message.
    ///
    /// With `reset_connection` the RESET_CONNECTION status bit is set on
    /// the first packet only.
    pub fn begin_packet(&mut self, packet_type: PacketType, reset_connection: bool) {
        if let Some(previous) = self.outgoing.take() {
            tracing::warn!(
                packet_type = ?previous.packet_type,
                "discarding unfinished outgoing message"
            );
        }
        self.framed.codec_mut().reset_packet_id();
        let first_status = if reset_connection {
            PacketStatus::RESET_CONNECTION
        } else {
            PacketStatus::NORMAL
        };
        self.outgoing = Some(Outgoing {
            packet_type,
            first_status,
            buf: BytesMut::with_capacity(self.max_payload()),
            sent: 0,
        });
    }

    /// Whether an outgoing message is open.
    #[must_use]
    pub fn has_pending_write(&self) -> bool {
        self.outgoing.is_some()
    }

    /// Append bytes to the open message.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), CodecError> {
        let max = self.max_payload();
        loop {
            let out = self.outgoing.as_mut().ok_or(CodecError::NoPacketStarted)?;
            let take = (max - out.buf.len()).min(data.len());
            out.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if data.is_empty() {
                return Ok(());
            }
            self.flush_packet(false).await?;
        }
    }

    /// Append one byte.
    pub async fn write_u8(&mut self, value: u8) -> Result<(), CodecError> {
        self.write(&[value]).await
    }

    /// Append a little-endian u16.
    pub async fn write_u16_le(&mut self, value: u16) -> Result<(), CodecError> {
        self.write(&value.to_le_bytes()).await
    }

    /// Append a little-endian u32.
    pub async fn write_u32_le(&mut self, value: u32) -> Result<(), CodecError> {
        self.write(&value.to_le_bytes()).await
    }

    /// Append a little-endian u64.
    pub async fn write_u64_le(&mut self, value: u64) -> Result<(), CodecError> {
        self.write(&value.to_le_bytes()).await
    }

    /// Append a little-endian f32.
    pub async fn write_f32_le(&mut self, value: f32) -> Result<(), CodecError> {
        self.write(&value.to_le_bytes()).await
    }

    /// Append a little-endian f64.
    pub async fn write_f64_le(&mut self, value: f64) -> Result<(), CodecError> {
        self.write(&value.to_le_bytes()).await
    }

    /// Flush the last packet with EOM set.
    ///
    /// Returns `false` when no message was open, which lets callers flush
    /// unconditionally.
    pub async fn finish_packet(&mut self) -> Result<bool, CodecError> {
        if self.outgoing.is_none() {
            return Ok(false);
        }
        self.flush_packet(true).await?;
        self.outgoing = None;
        Ok(true)
    }

    /// Send a whole message in one call.
    pub async fn write_message(
        &mut self,
        packet_type: PacketType,
        payload: &[u8],
        reset_connection: bool,
    ) -> Result<(), CodecError> {
        self.begin_packet(packet_type, reset_connection);
        self.write(payload).await?;
        self.finish_packet().await?;
        Ok(())
    }

    async fn flush_packet(&mut self, eom: bool) -> Result<(), CodecError> {
        let out = self.outgoing.as_mut().ok_or(CodecError::NoPacketStarted)?;
        let mut status = if eom {
            PacketStatus::END_OF_MESSAGE
        } else {
            PacketStatus::NORMAL
        };
        if out.sent == 0 {
            status |= out.first_status;
        }
        let header = PacketHeader::new(out.packet_type, status, 0).with_spid(self.spid);
        let payload = out.buf.split();
        out.sent += 1;

        self.framed
            .send(Packet::new(header, payload))
            .await
            .map_err(CodecError::sending)
    }

    // =======================================================================
    // Reading
    // =======================================================================

    /// Wait for the first packet of the next incoming message.
    ///
    /// Fails with [`CodecError::PacketPending`] while a write is open.
    pub async fn begin_read(&mut self) -> Result<PacketType, CodecError> {
        if self.outgoing.is_some() {
            return Err(CodecError::PacketPending);
        }
        if self.incoming.packet_type.is_some() && !self.message_complete() {
            tracing::debug!("skipping unread remainder of previous message");
            while !self.incoming.eom {
                self.next_continuation().await?;
            }
        }

        let packet = self.next_packet().await?;
        let packet_type = packet.header.packet_type;
        self.incoming = Incoming {
            packet_type: Some(packet_type),
            eom: packet.is_end_of_message(),
            payload: packet.payload.freeze(),
        };
        Ok(packet_type)
    }

    /// Whether every byte of the current message has been consumed.
    #[must_use]
    pub fn message_complete(&self) -> bool {
        self.incoming.eom && self.incoming.payload.is_empty()
    }

    /// Bytes left in the current packet.
    #[must_use]
    pub fn remaining_in_packet(&self) -> usize {
        self.incoming.payload.len()
    }

    /// Read one byte.
    pub async fn read_u8(&mut self) -> Result<u8, CodecError> {
        self.fill().await?;
        Ok(self.incoming.payload.get_u8())
    }

    /// Read a little-endian u16.
    pub async fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        let b = self.read_array::<2>().await?;
        Ok(u16::from_le_bytes(b))
    }

    /// Read a little-endian u32.
    pub async fn read_u32_le(&mut self) -> Result<u32, CodecError> {
        let b = self.read_array::<4>().await?;
        Ok(u32::from_le_bytes(b))
    }

    /// Read a little-endian u64.
    pub async fn read_u64_le(&mut self) -> Result<u64, CodecError> {
        let b = self.read_array::<8>().await?;
        Ok(u64::from_le_bytes(b))
    }

    /// Read exactly `n` bytes, crossing packet boundaries as needed.
    pub async fn read_bytes(&mut self, n: usize) -> Result<Bytes, CodecError> {
        if self.incoming.payload.len() >= n {
            return Ok(self.incoming.payload.split_to(n));
        }
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            self.fill().await?;
            let take = (n - out.len()).min(self.incoming.payload.len());
            out.extend_from_slice(&self.incoming.payload.split_to(take));
        }
        Ok(out.freeze())
    }

    /// Read a whole message, reassembling continuation packets.
    pub async fn read_message(&mut self) -> Result<Message, CodecError> {
        let packet_type = self.begin_read().await?;
        let mut payload = BytesMut::from(&std::mem::take(&mut self.incoming.payload)[..]);
        while !self.incoming.eom {
            self.next_continuation().await?;
            payload.extend_from_slice(&std::mem::take(&mut self.incoming.payload));
        }
        tracing::trace!(?packet_type, len = payload.len(), "message reassembled");
        Ok(Message {
            packet_type,
            payload: payload.freeze(),
        })
    }

    async fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        if self.incoming.payload.len() >= N {
            self.incoming.payload.copy_to_slice(&mut out);
        } else {
            let bytes = self.read_bytes(N).await?;
            out.copy_from_slice(&bytes);
        }
        Ok(out)
    }

    async fn fill(&mut self) -> Result<(), CodecError> {
        while self.incoming.payload.is_empty() {
            if self.incoming.eom || self.incoming.packet_type.is_none() {
                return Err(CodecError::UnexpectedEndOfMessage);
            }
            self.next_continuation().await?;
        }
        Ok(())
    }

    async fn next_continuation(&mut self) -> Result<(), CodecError> {
        let packet = self.next_packet().await?;
        let expected = self
            .incoming
            .packet_type
            .ok_or(CodecError::UnexpectedEndOfMessage)?;
        if packet.header.packet_type != expected {
            return Err(CodecError::UnexpectedPacketType {
                expected,
                actual: packet.header.packet_type,
            });
        }
        self.incoming.eom = packet.is_end_of_message();
        self.incoming.payload = packet.payload.freeze();
        Ok(())
    }

    async fn next_packet(&mut self) -> Result<Packet, CodecError> {
        match self.framed.next().await {
            Some(Ok(packet)) => Ok(packet),
            Some(Err(e)) => Err(e.receiving()),
            None => Err(CodecError::ConnectionClosed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    async fn read_raw_packet(peer: &mut DuplexStream) -> (Vec<u8>, Vec<u8>) {
        let mut header = [0u8; PACKET_HEADER_SIZE];
        peer.read_exact(&mut header).await.unwrap();
        let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        let mut payload = vec![0u8; len - PACKET_HEADER_SIZE];
        peer.read_exact(&mut payload).await.unwrap();
        (header.to_vec(), payload)
    }

    fn raw(ty: PacketType, eom: bool, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![ty as u8, u8::from(eom), 0, 0, 0, 0x33, 1, 0];
        out[2..4].copy_from_slice(&((PACKET_HEADER_SIZE + payload.len()) as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_write_splits_at_packet_size() {
        let (client, mut server) = duplex(64 * 1024);
        let mut buf = PacketBuffer::with_packet_size(client, 512);

        buf.begin_packet(PacketType::SqlBatch, true);
        buf.write(&[7u8; 1200]).await.unwrap();
        assert!(buf.finish_packet().await.unwrap());

        let mut total = 0;
        for (i, expected_len) in [512usize, 512, 200].into_iter().enumerate() {
            let (header, payload) = read_raw_packet(&mut server).await;
            assert_eq!(header[0], PacketType::SqlBatch as u8);
            assert_eq!(
                usize::from(u16::from_be_bytes([header[2], header[3]])),
                expected_len
            );
            let status = header[1];
            assert_eq!(status & 0x01 != 0, i == 2, "EOM only on last packet");
            assert_eq!(status & 0x08 != 0, i == 0, "reset only on first packet");
            assert_eq!(usize::from(header[6]), i + 1);
            total += payload.len();
        }
        assert_eq!(total, 1200);
    }

    #[tokio::test]
    async fn test_exactly_full_packet_is_single_eom() {
        let (client, mut server) = duplex(64 * 1024);
        let mut buf = PacketBuffer::with_packet_size(client, 512);

        buf.begin_packet(PacketType::Rpc, false);
        buf.write(&[1u8; 504]).await.unwrap();
        buf.finish_packet().await.unwrap();

        let (header, payload) = read_raw_packet(&mut server).await;
        assert_eq!(header[1], 0x01);
        assert_eq!(payload.len(), 504);
    }

    #[tokio::test]
    async fn test_finish_without_begin() {
        let (client, _server) = duplex(1024);
        let mut buf = PacketBuffer::new(client);
        assert!(!buf.finish_packet().await.unwrap());
        assert!(matches!(
            buf.write_u8(1).await,
            Err(CodecError::NoPacketStarted)
        ));
    }

    #[tokio::test]
    async fn test_primitives_little_endian() {
        let (client, mut server) = duplex(1024);
        let mut buf = PacketBuffer::new(client);

        buf.begin_packet(PacketType::BulkLoad, false);
        buf.write_u16_le(0x0102).await.unwrap();
        buf.write_u32_le(0x0304_0506).await.unwrap();
        buf.write_f32_le(1.0).await.unwrap();
        buf.finish_packet().await.unwrap();

        let (_, payload) = read_raw_packet(&mut server).await;
        assert_eq!(
            payload,
            vec![0x02, 0x01, 0x06, 0x05, 0x04, 0x03, 0x00, 0x00, 0x80, 0x3F]
        );
    }

    #[tokio::test]
    async fn test_read_across_packets() {
        let (client, mut server) = duplex(1024);
        let mut buf = PacketBuffer::new(client);

        server
            .write_all(&raw(PacketType::TabularResult, false, &[0x01, 0x02, 0x03]))
            .await
            .unwrap();
        server
            .write_all(&raw(PacketType::TabularResult, true, &[0x04, 0x05, 0x06]))
            .await
            .unwrap();

        assert_eq!(buf.begin_read().await.unwrap(), PacketType::TabularResult);
        assert_eq!(buf.read_u32_le().await.unwrap(), 0x0403_0201);
        assert_eq!(buf.read_u16_le().await.unwrap(), 0x0605);
        assert!(buf.message_complete());
        assert!(matches!(
            buf.read_u8().await,
            Err(CodecError::UnexpectedEndOfMessage)
        ));
        assert_eq!(buf.server_spid(), 0x33);
    }

    #[tokio::test]
    async fn test_read_message_reassembles() {
        let (client, mut server) = duplex(1024);
        let mut buf = PacketBuffer::new(client);

        server
            .write_all(&raw(PacketType::TabularResult, false, b"hello "))
            .await
            .unwrap();
        server
            .write_all(&raw(PacketType::TabularResult, true, b"world"))
            .await
            .unwrap();

        let message = buf.read_message().await.unwrap();
        assert_eq!(message.packet_type, PacketType::TabularResult);
        assert_eq!(&message.payload[..], b"hello world");
    }

    #[tokio::test]
    async fn test_continuation_type_change_rejected() {
        let (client, mut server) = duplex(1024);
        let mut buf = PacketBuffer::new(client);

        server
            .write_all(&raw(PacketType::TabularResult, false, b"a"))
            .await
            .unwrap();
        server
            .write_all(&raw(PacketType::PreLogin, true, b"b"))
            .await
            .unwrap();

        assert!(matches!(
            buf.read_message().await,
            Err(CodecError::UnexpectedPacketType {
                expected: PacketType::TabularResult,
                actual: PacketType::PreLogin
            })
        ));
    }

    #[tokio::test]
    async fn test_read_blocked_by_pending_write() {
        let (client, _server) = duplex(1024);
        let mut buf = PacketBuffer::new(client);
        buf.begin_packet(PacketType::SqlBatch, false);
        buf.write(b"select 1").await.unwrap();
        assert!(matches!(
            buf.begin_read().await,
            Err(CodecError::PacketPending)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_mid_message() {
        let (client, mut server) = duplex(1024);
        let mut buf = PacketBuffer::new(client);
        server
            .write_all(&raw(PacketType::TabularResult, false, b"x"))
            .await
            .unwrap();
        drop(server);

        buf.begin_read().await.unwrap();
        buf.read_u8().await.unwrap();
        assert!(matches!(
            buf.read_u8().await,
            Err(CodecError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_to_closed_peer_has_send_context() {
        let (client, server) = duplex(1024);
        drop(server);
        let mut buf = PacketBuffer::new(client);
        let err = buf
            .write_message(PacketType::SqlBatch, b"select 1", false)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("cannot send packet"), "{err}");
    }

    #[tokio::test]
    async fn test_packet_size_change_applies_to_next_message() {
        let (client, mut server) = duplex(64 * 1024);
        let mut buf = PacketBuffer::new(client);
        buf.set_packet_size(100);
        assert_eq!(buf.packet_size(), 512);
        buf.set_packet_size(8000);

        buf.write_message(PacketType::SqlBatch, &[0u8; 7992], false)
            .await
            .unwrap();
        let (header, _) = read_raw_packet(&mut server).await;
        assert_eq!(u16::from_be_bytes([header[2], header[3]]), 8000);
        assert_eq!(header[1], 0x01);
    }

    #[tokio::test]
    async fn test_scripted_request_and_reply() {
        let mut reply = raw(PacketType::TabularResult, false, b"ab");
        reply.extend(raw(PacketType::TabularResult, true, b"c"));
        let stream = tokio_test::io::Builder::new()
            .write(&[0x01, 0x01, 0x00, 0x0B, 0x00, 0x00, 0x01, 0x00, b'x', b'y', b'z'])
            .read(&reply)
            .build();

        let mut buf = PacketBuffer::new(stream);
        buf.write_message(PacketType::SqlBatch, b"xyz", false)
            .await
            .unwrap();
        let message = buf.read_message().await.unwrap();
        assert_eq!(message.packet_type, PacketType::TabularResult);
        assert_eq!(&message.payload[..], b"abc");
        assert_eq!(buf.server_spid(), 0x33);
    }
}
