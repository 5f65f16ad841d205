//! PRELOGIN framing for the in-band TLS handshake.
//!
//! Outside strict mode the TLS handshake records travel inside PRELOGIN
//! packets. [`PreloginStream`] sits between the TLS engine and the raw
//! transport: while the handshake runs it frames outgoing records into
//! PRELOGIN packets on flush and strips packet headers from incoming
//! data. Once [`PreloginStream::handshake_complete`] is called it becomes
//! a pass-through.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Buf, BytesMut};
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
    clamp_packet_size,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Transport adapter that wraps TLS handshake bytes in PRELOGIN packets.
#[derive(Debug)]
pub struct PreloginStream<S> {
    inner: S,
    handshaking: bool,
    packet_size: usize,

    header: [u8; PACKET_HEADER_SIZE],
    header_filled: usize,
    remaining: usize,

    pending: BytesMut,
    framed: BytesMut,
}

impl<S> PreloginStream<S> {
    /// Wrap a transport that has just completed the cleartext PRELOGIN
    /// exchange.
    pub fn new(inner: S) -> Self {
        Self::with_packet_size(inner, DEFAULT_PACKET_SIZE)
    }

    /// Wrap a transport, splitting handshake data at `packet_size`.
    pub fn with_packet_size(inner: S, packet_size: usize) -> Self {
        Self {
            inner,
            handshaking: true,
            packet_size: clamp_packet_size(packet_size),
            header: [0; PACKET_HEADER_SIZE],
            header_filled: 0,
            remaining: 0,
            pending: BytesMut::new(),
            framed: BytesMut::new(),
        }
    }

    /// Stop framing. Subsequent I/O goes straight to the transport.
    pub fn handshake_complete(&mut self) {
        tracing::debug!("in-band TLS handshake complete");
        self.handshaking = false;
    }

    /// Whether handshake framing is still active.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.handshaking
    }

    /// Whether handshake bytes are buffered but not yet framed.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || !self.framed.is_empty()
    }

    /// Borrow the transport.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the transport.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Release the transport.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn frame_pending(&mut self) {
        let max_payload = self.packet_size - PACKET_HEADER_SIZE;
        let mut packet_id: u8 = 1;
        while !self.pending.is_empty() {
            let take = self.pending.len().min(max_payload);
            let chunk = self.pending.split_to(take);
            let status = if self.pending.is_empty() {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            let header = PacketHeader::new(
                PacketType::PreLogin,
                status,
                (PACKET_HEADER_SIZE + take) as u16,
            )
            .with_packet_id(packet_id);
            header.encode(&mut self.framed);
            self.framed.extend_from_slice(&chunk);
            packet_id = packet_id.wrapping_add(1);
        }
    }
}

impl<S: AsyncWrite + Unpin> PreloginStream<S> {
    /// Write out any buffered handshake bytes as PRELOGIN packets.
    ///
    /// Resolves to `false` when nothing was pending so no empty packet is
    /// ever emitted.
    pub fn poll_finish_packet(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<bool>> {
        if self.framed.is_empty() {
            if self.pending.is_empty() {
                return Poll::Ready(Ok(false));
            }
            tracing::trace!(len = self.pending.len(), "framing TLS handshake data");
            self.frame_pending();
        }
        while !self.framed.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.framed))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.framed.advance(n);
        }
        Poll::Ready(Ok(true))
    }

    /// Async form of [`Self::poll_finish_packet`].
    pub async fn finish_packet(&mut self) -> io::Result<bool> {
        poll_fn(|cx| self.poll_finish_packet(cx)).await
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PreloginStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.handshaking {
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        while this.remaining == 0 {
            while this.header_filled < PACKET_HEADER_SIZE {
                let mut header_buf = ReadBuf::new(&mut this.header[this.header_filled..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut header_buf))?;
                let n = header_buf.filled().len();
                if n == 0 {
                    if this.header_filled == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                this.header_filled += n;
            }

            let header = PacketHeader::decode(&mut &this.header[..])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if header.packet_type != PacketType::PreLogin {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "expected PRELOGIN packet during TLS handshake, got {:?}",
                        header.packet_type
                    ),
                )));
            }
            this.remaining = header.payload_length();
            if this.remaining == 0 {
                this.header_filled = 0;
            }
        }

        let want = this.remaining.min(buf.remaining());
        if want == 0 {
            return Poll::Ready(Ok(()));
        }
        let n = {
            let dst = buf.initialize_unfilled_to(want);
            let mut sub = ReadBuf::new(dst);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut sub))?;
            sub.filled().len()
        };
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }
        buf.advance(n);
        this.remaining -= n;
        if this.remaining == 0 {
            this.header_filled = 0;
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PreloginStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.handshaking {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        this.pending.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.handshaking {
            ready!(this.poll_finish_packet(cx))?;
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
