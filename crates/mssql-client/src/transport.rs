//! Byte transports under the packet layer.
//!
//! A [`Dialer`] opens a [`Transport`]; the client layers TLS over it as
//! negotiation dictates. Named pipes, shared memory and proxies plug in by
//! implementing [`Dialer`].

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use mssql_tls::{PreloginStream, TlsStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// A duplex byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;

/// Opens transports to a server.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `host:port`.
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedTransport>;
}

/// Plain TCP with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait::async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> io::Result<BoxedTransport> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(peer = ?stream.peer_addr().ok(), "TCP connection established");
        Ok(Box::new(stream))
    }
}

/// A transport with or without TLS.
pub enum MaybeTlsStream<S> {
    /// No TLS.
    Plain(S),
    /// TLS negotiated inside PRELOGIN packets.
    PreloginTls(Box<TlsStream<PreloginStream<S>>>),
    /// TLS established before any TDS traffic.
    Tls(Box<TlsStream<S>>),
}

impl<S> MaybeTlsStream<S> {
    /// Whether traffic is encrypted.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        !matches!(self, Self::Plain(_))
    }

    /// DER of the server's leaf certificate, when TLS is active.
    #[must_use]
    pub fn peer_certificate(&self) -> Option<&[u8]> {
        match self {
            Self::Plain(_) => None,
            Self::PreloginTls(tls) => mssql_tls::peer_certificate(&**tls).map(|c| c.as_ref()),
            Self::Tls(tls) => mssql_tls::peer_certificate(&**tls).map(|c| c.as_ref()),
        }
    }

    /// Drop the in-band TLS layer and return the raw transport.
    ///
    /// Used when encryption covers the login packet only. Strict TLS cannot
    /// be removed and is returned unchanged.
    #[must_use]
    pub fn into_plain(self) -> Self {
        match self {
            Self::PreloginTls(tls) => {
                let (prelogin, _) = (*tls).into_inner();
                Self::Plain(prelogin.into_inner())
            }
            other => other,
        }
    }
}

impl<S> std::fmt::Debug for MaybeTlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Plain(_) => "MaybeTlsStream::Plain",
            Self::PreloginTls(_) => "MaybeTlsStream::PreloginTls",
            Self::Tls(_) => "MaybeTlsStream::Tls",
        })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::PreloginTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::PreloginTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::PreloginTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::PreloginTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
