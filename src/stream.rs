//! Outbound stream carrier.

use std::io::Error;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A connection to a destination or upstream proxy, either plain TCP or
/// client-side TLS.
///
/// Dial functions return this so CONNECT tunnels can ride over a
/// TLS-wrapped upstream exactly like over a raw socket.
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// Plain TCP
  Tcp(TcpStream),
  /// TLS over TCP
  Tls(Box<TlsStream<TcpStream>>),
}

impl MaybeTlsStream {
  /// Whether the underlying transport can shut down its read and write
  /// halves independently. Plain TCP can; a TLS session closes as a unit.
  pub fn supports_half_close(&self) -> bool {
    matches!(self, MaybeTlsStream::Tcp(_))
  }

  /// Unwrap to the plain TCP stream, if that is what this is.
  pub fn into_tcp(self) -> Result<TcpStream, MaybeTlsStream> {
    match self {
      MaybeTlsStream::Tcp(stream) => Ok(stream),
      other => Err(other),
    }
  }
}

impl From<TcpStream> for MaybeTlsStream {
  fn from(stream: TcpStream) -> Self {
    MaybeTlsStream::Tcp(stream)
  }
}

impl From<TlsStream<TcpStream>> for MaybeTlsStream {
  fn from(stream: TlsStream<TcpStream>) -> Self {
    MaybeTlsStream::Tls(Box::new(stream))
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}
