//! Bidirectional byte splicing for accepted tunnels.

use crate::action::ClientStream;
use crate::stream::MaybeTlsStream;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Splice the client connection and the destination together until both
/// directions are drained.
///
/// Plain-TCP pairs get the half-close treatment: each direction is copied
/// independently and the destination's write side shut down as soon as its
/// source reaches EOF, so a half-closed tunnel keeps flowing the other way.
/// When the destination rides TLS (an upstream proxy over HTTPS), both
/// copies are joined and the endpoints closed together, since a TLS session
/// cannot shut down one half by itself.
///
/// Copy errors end their own direction only; they are logged, never
/// propagated.
pub(crate) async fn splice(client: ClientStream, target: MaybeTlsStream) {
  match target {
    MaybeTlsStream::Tcp(mut target_tcp) => {
      // Bytes the client pipelined ahead of the CONNECT reply are sitting
      // in the read buffer; they belong to the destination.
      let buffered = client.buffer().to_vec();
      let client_tcp = client.into_inner();
      if !buffered.is_empty() {
        if let Err(e) = target_tcp.write_all(&buffered).await {
          tracing::error!(error = %e, "failed to flush pipelined bytes to tunnel target");
          return;
        }
      }
      let (client_read, client_write) = client_tcp.into_split();
      let (target_read, target_write) = target_tcp.into_split();
      let up = tokio::spawn(copy_then_shutdown(client_read, target_write));
      let down = tokio::spawn(copy_then_shutdown(target_read, client_write));
      let _ = up.await;
      let _ = down.await;
    }
    target => {
      let (mut client_read, mut client_write) = tokio::io::split(client);
      let (mut target_read, mut target_write) = tokio::io::split(target);
      tokio::join!(
        copy_or_log(&mut client_read, &mut target_write),
        copy_or_log(&mut target_read, &mut client_write),
      );
      let _ = client_write.shutdown().await;
      let _ = target_write.shutdown().await;
    }
  }
}

async fn copy_then_shutdown<R, W>(mut src: R, mut dst: W)
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  copy_or_log(&mut src, &mut dst).await;
  let _ = dst.shutdown().await;
}

async fn copy_or_log<R, W>(src: &mut R, dst: &mut W)
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  if let Err(e) = tokio::io::copy(src, dst).await {
    tracing::error!(error = %e, "tunnel copy ended with error");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, BufReader};
  use tokio::net::{TcpListener, TcpStream};

  /// An echo server that copies until EOF, then closes.
  async fn spawn_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let (mut read, mut write) = socket.split();
      let _ = tokio::io::copy(&mut read, &mut write).await;
    });
    addr
  }

  #[tokio::test]
  async fn tcp_pair_splices_and_propagates_half_close() {
    let echo = spawn_echo().await;
    let proxy_side = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_side.local_addr().unwrap();

    let splicer = tokio::spawn(async move {
      let (client, _) = proxy_side.accept().await.unwrap();
      let target = TcpStream::connect(echo).await.unwrap();
      splice(BufReader::new(client), target.into()).await;
    });

    let mut app = TcpStream::connect(proxy_addr).await.unwrap();
    app.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    app.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // Closing our write side must travel through to the echo server and
    // come back as EOF.
    app.shutdown().await.unwrap();
    let mut rest = Vec::new();
    app.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    splicer.await.unwrap();
  }

  #[tokio::test]
  async fn pipelined_bytes_reach_the_target() {
    let echo = spawn_echo().await;
    let proxy_side = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_side.local_addr().unwrap();

    let splicer = tokio::spawn(async move {
      let (client, _) = proxy_side.accept().await.unwrap();
      let mut reader = BufReader::new(client);
      // Simulate a CONNECT parse that left early bytes in the buffer.
      let mut first = [0u8; 1];
      reader.read_exact(&mut first).await.unwrap();
      assert_eq!(&first, b"a");
      let target = TcpStream::connect(echo).await.unwrap();
      splice(reader, target.into()).await;
    });

    let mut app = TcpStream::connect(proxy_addr).await.unwrap();
    app.write_all(b"abc").await.unwrap();
    app.shutdown().await.unwrap();
    let mut rest = Vec::new();
    app.read_to_end(&mut rest).await.unwrap();
    assert_eq!(&rest, b"bc");
    splicer.await.unwrap();
  }
}
