//! CONNECT dialing through an upstream HTTP(S) proxy.
//!
//! When the proxy itself sits behind another proxy, CONNECT tunnels are not
//! opened directly: the upstream is dialed (plain or TLS), asked to
//! `CONNECT` to the real destination, and on a `200` the raw connection is
//! handed back ready to carry the tunnel bytes.

use crate::error::{Error, Result};
use crate::http1;
use crate::stream::MaybeTlsStream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

/// Opens a connection that already tunnels to the given `host:port`
/// destination.
pub type ConnectDial = Arc<
  dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<MaybeTlsStream>> + Send>> + Send + Sync,
>;

/// Build a [`ConnectDial`] from the `HTTPS_PROXY` (then `https_proxy`)
/// environment variable, if one is set and parseable.
pub fn dial_from_env(tls: Arc<ClientConfig>) -> Option<ConnectDial> {
  let upstream = std::env::var("HTTPS_PROXY")
    .or_else(|_| std::env::var("https_proxy"))
    .ok()
    .filter(|v| !v.is_empty())?;
  match connect_dial_to(&upstream, tls) {
    Ok(dial) => Some(dial),
    Err(e) => {
      tracing::error!(%upstream, error = %e, "ignoring unusable upstream proxy");
      None
    }
  }
}

/// Build a [`ConnectDial`] routing through the upstream proxy at `upstream`
/// (`http://host[:80]` or `https://host[:443]`).
pub fn connect_dial_to(upstream: &str, tls: Arc<ClientConfig>) -> Result<ConnectDial> {
  let uri: http::Uri = upstream.parse()?;
  let host = uri
    .host()
    .ok_or_else(|| Error::connect(format!("upstream proxy URL has no host: {upstream}")))?
    .to_string();
  let scheme = uri.scheme_str().unwrap_or("http").to_string();
  let https = match scheme.as_str() {
    "http" => false,
    "https" => true,
    other => {
      return Err(Error::connect(format!(
        "unsupported upstream proxy scheme: {other}"
      )))
    }
  };
  let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });
  let proxy_addr = format!("{host}:{port}");

  Ok(Arc::new(move |addr: String| {
    let proxy_addr = proxy_addr.clone();
    let proxy_host = host.clone();
    let tls = tls.clone();
    Box::pin(async move {
      let tcp = TcpStream::connect(&proxy_addr)
        .await
        .map_err(|e| Error::connect(format!("failed to dial upstream {proxy_addr}: {e}")))?;
      let mut stream: MaybeTlsStream = if https {
        let name = ServerName::try_from(proxy_host.clone())
          .map_err(|_| Error::connect(format!("invalid upstream server name: {proxy_host}")))?;
        let connector = TlsConnector::from(tls);
        connector
          .connect(name, tcp)
          .await
          .map_err(|e| {
            Error::connect(format!("TLS handshake with upstream {proxy_addr} failed: {e}"))
          })?
          .into()
      } else {
        tcp.into()
      };

      stream
        .write_all(format!("CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n").as_bytes())
        .await?;
      stream.flush().await?;

      // A buffered reader is safe to discard here: the party on the far
      // side of the tunnel will not speak until spoken to.
      let mut reader = BufReader::new(&mut stream);
      let head = http1::read_response_head(&mut reader).await?;
      if head.status() != http::StatusCode::OK {
        let mut body = Vec::new();
        if https {
          (&mut reader).take(500).read_to_end(&mut body).await?;
        } else {
          reader.read_to_end(&mut body).await?;
        }
        return Err(Error::UpstreamRefused(String::from_utf8_lossy(&body).into_owned()));
      }
      Ok(stream)
    })
  }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncBufReadExt;
  use tokio::net::TcpListener;

  fn skip_verify() -> Arc<ClientConfig> {
    crate::transport::Transport::new().tls_config()
  }

  #[tokio::test]
  async fn sends_connect_and_returns_stream_on_200() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (socket, _) = listener.accept().await.unwrap();
      let mut reader = BufReader::new(socket);
      let mut line = String::new();
      reader.read_line(&mut line).await.unwrap();
      assert_eq!(line, "CONNECT origin.example:443 HTTP/1.1\r\n");
      let mut host = String::new();
      reader.read_line(&mut host).await.unwrap();
      assert_eq!(host, "Host: origin.example:443\r\n");
      let mut blank = String::new();
      reader.read_line(&mut blank).await.unwrap();
      let mut socket = reader.into_inner();
      socket.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
      // Echo one tunneled byte back.
      let mut byte = [0u8; 1];
      socket.read_exact(&mut byte).await.unwrap();
      socket.write_all(&byte).await.unwrap();
    });

    let dial = connect_dial_to(&format!("http://{addr}"), skip_verify()).unwrap();
    let mut stream = dial("origin.example:443".to_string()).await.unwrap();
    stream.write_all(b"x").await.unwrap();
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).await.unwrap();
    assert_eq!(&byte, b"x");
  }

  #[tokio::test]
  async fn refusal_carries_upstream_body() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (socket, _) = listener.accept().await.unwrap();
      let mut reader = BufReader::new(socket);
      loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        if line == "\r\n" {
          break;
        }
      }
      let mut socket = reader.into_inner();
      socket
        .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 6\r\n\r\ndenied")
        .await
        .unwrap();
    });

    let dial = connect_dial_to(&format!("http://{addr}"), skip_verify()).unwrap();
    let err = dial("origin.example:443".to_string()).await.unwrap_err();
    let text = err.to_string();
    assert!(text.contains("proxy refused connection"));
    assert!(text.contains("denied"));
  }

  #[tokio::test]
  async fn rejects_non_proxy_schemes() {
    assert!(connect_dial_to("socks5://127.0.0.1:1080", skip_verify()).is_err());
  }

  #[test]
  fn env_discovery_prefers_uppercase() {
    std::env::set_var("HTTPS_PROXY", "http://up.example:3128");
    std::env::set_var("https_proxy", "http://other.example:3128");
    let dial = dial_from_env(skip_verify());
    assert!(dial.is_some());
    std::env::remove_var("HTTPS_PROXY");
    std::env::remove_var("https_proxy");
    assert!(dial_from_env(skip_verify()).is_none());
  }
}
