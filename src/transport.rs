//! Outbound exchanges.
//!
//! [`RoundTrip`] is the seam between the proxy engine and whatever carries
//! a request to its destination: the engine hands over a request and wants
//! a response back, nothing more. [`Transport`] is the default
//! implementation, a deliberately small HTTP/1 client that opens one
//! connection per exchange.

use crate::error::{new_io_error, Error, Result};
use crate::http1;
use crate::message::{Request, Response};
use crate::stream::MaybeTlsStream;
use async_trait::async_trait;
use http::header::CONNECTION;
use http::HeaderValue;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

/// Performs one outbound exchange: send a request, return the response.
#[async_trait]
pub trait RoundTrip: Send + Sync {
  /// Send `req` to its destination and read the response.
  async fn round_trip(&self, req: &Request) -> Result<Response>;
}

/// Default outbound transport: per-exchange TCP (or TLS) connections
/// speaking HTTP/1.1.
///
/// The TLS side does **not** verify origin certificates by default — an
/// intercepting proxy is routinely pointed at hosts with self-signed or
/// replaced certificates, and the operator has already accepted that the
/// proxy sits inside the trust boundary. Use [`Transport::with_root_store`]
/// to restore verification.
pub struct Transport {
  tls: Arc<ClientConfig>,
}

impl Transport {
  /// A transport with the (documented) skip-verify TLS default.
  pub fn new() -> Self {
    let config = ClientConfig::builder()
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth();
    Self {
      tls: Arc::new(config),
    }
  }

  /// A transport that verifies origin certificates against `roots`.
  pub fn with_root_store(roots: RootCertStore) -> Self {
    let config = ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth();
    Self {
      tls: Arc::new(config),
    }
  }

  /// A transport with a caller-built TLS client configuration.
  pub fn with_tls_config(tls: Arc<ClientConfig>) -> Self {
    Self { tls }
  }

  /// The TLS client configuration outbound connections use.
  pub fn tls_config(&self) -> Arc<ClientConfig> {
    self.tls.clone()
  }

  /// Open a plain TCP connection to `addr` (`host:port`).
  pub async fn dial(&self, addr: &str) -> Result<TcpStream> {
    TcpStream::connect(addr)
      .await
      .map_err(|e| Error::connect(format!("failed to dial {addr}: {e}")))
  }

  /// Open a TLS connection to `host:port`, handshaking for `host`.
  pub async fn dial_tls(&self, host: &str, port: u16) -> Result<MaybeTlsStream> {
    let tcp = self.dial(&format!("{host}:{port}")).await?;
    let name = ServerName::try_from(host.to_string())
      .map_err(|_| Error::connect(format!("invalid TLS server name: {host}")))?;
    let connector = TlsConnector::from(self.tls.clone());
    let stream = connector
      .connect(name, tcp)
      .await
      .map_err(|e| Error::connect(format!("TLS handshake with {host}:{port} failed: {e}")))?;
    Ok(stream.into())
  }
}

impl Default for Transport {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for Transport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Transport").finish_non_exhaustive()
  }
}

#[async_trait]
impl RoundTrip for Transport {
  async fn round_trip(&self, req: &Request) -> Result<Response> {
    let uri = req.uri();
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = uri
      .host()
      .ok_or_else(|| new_io_error(std::io::ErrorKind::InvalidInput, "request URI has no host"))?;
    let port = uri
      .port_u16()
      .unwrap_or(if scheme == "https" { 443 } else { 80 });

    let mut stream: MaybeTlsStream = if scheme == "https" {
      self.dial_tls(host, port).await?
    } else {
      self.dial(&format!("{host}:{port}")).await?.into()
    };

    // One connection per exchange; asking the origin to close lets
    // unframed bodies terminate at EOF.
    let mut outbound = req.clone();
    outbound
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static("close"));
    http1::write_request(&mut stream, &outbound, true).await?;

    let mut reader = BufReader::new(&mut stream);
    http1::read_response(&mut reader, req.method()).await
  }
}

/// Certificate verifier that accepts whatever the origin presents.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::Bytes;
  use tokio::io::AsyncWriteExt;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn round_trip_against_local_origin() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut reader = BufReader::new(&mut socket);
      let req = http1::read_request(&mut reader).await.unwrap().unwrap();
      assert_eq!(req.uri().path(), "/hello");
      assert_eq!(req.headers().get(CONNECTION).unwrap(), "close");
      socket
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
        .await
        .unwrap();
    });

    let req: Request = http::Request::builder()
      .uri(format!("http://{addr}/hello"))
      .body(Bytes::new())
      .unwrap()
      .into();
    let resp = Transport::new().round_trip(&req).await.unwrap();
    assert_eq!(resp.status_code(), http::StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"ok");
  }

  #[tokio::test]
  async fn round_trip_surfaces_dial_failure() {
    // Port 9 on loopback is assumed closed.
    let req: Request = http::Request::builder()
      .uri("http://127.0.0.1:9/")
      .body(Bytes::new())
      .unwrap()
      .into();
    assert!(Transport::new().round_trip(&req).await.is_err());
  }
}
