//! CONNECT verdicts.

use crate::error::Result;
use crate::message::Request;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;

/// The client side of a proxied connection, handed to hijack callbacks.
///
/// Buffered so that bytes a pipelining client sent ahead of the CONNECT
/// reply are not lost between the header parse and the tunnel.
pub type ClientStream = BufReader<TcpStream>;

/// A callback taking ownership of the client connection after a hijack.
///
/// The engine has already written the CONNECT response line when the
/// callback runs; for [`ConnectAction::proxy_auth_hijack`] the header block
/// is intentionally unterminated and the callback must write the final
/// `\r\n` after any headers of its own.
pub type HijackFn =
  Arc<dyn Fn(Request, ClientStream) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Produces the TLS server configuration used to terminate a decrypted
/// tunnel, given the CONNECT request and the negotiated destination host.
pub type TlsConfigFactory = Arc<
  dyn Fn(Request, String) -> Pin<Box<dyn Future<Output = Result<Arc<ServerConfig>>> + Send>>
    + Send
    + Sync,
>;

/// What to do with a CONNECT request, as decided by the CONNECT handler
/// chain.
#[derive(Clone)]
pub enum ConnectAction {
  /// Open a raw tunnel to the destination and splice bytes end-to-end.
  Accept,
  /// Refuse the tunnel. A response already placed on the context is sent
  /// to the client first; no error body is generated otherwise.
  Reject,
  /// Terminate the client's TLS with a minted certificate and run the
  /// decrypted requests through the normal handler pipeline. `tls` is the
  /// configuration source; `None` uses the proxy's certificate authority.
  Mitm {
    /// TLS server configuration source for the client-facing handshake.
    tls: Option<TlsConfigFactory>,
  },
  /// Assume the tunnel carries cleartext HTTP and run each request through
  /// the handler pipeline, forwarding over a plain TCP connection.
  HttpMitm,
  /// Reply `200 OK` and hand the raw client connection to the callback.
  Hijack {
    /// Takes ownership of the client connection.
    callback: HijackFn,
  },
  /// Reply `407 Proxy Authentication Required` (header block left open)
  /// and hand the raw client connection to the callback.
  ProxyAuthHijack {
    /// Takes ownership of the client connection.
    callback: HijackFn,
  },
}

impl ConnectAction {
  /// Tunnel the connection through untouched.
  pub fn accept() -> Self {
    ConnectAction::Accept
  }

  /// Refuse the tunnel.
  pub fn reject() -> Self {
    ConnectAction::Reject
  }

  /// Decrypt the tunnel with a certificate minted from the proxy's CA.
  pub fn mitm() -> Self {
    ConnectAction::Mitm { tls: None }
  }

  /// Decrypt the tunnel with a caller-supplied TLS configuration source.
  pub fn mitm_with(factory: TlsConfigFactory) -> Self {
    ConnectAction::Mitm {
      tls: Some(factory),
    }
  }

  /// Treat the tunnel as cleartext HTTP and intercept it.
  pub fn http_mitm() -> Self {
    ConnectAction::HttpMitm
  }

  /// Accept the tunnel, then hand the client connection to `callback`.
  pub fn hijack<F, Fut>(callback: F) -> Self
  where
    F: Fn(Request, ClientStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    ConnectAction::Hijack {
      callback: Arc::new(move |req, stream| Box::pin(callback(req, stream))),
    }
  }

  /// Answer `407` and hand the client connection to `callback`, which must
  /// finish the header block (write `\r\n` after its own headers).
  pub fn proxy_auth_hijack<F, Fut>(callback: F) -> Self
  where
    F: Fn(Request, ClientStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    ConnectAction::ProxyAuthHijack {
      callback: Arc::new(move |req, stream| Box::pin(callback(req, stream))),
    }
  }
}

impl std::fmt::Debug for ConnectAction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ConnectAction::Accept => f.write_str("Accept"),
      ConnectAction::Reject => f.write_str("Reject"),
      ConnectAction::Mitm { tls } => f
        .debug_struct("Mitm")
        .field("custom_tls", &tls.is_some())
        .finish(),
      ConnectAction::HttpMitm => f.write_str("HttpMitm"),
      ConnectAction::Hijack { .. } => f.write_str("Hijack"),
      ConnectAction::ProxyAuthHijack { .. } => f.write_str("ProxyAuthHijack"),
    }
  }
}
