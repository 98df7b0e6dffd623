//! Owned HTTP request and response carriers.
//!
//! Handlers receive these by value, may rewrite any part of them, and hand
//! them back to the engine. Bodies are fully buffered [`Bytes`]; a proxy that
//! lets handlers rewrite traffic cannot stream what it has promised to let
//! them inspect.

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};

/// An HTTP request flowing through the proxy.
///
/// Wraps an [`http::Request`] with the peer address of the client connection
/// it arrived on, which survives rewrites of the message itself.
#[derive(Debug)]
pub struct Request {
  inner: http::Request<Bytes>,
  remote_addr: Option<SocketAddr>,
}

impl Request {
  /// Wrap a plain `http::Request`.
  pub fn new(inner: http::Request<Bytes>) -> Self {
    Self {
      inner,
      remote_addr: None,
    }
  }

  /// The address of the client connection this request was read from.
  pub fn remote_addr(&self) -> Option<SocketAddr> {
    self.remote_addr
  }

  /// Record the client peer address.
  pub fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
    self.remote_addr = addr;
  }

  /// Destination host of the request, without port.
  ///
  /// Prefers the request URI authority, falling back to the `Host` header
  /// for origin-form requests.
  pub fn host(&self) -> Option<&str> {
    self.inner.uri().host().or_else(|| {
      self
        .inner
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))
    })
  }

  /// Consume the wrapper, returning the inner `http::Request`.
  pub fn into_inner(self) -> http::Request<Bytes> {
    self.inner
  }
}

impl From<http::Request<Bytes>> for Request {
  fn from(inner: http::Request<Bytes>) -> Self {
    Self::new(inner)
  }
}

impl Deref for Request {
  type Target = http::Request<Bytes>;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Request {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl Clone for Request {
  fn clone(&self) -> Self {
    let mut builder = http::Request::builder()
      .method(self.inner.method().clone())
      .uri(self.inner.uri().clone())
      .version(self.inner.version());
    if let Some(headers) = builder.headers_mut() {
      headers.clone_from(self.inner.headers());
    }
    // Body bytes are reference counted, the clone is cheap.
    let inner = builder
      .body(self.inner.body().clone())
      .expect("cloning a valid request cannot fail");
    Self {
      inner,
      remote_addr: self.remote_addr,
    }
  }
}

/// An HTTP response flowing through the proxy.
#[derive(Debug)]
pub struct Response {
  inner: http::Response<Bytes>,
}

impl Response {
  /// Wrap a plain `http::Response`.
  pub fn new(inner: http::Response<Bytes>) -> Self {
    Self { inner }
  }

  /// Build a canned `text/plain` response, handy for blocking pages and
  /// handler-synthesized replies.
  pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Self {
    Self::canned(status, "text/plain; charset=utf-8", body)
  }

  /// Build a canned `text/html` response.
  pub fn html(status: StatusCode, body: impl Into<Bytes>) -> Self {
    Self::canned(status, "text/html; charset=utf-8", body)
  }

  fn canned(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
    let mut inner = http::Response::new(body.into());
    *inner.status_mut() = status;
    inner.headers_mut().insert(
      CONTENT_TYPE,
      HeaderValue::from_str(content_type).expect("static content type is a valid header value"),
    );
    Self { inner }
  }

  /// Status code of the response.
  pub fn status_code(&self) -> StatusCode {
    self.inner.status()
  }

  /// Consume the wrapper, returning the inner `http::Response`.
  pub fn into_inner(self) -> http::Response<Bytes> {
    self.inner
  }
}

impl From<http::Response<Bytes>> for Response {
  fn from(inner: http::Response<Bytes>) -> Self {
    Self::new(inner)
  }
}

impl Deref for Response {
  type Target = http::Response<Bytes>;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Response {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl Clone for Response {
  fn clone(&self) -> Self {
    let mut builder = http::Response::builder()
      .status(self.inner.status())
      .version(self.inner.version());
    if let Some(headers) = builder.headers_mut() {
      headers.clone_from(self.inner.headers());
    }
    let inner = builder
      .body(self.inner.body().clone())
      .expect("cloning a valid response cannot fail");
    Self { inner }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn host_prefers_uri_authority() {
    let req: Request = http::Request::builder()
      .uri("http://example.com:8080/index")
      .header("Host", "other.example")
      .body(Bytes::new())
      .unwrap()
      .into();
    assert_eq!(req.host(), Some("example.com"));
  }

  #[test]
  fn host_falls_back_to_host_header() {
    let req: Request = http::Request::builder()
      .uri("/index")
      .header("Host", "fallback.example:8443")
      .body(Bytes::new())
      .unwrap()
      .into();
    assert_eq!(req.host(), Some("fallback.example"));
  }

  #[test]
  fn canned_text_response() {
    let resp = Response::text(StatusCode::FORBIDDEN, "Don't waste your time!");
    assert_eq!(resp.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(
      resp.headers().get(CONTENT_TYPE).unwrap(),
      "text/plain; charset=utf-8"
    );
    assert_eq!(resp.body().as_ref(), b"Don't waste your time!");
  }

  #[test]
  fn clone_preserves_remote_addr() {
    let mut req: Request = http::Request::builder()
      .uri("http://example.com/")
      .body(Bytes::new())
      .unwrap()
      .into();
    req.set_remote_addr(Some("127.0.0.1:4242".parse().unwrap()));
    let copy = req.clone();
    assert_eq!(copy.remote_addr(), req.remote_addr());
    assert_eq!(copy.uri(), req.uri());
  }
}
