//! Crate error type

use std::io;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `waylay::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying traffic.
#[derive(ThisError, Debug)]
pub enum Error {
  /// I/O error on a client or origin stream
  #[error(transparent)]
  Io(#[from] io::Error),
  /// TLS error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error building or validating an HTTP message
  #[error(transparent)]
  Http(http::Error),
  /// Certificate generation or loading failed
  #[error("certificate error: {0}")]
  Certificate(String),
  /// The client sent a request the proxy cannot parse
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// Dialing the destination or upstream failed
  #[error("connect error: {0}")]
  Connect(String),
  /// An upstream proxy answered a CONNECT with a non-200 status
  #[error("proxy refused connection{0}")]
  UpstreamRefused(String),
  /// Anything else
  #[error("{0}")]
  Other(String),
}

impl Error {
  pub(crate) fn certificate(msg: impl Into<String>) -> Self {
    Error::Certificate(msg.into())
  }

  pub(crate) fn invalid_request(msg: impl Into<String>) -> Self {
    Error::InvalidRequest(msg.into())
  }

  pub(crate) fn connect(msg: impl Into<String>) -> Self {
    Error::Connect(msg.into())
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::method::InvalidMethod> for Error {
  fn from(value: http::method::InvalidMethod) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::status::InvalidStatusCode> for Error {
  fn from(value: http::status::InvalidStatusCode) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(kind, msg))
}
