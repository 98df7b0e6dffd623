#![deny(missing_docs)]

//! # waylay
//!
//! `waylay` is a programmable intercepting HTTP/HTTPS forward proxy: a
//! man-in-the-middle that sits between clients and origin servers, exposes
//! every request and response to user-supplied handlers, and can decrypt
//! TLS tunnels on the fly when the operator has installed a trusted
//! certificate authority.
//!
//! It is built for traffic inspection, rewriting, recording, access
//! control, and testing — not as a production edge proxy.
//!
//! ## A minimal intercepting proxy
//!
//! ```no_run
//! use std::sync::Arc;
//! use waylay::predicate::dst_host_is;
//! use waylay::{AlwaysMitm, CertificateAuthority, Proxy, Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> waylay::Result<()> {
//!   let ca = CertificateAuthority::load_or_generate(".waylay-ca").await?;
//!   let mut proxy = Proxy::builder().ca(ca).build();
//!
//!   // Decrypt every CONNECT tunnel...
//!   proxy.on_request([]).handle_connect(AlwaysMitm);
//!
//!   // ...and block one site, inside and outside tunnels alike.
//!   proxy
//!     .on_request([dst_host_is("www.reddit.com")])
//!     .handle_fn(|req, _ctx| {
//!       let resp = Response::text(StatusCode::FORBIDDEN, "Don't waste your time!");
//!       (req, Some(resp))
//!     });
//!
//!   Arc::new(proxy).serve("127.0.0.1:8080").await
//! }
//! ```
//!
//! ## How a connection flows
//!
//! Plain requests (absolute request URI) pass through the request-handler
//! chain, the round-tripper, and the response-handler chain before being
//! streamed back. A `CONNECT` consults the CONNECT-handler chain, which
//! yields a [`ConnectAction`]: tunnel the bytes through untouched, reject,
//! hand the socket to a hijack callback, intercept cleartext HTTP, or
//! terminate the client's TLS with a certificate minted from the
//! configured CA and re-enter the normal pipeline for every decrypted
//! request.
//!
//! Handlers within a chain run in registration order, each seeing the
//! previous one's output; CONNECT handlers stop at the first one that
//! returns an action, so registration order decides when guards overlap.
//!
//! ## TLS caveats
//!
//! The outbound transport skips origin-certificate verification by
//! default — deliberate for an interception tool, and overridable via
//! [`Transport::with_root_store`]. CONNECT tunnels are routed through an
//! upstream proxy when `HTTPS_PROXY` (or `https_proxy`) is set.

mod action;
mod ca;
mod connect;
mod ctx;
mod error;
mod handler;
mod http1;
mod message;
mod mitm;
pub mod predicate;
mod proxy;
mod stream;
mod transport;
mod tunnel;
pub mod upstream;

pub use action::{ClientStream, ConnectAction, HijackFn, TlsConfigFactory};
pub use ca::{CertificateAuthority, LeafIssuer};
pub use ctx::Context;
pub use error::{Error, Result};
pub use handler::{AlwaysMitm, AlwaysReject, ConnectHandler, RequestHandler, ResponseHandler};
pub use http::header;
pub use http::uri;
pub use http::{Method, StatusCode, Version};
pub use message::{Request, Response};
pub use predicate::Predicate;
pub use proxy::{NonProxyHandler, Proxy, ProxyBuilder, RequestGuards, ResponseGuards};
pub use stream::MaybeTlsStream;
pub use transport::{RoundTrip, Transport};
pub use upstream::ConnectDial;
