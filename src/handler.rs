//! Handler traits and adapters.
//!
//! Handlers tamper with traffic. A request handler may rewrite the request
//! or answer it outright with a canned response, which skips the round
//! trip. A response handler may rewrite (or synthesize) the response. A
//! CONNECT handler decides the fate of a tunnel. Handlers are stateless
//! from the engine's point of view; anything they need to remember lives in
//! their captures or in the [`Context`] user slot.

use crate::action::ConnectAction;
use crate::ctx::Context;
use crate::message::{Request, Response};
use async_trait::async_trait;

/// Tampers with requests on their way to the destination.
///
/// Returning `(req, None)` sends `req` onward; returning `(req, Some(resp))`
/// skips the round trip and answers the client with `resp`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
  /// Inspect or rewrite one request.
  async fn handle(&self, req: Request, ctx: &mut Context) -> (Request, Option<Response>);
}

/// Tampers with responses on their way back to the client.
///
/// `resp` is `None` when the round trip failed; the error is then available
/// from [`Context::error`] and the handler may synthesize a substitute.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
  /// Inspect or rewrite one response.
  async fn handle(
    &self,
    req: Request,
    resp: Option<Response>,
    ctx: &mut Context,
  ) -> (Request, Option<Response>);
}

/// Decides what to do with a CONNECT request.
///
/// Returning a `None` action means "not mine": the chain continues with the
/// next handler, and the returned host is carried along. The first handler
/// returning `Some(action)` wins — evaluation is in registration order and
/// stops there, so order of registration matters when guards overlap.
#[async_trait]
pub trait ConnectHandler: Send + Sync {
  /// Inspect one CONNECT request and optionally claim it.
  async fn handle_connect(
    &self,
    req: Request,
    host: String,
    ctx: &mut Context,
  ) -> (Request, Option<ConnectAction>, String);
}

pub(crate) struct FnRequestHandler<F>(pub(crate) F);

#[async_trait]
impl<F> RequestHandler for FnRequestHandler<F>
where
  F: Fn(Request, &mut Context) -> (Request, Option<Response>) + Send + Sync,
{
  async fn handle(&self, req: Request, ctx: &mut Context) -> (Request, Option<Response>) {
    (self.0)(req, ctx)
  }
}

pub(crate) struct FnResponseHandler<F>(pub(crate) F);

#[async_trait]
impl<F> ResponseHandler for FnResponseHandler<F>
where
  F: Fn(Request, Option<Response>, &mut Context) -> (Request, Option<Response>) + Send + Sync,
{
  async fn handle(
    &self,
    req: Request,
    resp: Option<Response>,
    ctx: &mut Context,
  ) -> (Request, Option<Response>) {
    (self.0)(req, resp, ctx)
  }
}

pub(crate) struct FnConnectHandler<F>(pub(crate) F);

#[async_trait]
impl<F> ConnectHandler for FnConnectHandler<F>
where
  F: Fn(Request, String, &mut Context) -> (Request, Option<ConnectAction>, String) + Send + Sync,
{
  async fn handle_connect(
    &self,
    req: Request,
    host: String,
    ctx: &mut Context,
  ) -> (Request, Option<ConnectAction>, String) {
    (self.0)(req, host, ctx)
  }
}

/// A CONNECT handler that decrypts every tunnel it sees.
///
/// ```
/// # use waylay::{Proxy, AlwaysMitm};
/// # let mut proxy = Proxy::builder().build();
/// proxy.on_request([]).handle_connect(AlwaysMitm);
/// ```
pub struct AlwaysMitm;

#[async_trait]
impl ConnectHandler for AlwaysMitm {
  async fn handle_connect(
    &self,
    req: Request,
    host: String,
    _ctx: &mut Context,
  ) -> (Request, Option<ConnectAction>, String) {
    (req, Some(ConnectAction::mitm()), host)
  }
}

/// A CONNECT handler that refuses every tunnel it sees, e.g. to disallow
/// CONNECT to anything but port 443 when guarded with a negated host
/// pattern.
pub struct AlwaysReject;

#[async_trait]
impl ConnectHandler for AlwaysReject {
  async fn handle_connect(
    &self,
    req: Request,
    host: String,
    _ctx: &mut Context,
  ) -> (Request, Option<ConnectAction>, String) {
    (req, Some(ConnectAction::reject()), host)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::Transport;
  use bytes::Bytes;
  use std::sync::Arc;

  fn ctx() -> Context {
    Context::new(1, Arc::new(Transport::new()))
  }

  fn req() -> Request {
    http::Request::builder()
      .uri("example.com:443")
      .method(http::Method::CONNECT)
      .body(Bytes::new())
      .unwrap()
      .into()
  }

  #[tokio::test]
  async fn always_mitm_claims_with_default_tls() {
    let (_req, action, host) = AlwaysMitm
      .handle_connect(req(), "example.com:443".into(), &mut ctx())
      .await;
    assert!(matches!(action, Some(ConnectAction::Mitm { tls: None })));
    assert_eq!(host, "example.com:443");
  }

  #[tokio::test]
  async fn always_reject_claims() {
    let (_req, action, _host) = AlwaysReject
      .handle_connect(req(), "example.com:443".into(), &mut ctx())
      .await;
    assert!(matches!(action, Some(ConnectAction::Reject)));
  }
}
