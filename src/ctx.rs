//! Per-request context.

use crate::error::Error;
use crate::message::{Request, Response};
use crate::transport::RoundTrip;
use std::any::Any;
use std::sync::Arc;

/// State carried alongside one request from the moment the proxy admits it
/// until its response has been written (or its tunnel closed).
///
/// Handlers receive `&mut Context` next to the message they are rewriting.
/// The engine keeps the `request`/`response` slots in sync between pipeline
/// phases; the user-data slot survives from request handling through
/// response handling.
pub struct Context {
  session: u64,
  request: Option<Request>,
  response: Option<Response>,
  round_tripper: Option<Arc<dyn RoundTrip>>,
  transport: Arc<dyn RoundTrip>,
  error: Option<Error>,
  user_data: Option<Box<dyn Any + Send + Sync>>,
  connect: Option<Arc<Request>>,
}

impl Context {
  pub(crate) fn new(session: u64, transport: Arc<dyn RoundTrip>) -> Self {
    Self {
      session,
      request: None,
      response: None,
      round_tripper: None,
      transport,
      error: None,
      user_data: None,
      connect: None,
    }
  }

  /// Session id of this exchange: a monotonically increasing integer unique
  /// per proxy instance, tying a request to its response in logs.
  pub fn session(&self) -> u64 {
    self.session
  }

  /// The request currently traveling through the pipeline.
  ///
  /// # Panics
  ///
  /// Panics when no request is attached. The engine attaches one before any
  /// handler runs, so hitting this outside a handler is a bug in the
  /// embedding code.
  pub fn request(&self) -> &Request {
    self
      .request
      .as_ref()
      .expect("context has no request attached")
  }

  /// Whether a request is attached.
  pub fn has_request(&self) -> bool {
    self.request.is_some()
  }

  /// Attach or replace the current request.
  pub fn set_request(&mut self, request: Request) {
    self.request = Some(request);
  }

  /// The response produced for the current request.
  ///
  /// # Panics
  ///
  /// Panics when no response is attached; it only exists once the round trip
  /// or a canned-response handler has produced one.
  pub fn response(&self) -> &Response {
    self
      .response
      .as_ref()
      .expect("context has no response attached")
  }

  /// Whether a response has been produced yet.
  pub fn has_response(&self) -> bool {
    self.response.is_some()
  }

  /// Attach or replace the current response.
  pub fn set_response(&mut self, response: Response) {
    self.response = Some(response);
  }

  pub(crate) fn take_response(&mut self) -> Option<Response> {
    self.response.take()
  }

  /// The round-tripper used for the outbound exchange. Falls back to the
  /// proxy's shared transport when none was set for this request.
  pub fn round_tripper(&self) -> Arc<dyn RoundTrip> {
    self
      .round_tripper
      .clone()
      .unwrap_or_else(|| self.transport.clone())
  }

  /// Override the round-tripper for this request only.
  pub fn set_round_tripper(&mut self, rt: Arc<dyn RoundTrip>) {
    self.round_tripper = Some(rt);
  }

  /// The most recent error observed while producing a response. Absence is
  /// not an error.
  pub fn error(&self) -> Option<&Error> {
    self.error.as_ref()
  }

  /// Record the error observed while producing a response.
  pub fn set_error(&mut self, error: Error) {
    self.error = Some(error);
  }

  /// Stash arbitrary data to be picked up again in a later phase, typically
  /// set by a request handler and read by a response handler.
  pub fn set_user_data<T: Any + Send + Sync>(&mut self, data: T) {
    self.user_data = Some(Box::new(data));
  }

  /// Borrow previously stashed user data, if its type matches.
  pub fn user_data<T: Any + Send + Sync>(&self) -> Option<&T> {
    self.user_data.as_ref().and_then(|d| d.downcast_ref())
  }

  /// The CONNECT request that opened the tunnel this request arrived
  /// through. `None` outside decrypted or cleartext tunnels. Lets handlers
  /// recover the outer host and client address of the tunnel.
  pub fn connect_request(&self) -> Option<&Arc<Request>> {
    self.connect.as_ref()
  }

  pub(crate) fn set_connect_request(&mut self, request: Arc<Request>) {
    self.connect = Some(request);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::Transport;
  use bytes::Bytes;
  use http::StatusCode;

  fn ctx() -> Context {
    Context::new(7, Arc::new(Transport::new()))
  }

  #[test]
  fn session_and_defaults() {
    let ctx = ctx();
    assert_eq!(ctx.session(), 7);
    assert!(!ctx.has_request());
    assert!(!ctx.has_response());
    assert!(ctx.error().is_none());
    assert!(ctx.connect_request().is_none());
  }

  #[test]
  #[should_panic(expected = "no request")]
  fn missing_request_is_fatal() {
    let _ = ctx().request();
  }

  #[test]
  #[should_panic(expected = "no response")]
  fn missing_response_is_fatal() {
    let _ = ctx().response();
  }

  #[test]
  fn round_tripper_falls_back_to_transport() {
    let ctx = ctx();
    // No per-request override: the shared transport answers.
    let _rt = ctx.round_tripper();
  }

  #[test]
  fn user_data_survives_and_is_typed() {
    let mut ctx = ctx();
    ctx.set_user_data(String::from("tag"));
    assert_eq!(ctx.user_data::<String>().map(String::as_str), Some("tag"));
    assert!(ctx.user_data::<u32>().is_none());
  }

  #[test]
  fn request_slot_round_trips() {
    let mut ctx = ctx();
    let req: Request = http::Request::builder()
      .uri("http://example.com/")
      .body(Bytes::new())
      .unwrap()
      .into();
    ctx.set_request(req);
    assert_eq!(ctx.request().uri().host(), Some("example.com"));
    ctx.set_response(Response::text(StatusCode::OK, "ok"));
    assert_eq!(ctx.response().status_code(), StatusCode::OK);
  }
}
