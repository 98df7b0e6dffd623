//! The proxy server: accept loop, handler registry, and the plain-HTTP
//! path.

use crate::action::{ClientStream, ConnectAction};
use crate::ca::{CertificateAuthority, LeafIssuer};
use crate::connect;
use crate::ctx::Context;
use crate::error::Result;
use crate::handler::{
  ConnectHandler, FnConnectHandler, FnRequestHandler, FnResponseHandler, RequestHandler,
  ResponseHandler,
};
use crate::http1;
use crate::message::{Request, Response};
use crate::predicate::Predicate;
use crate::stream::MaybeTlsStream;
use crate::transport::{RoundTrip, Transport};
use crate::upstream::{self, ConnectDial};
use http::header::{CONNECTION, CONTENT_LENGTH};
use http::{HeaderValue, Method, StatusCode, Version};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Answers requests that reached the proxy without an absolute request
/// URI, i.e. requests not meant to be proxied at all.
pub type NonProxyHandler =
  Arc<dyn Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync>;

struct Guarded<H> {
  predicates: Vec<Predicate>,
  handler: H,
}

/// An intercepting forward proxy.
///
/// Register handlers with [`Proxy::on_request`] / [`Proxy::on_response`]
/// before serving, then drive it with [`Proxy::serve`] (or
/// [`Proxy::serve_listener`]) behind an `Arc`. Registration takes
/// `&mut self`, so the compiler enforces the register-before-serve
/// contract: once the proxy is shared it is read-only.
pub struct Proxy {
  session: AtomicU64,
  transport: Arc<Transport>,
  connect_dial: Option<ConnectDial>,
  issuer: Option<Arc<LeafIssuer>>,
  non_proxy: NonProxyHandler,
  request_handlers: Vec<Guarded<Arc<dyn RequestHandler>>>,
  response_handlers: Vec<Guarded<Arc<dyn ResponseHandler>>>,
  connect_handlers: Vec<Guarded<Arc<dyn ConnectHandler>>>,
}

impl Proxy {
  /// A proxy with the default transport, no CA, and CONNECT routing taken
  /// from `HTTPS_PROXY`/`https_proxy` when set.
  pub fn new() -> Self {
    ProxyBuilder::default().build()
  }

  /// Start building a proxy.
  pub fn builder() -> ProxyBuilder {
    ProxyBuilder::default()
  }

  /// Register handlers guarded by `predicates` (all must match; an empty
  /// list always matches).
  pub fn on_request<I>(&mut self, predicates: I) -> RequestGuards<'_>
  where
    I: IntoIterator<Item = Predicate>,
  {
    RequestGuards {
      proxy: self,
      predicates: predicates.into_iter().collect(),
    }
  }

  /// Register response handlers guarded by `predicates`. Request-shaped
  /// predicates work here too; response-shaped ones (content type) only
  /// match once a response exists.
  pub fn on_response<I>(&mut self, predicates: I) -> ResponseGuards<'_>
  where
    I: IntoIterator<Item = Predicate>,
  {
    ResponseGuards {
      proxy: self,
      predicates: predicates.into_iter().collect(),
    }
  }

  /// The shared outbound transport.
  pub fn transport(&self) -> &Arc<Transport> {
    &self.transport
  }

  /// The leaf issuer backing default TLS interception, if a CA was
  /// configured.
  pub fn leaf_issuer(&self) -> Option<&Arc<LeafIssuer>> {
    self.issuer.as_ref()
  }

  pub(crate) fn next_session(&self) -> u64 {
    self.session.fetch_add(1, Ordering::Relaxed) + 1
  }

  pub(crate) fn shared_round_tripper(&self) -> Arc<dyn RoundTrip> {
    self.transport.clone()
  }

  /// Dial a CONNECT destination: through the configured CONNECT dial when
  /// present, directly via the transport otherwise.
  pub(crate) async fn connect_dial(&self, addr: &str) -> Result<MaybeTlsStream> {
    match &self.connect_dial {
      Some(dial) => dial(addr.to_string()).await,
      None => Ok(self.transport.dial(addr).await?.into()),
    }
  }

  /// Bind `addr` and serve until the task is dropped.
  pub async fn serve(self: Arc<Self>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    self.serve_listener(listener).await
  }

  /// Serve connections from an already-bound listener.
  pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
      tracing::info!(%addr, "proxy listening");
    }
    loop {
      match listener.accept().await {
        Ok((stream, peer)) => {
          let proxy = self.clone();
          tokio::spawn(async move {
            if let Err(e) = handle_connection(proxy, stream, peer).await {
              tracing::error!(%peer, error = %e, "connection ended with error");
            }
          });
        }
        Err(e) => {
          tracing::error!(error = %e, "failed to accept connection");
        }
      }
    }
  }

  /// Run the request-handler chain. The first canned response stops the
  /// chain and is returned alongside the (possibly rewritten) request.
  pub(crate) async fn filter_request(
    &self,
    mut req: Request,
    ctx: &mut Context,
  ) -> (Request, Option<Response>) {
    for guarded in &self.request_handlers {
      if !guarded.predicates.iter().all(|p| p.eval(&req, None)) {
        continue;
      }
      let (next, resp) = guarded.handler.handle(req, ctx).await;
      req = next;
      if resp.is_some() {
        return (req, resp);
      }
    }
    (req, None)
  }

  /// Run the response-handler chain. `resp` is `None` when the round trip
  /// failed; handlers may synthesize a substitute.
  pub(crate) async fn filter_response(
    &self,
    mut req: Request,
    mut resp: Option<Response>,
    ctx: &mut Context,
  ) -> (Request, Option<Response>) {
    for guarded in &self.response_handlers {
      if !guarded
        .predicates
        .iter()
        .all(|p| p.eval(&req, resp.as_ref()))
      {
        continue;
      }
      let (next_req, next_resp) = guarded.handler.handle(req, resp, ctx).await;
      req = next_req;
      resp = next_resp;
    }
    (req, resp)
  }

  /// Run the CONNECT-handler chain. The first handler returning an action
  /// wins, together with the host it returned; handlers that decline leave
  /// the host untouched. Falls back to accepting the original host.
  pub(crate) async fn run_connect_handlers(
    &self,
    mut req: Request,
    host: String,
    ctx: &mut Context,
  ) -> (Request, ConnectAction, String) {
    for (i, guarded) in self.connect_handlers.iter().enumerate() {
      if !guarded.predicates.iter().all(|p| p.eval(&req, None)) {
        continue;
      }
      let (next, action, next_host) = guarded
        .handler
        .handle_connect(req, host.clone(), ctx)
        .await;
      req = next;
      if let Some(action) = action {
        tracing::debug!(handler = i, host = %next_host, ?action, "connect handler result");
        return (req, action, next_host);
      }
    }
    (req, ConnectAction::accept(), host)
  }

  pub(crate) async fn non_proxy_response(&self, req: Request) -> Response {
    (self.non_proxy)(req).await
  }
}

impl Default for Proxy {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for Proxy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Proxy")
      .field("request_handlers", &self.request_handlers.len())
      .field("response_handlers", &self.response_handlers.len())
      .field("connect_handlers", &self.connect_handlers.len())
      .field("has_connect_dial", &self.connect_dial.is_some())
      .field("has_ca", &self.issuer.is_some())
      .finish()
  }
}

/// Builds a [`Proxy`].
#[derive(Default)]
pub struct ProxyBuilder {
  transport: Option<Arc<Transport>>,
  connect_dial: Option<ConnectDial>,
  issuer: Option<Arc<LeafIssuer>>,
  non_proxy: Option<NonProxyHandler>,
}

impl ProxyBuilder {
  /// Use a specific outbound transport.
  pub fn transport(mut self, transport: Transport) -> Self {
    self.transport = Some(Arc::new(transport));
    self
  }

  /// Supply the certificate authority used to mint leaves for decrypted
  /// tunnels.
  pub fn ca(mut self, ca: CertificateAuthority) -> Self {
    self.issuer = Some(Arc::new(LeafIssuer::new(ca)));
    self
  }

  /// Supply a pre-built (possibly shared) leaf issuer.
  pub fn leaf_issuer(mut self, issuer: Arc<LeafIssuer>) -> Self {
    self.issuer = Some(issuer);
    self
  }

  /// Route CONNECT tunnels through this dial function instead of dialing
  /// destinations directly. Overrides environment discovery.
  pub fn connect_dial(mut self, dial: ConnectDial) -> Self {
    self.connect_dial = Some(dial);
    self
  }

  /// Answer non-proxy requests (relative request URIs) with this handler
  /// instead of the built-in 500.
  pub fn non_proxy_handler<F, Fut>(mut self, handler: F) -> Self
  where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
  {
    self.non_proxy = Some(Arc::new(move |req| Box::pin(handler(req))));
    self
  }

  /// Build the proxy. CONNECT routing falls back to the
  /// `HTTPS_PROXY`/`https_proxy` environment when no dial function was
  /// given.
  pub fn build(self) -> Proxy {
    let transport = self.transport.unwrap_or_default();
    let connect_dial = self
      .connect_dial
      .or_else(|| upstream::dial_from_env(transport.tls_config()));
    Proxy {
      session: AtomicU64::new(0),
      transport,
      connect_dial,
      issuer: self.issuer,
      non_proxy: self.non_proxy.unwrap_or_else(|| {
        Arc::new(|_req| {
          Box::pin(async {
            Response::text(
              StatusCode::INTERNAL_SERVER_ERROR,
              "This is a proxy server. Does not respond to non-proxy requests.\n",
            )
          })
        })
      }),
      request_handlers: Vec::new(),
      response_handlers: Vec::new(),
      connect_handlers: Vec::new(),
    }
  }
}

/// Fluent registration point returned by [`Proxy::on_request`].
pub struct RequestGuards<'a> {
  proxy: &'a mut Proxy,
  predicates: Vec<Predicate>,
}

impl RequestGuards<'_> {
  /// Register a request handler behind the aggregated predicates.
  pub fn handle<H>(self, handler: H)
  where
    H: RequestHandler + 'static,
  {
    self.proxy.request_handlers.push(Guarded {
      predicates: self.predicates,
      handler: Arc::new(handler),
    });
  }

  /// Register a plain function as a request handler.
  pub fn handle_fn<F>(self, f: F)
  where
    F: Fn(Request, &mut Context) -> (Request, Option<Response>) + Send + Sync + 'static,
  {
    self.handle(FnRequestHandler(f));
  }

  /// Register a CONNECT handler behind the aggregated predicates.
  ///
  /// CONNECT handlers run in registration order and the first returned
  /// action wins, so when guards overlap, the earlier registration
  /// decides.
  pub fn handle_connect<H>(self, handler: H)
  where
    H: ConnectHandler + 'static,
  {
    self.proxy.connect_handlers.push(Guarded {
      predicates: self.predicates,
      handler: Arc::new(handler),
    });
  }

  /// Register a plain function as a CONNECT handler.
  pub fn handle_connect_fn<F>(self, f: F)
  where
    F: Fn(Request, String, &mut Context) -> (Request, Option<ConnectAction>, String)
      + Send
      + Sync
      + 'static,
  {
    self.handle_connect(FnConnectHandler(f));
  }

  /// Register a CONNECT handler that hijacks matching tunnels: the proxy
  /// answers `200 OK` and hands the raw client connection to `f`.
  pub fn hijack_connect<F, Fut>(self, f: F)
  where
    F: Fn(Request, ClientStream) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self.handle_connect_fn(move |req, host, _ctx| {
      (req, Some(ConnectAction::hijack(f.clone())), host)
    });
  }
}

/// Fluent registration point returned by [`Proxy::on_response`].
pub struct ResponseGuards<'a> {
  proxy: &'a mut Proxy,
  predicates: Vec<Predicate>,
}

impl ResponseGuards<'_> {
  /// Register a response handler behind the aggregated predicates.
  pub fn handle<H>(self, handler: H)
  where
    H: ResponseHandler + 'static,
  {
    self.proxy.response_handlers.push(Guarded {
      predicates: self.predicates,
      handler: Arc::new(handler),
    });
  }

  /// Register a plain function as a response handler.
  pub fn handle_fn<F>(self, f: F)
  where
    F: Fn(Request, Option<Response>, &mut Context) -> (Request, Option<Response>)
      + Send
      + Sync
      + 'static,
  {
    self.handle(FnResponseHandler(f));
  }
}

/// Headers a proxy must not forward: RFC 2616 single-hop headers, plus
/// `Accept-Encoding` so origins answer with bodies handlers can read.
pub(crate) fn remove_proxy_headers(req: &mut Request) {
  let headers = req.headers_mut();
  headers.remove(http::header::ACCEPT_ENCODING);
  headers.remove("Proxy-Connection");
  headers.remove(http::header::PROXY_AUTHENTICATE);
  headers.remove(http::header::PROXY_AUTHORIZATION);
  headers.remove(CONNECTION);
}

/// Whether the client connection must close after answering `req`.
fn wants_close(req: &Request) -> bool {
  let connection = req
    .headers()
    .get(CONNECTION)
    .and_then(|v| v.to_str().ok())
    .unwrap_or("");
  if req.version() == Version::HTTP_10 {
    !connection.eq_ignore_ascii_case("keep-alive")
  } else {
    connection.eq_ignore_ascii_case("close")
  }
}

async fn handle_connection(proxy: Arc<Proxy>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
  let mut client: ClientStream = BufReader::new(stream);
  loop {
    let mut req = match http1::read_request(&mut client).await? {
      Some(req) => req,
      None => return Ok(()),
    };
    req.set_remote_addr(Some(peer));

    if req.method() == Method::CONNECT {
      connect::dispatch(proxy, req, client).await;
      return Ok(());
    }

    let close = handle_plain(&proxy, req, &mut client).await?;
    if close {
      return Ok(());
    }
  }
}

/// The plain-HTTP path: request chain, round trip, response chain, stream
/// back. Returns whether the connection must close afterwards.
async fn handle_plain(
  proxy: &Arc<Proxy>,
  req: Request,
  client: &mut ClientStream,
) -> Result<bool> {
  let close = wants_close(&req);
  let session = proxy.next_session();
  let mut ctx = Context::new(session, proxy.shared_round_tripper());

  tracing::debug!(session, method = %req.method(), uri = %req.uri(), "request");

  // A relative request URI means the client is talking *to* the proxy,
  // not through it.
  if req.uri().scheme().is_none() {
    let resp = proxy.non_proxy_response(req).await;
    http1::write_response(client, &resp).await?;
    return Ok(close);
  }

  ctx.set_request(req.clone());
  let (req, canned) = proxy.filter_request(req, &mut ctx).await;
  ctx.set_request(req.clone());

  let mut req = req;
  let mut resp = canned;
  if resp.is_none() {
    let mut outbound = req.clone();
    remove_proxy_headers(&mut outbound);
    tracing::debug!(session, uri = %outbound.uri(), "sending request");
    match ctx.round_tripper().round_trip(&outbound).await {
      Ok(got) => {
        tracing::debug!(session, status = %got.status_code(), "response");
        resp = Some(got);
      }
      Err(e) => {
        tracing::error!(session, error = %e, "round trip failed");
        ctx.set_error(e);
      }
    }
    if resp.is_none() {
      // Give response handlers a chance to synthesize a substitute.
      let (next, synthesized) = proxy.filter_response(req, None, &mut ctx).await;
      req = next;
      match synthesized {
        Some(s) => resp = Some(s),
        None => {
          let text = ctx
            .error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "round trip failed".to_string());
          let error_resp =
            Response::text(StatusCode::INTERNAL_SERVER_ERROR, format!("{text}\n"));
          http1::write_response(client, &error_resp).await?;
          return Ok(close);
        }
      }
    }
  }

  let resp = resp.expect("response populated on every path above");
  let original_body = resp.body().clone();
  ctx.set_response(resp.clone());
  let (_req, resp) = proxy.filter_response(req, Some(resp), &mut ctx).await;
  let Some(mut resp) = resp else {
    tracing::error!(session, "response handler dropped the response");
    let error_resp = Response::text(
      StatusCode::INTERNAL_SERVER_ERROR,
      "response dropped by handler\n",
    );
    http1::write_response(client, &error_resp).await?;
    return Ok(close);
  };

  // A replaced body invalidates the declared length; the writer emits the
  // real count.
  if resp.body().as_ptr() != original_body.as_ptr() || resp.body().len() != original_body.len() {
    resp.headers_mut().remove(CONTENT_LENGTH);
  }
  resp.headers_mut().remove(CONNECTION);
  resp.headers_mut().remove("Keep-Alive");
  if close {
    resp
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static("close"));
  }

  http1::write_response(client, &resp).await?;
  client.flush().await?;
  Ok(close)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::predicate::dst_host_is;
  use bytes::Bytes;

  fn request(uri: &str) -> Request {
    http::Request::builder()
      .uri(uri)
      .body(Bytes::new())
      .unwrap()
      .into()
  }

  fn ctx(proxy: &Proxy) -> Context {
    Context::new(proxy.next_session(), proxy.shared_round_tripper())
  }

  #[test]
  fn sessions_are_distinct_and_increasing() {
    let proxy = Proxy::builder().build();
    let a = proxy.next_session();
    let b = proxy.next_session();
    let c = proxy.next_session();
    assert!(a < b && b < c);
  }

  #[test]
  fn remove_proxy_headers_strips_single_hop_set() {
    let mut req: Request = http::Request::builder()
      .uri("http://example.invalid/")
      .header("Accept-Encoding", "gzip")
      .header("Proxy-Connection", "keep-alive")
      .header("Proxy-Authenticate", "Basic")
      .header("Proxy-Authorization", "Basic Zm9v")
      .header("Connection", "keep-alive")
      .header("User-Agent", "test")
      .body(Bytes::new())
      .unwrap()
      .into();
    remove_proxy_headers(&mut req);
    for name in [
      "Accept-Encoding",
      "Proxy-Connection",
      "Proxy-Authenticate",
      "Proxy-Authorization",
      "Connection",
    ] {
      assert!(req.headers().get(name).is_none(), "{name} survived");
    }
    assert!(req.headers().get("User-Agent").is_some());
  }

  #[tokio::test]
  async fn handlers_run_in_registration_order_and_chain() {
    let mut proxy = Proxy::builder().build();
    proxy.on_request([]).handle_fn(|mut req, _ctx| {
      req
        .headers_mut()
        .insert("X-First", HeaderValue::from_static("1"));
      (req, None)
    });
    proxy.on_request([]).handle_fn(|req, _ctx| {
      // The second handler must observe the first handler's output.
      assert!(req.headers().get("X-First").is_some());
      (req, None)
    });
    let mut ctx = ctx(&proxy);
    let (req, resp) = proxy
      .filter_request(request("http://example.com/"), &mut ctx)
      .await;
    assert!(resp.is_none());
    assert!(req.headers().get("X-First").is_some());
  }

  #[tokio::test]
  async fn canned_response_stops_the_request_chain() {
    let mut proxy = Proxy::builder().build();
    proxy.on_request([]).handle_fn(|req, _ctx| {
      let resp = Response::text(StatusCode::FORBIDDEN, "blocked");
      (req, Some(resp))
    });
    proxy.on_request([]).handle_fn(|_req, _ctx| {
      panic!("second handler must not run after a canned response");
    });
    let mut ctx = ctx(&proxy);
    let (_req, resp) = proxy
      .filter_request(request("http://example.com/"), &mut ctx)
      .await;
    assert_eq!(resp.unwrap().status_code(), StatusCode::FORBIDDEN);
  }

  #[tokio::test]
  async fn false_predicate_skips_handler_and_passes_through() {
    let mut proxy = Proxy::builder().build();
    proxy
      .on_request([dst_host_is("other.example")])
      .handle_fn(|_req, _ctx| panic!("guarded handler must not run"));
    let mut ctx = ctx(&proxy);
    let before = request("http://example.com/");
    let before_uri = before.uri().clone();
    let (after, resp) = proxy.filter_request(before, &mut ctx).await;
    assert!(resp.is_none());
    assert_eq!(after.uri(), &before_uri);
  }

  #[tokio::test]
  async fn connect_chain_first_result_wins() {
    use crate::handler::{AlwaysMitm, AlwaysReject};
    let mut proxy = Proxy::builder().build();
    proxy.on_request([]).handle_connect(AlwaysMitm);
    proxy
      .on_request([dst_host_is("example.com")])
      .handle_connect(AlwaysReject);

    let req: Request = http::Request::builder()
      .method(Method::CONNECT)
      .uri("example.com:443")
      .body(Bytes::new())
      .unwrap()
      .into();
    let mut ctx = ctx(&proxy);
    let (_req, action, host) = proxy
      .run_connect_handlers(req, "example.com:443".into(), &mut ctx)
      .await;
    // Registration order decides: the unconditional Mitm wins even though
    // the reject handler also matches. Swap the registrations to reject.
    assert!(matches!(action, ConnectAction::Mitm { .. }));
    assert_eq!(host, "example.com:443");
  }

  #[tokio::test]
  async fn connect_chain_defaults_to_accept() {
    let proxy = Proxy::builder().build();
    let req: Request = http::Request::builder()
      .method(Method::CONNECT)
      .uri("example.com:443")
      .body(Bytes::new())
      .unwrap()
      .into();
    let mut ctx = ctx(&proxy);
    let (_req, action, host) = proxy
      .run_connect_handlers(req, "example.com:443".into(), &mut ctx)
      .await;
    assert!(matches!(action, ConnectAction::Accept));
    assert_eq!(host, "example.com:443");
  }

  #[tokio::test]
  async fn declined_connect_keeps_original_host() {
    let mut proxy = Proxy::builder().build();
    proxy.on_request([]).handle_connect_fn(|req, _host, _ctx| {
      // Decline while suggesting a different host; the suggestion must be
      // ignored because no action came with it.
      (req, None, "hijacked.example:443".to_string())
    });
    let req: Request = http::Request::builder()
      .method(Method::CONNECT)
      .uri("example.com:443")
      .body(Bytes::new())
      .unwrap()
      .into();
    let mut ctx = ctx(&proxy);
    let (_req, _action, host) = proxy
      .run_connect_handlers(req, "example.com:443".into(), &mut ctx)
      .await;
    assert_eq!(host, "example.com:443");
  }

  #[test]
  fn wants_close_follows_version_and_header() {
    let mut req = request("http://example.com/");
    assert!(!wants_close(&req));
    req
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static("close"));
    assert!(wants_close(&req));

    let mut old: Request = http::Request::builder()
      .uri("http://example.com/")
      .version(Version::HTTP_10)
      .body(Bytes::new())
      .unwrap()
      .into();
    assert!(wants_close(&old));
    old
      .headers_mut()
      .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    assert!(!wants_close(&old));
  }
}
