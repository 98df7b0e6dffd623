//! The decrypting tunnel: terminate client TLS with a minted certificate
//! and feed the inner requests through the normal handler pipeline.

use crate::action::{ClientStream, TlsConfigFactory};
use crate::ctx::Context;
use crate::http1;
use crate::message::Request;
use crate::proxy::{remove_proxy_headers, Proxy};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_rustls::TlsAcceptor;

/// Serve one decrypted tunnel until the TLS stream reaches EOF or errors.
///
/// `connect_req` is the CONNECT that opened the tunnel; every inner request
/// context carries it so handlers can recover the outer host, the client
/// address, and tunnel-scoped user data.
pub(crate) async fn serve(
  proxy: Arc<Proxy>,
  connect_req: Arc<Request>,
  host: String,
  tls: Option<TlsConfigFactory>,
  mut client: ClientStream,
) {
  let factory = tls.or_else(|| proxy.leaf_issuer().map(|issuer| issuer.config_factory()));
  let Some(factory) = factory else {
    tracing::error!(%host, "TLS MITM requested but no certificate authority configured");
    http1::write_bad_gateway(&mut client).await;
    return;
  };
  let config = match factory((*connect_req).clone(), host.clone()).await {
    Ok(config) => config,
    Err(e) => {
      tracing::error!(%host, error = %e, "TLS MITM failed to resolve server config");
      http1::write_bad_gateway(&mut client).await;
      return;
    }
  };

  let acceptor = TlsAcceptor::from(config);
  let tls_stream = match acceptor.accept(client).await {
    Ok(stream) => stream,
    Err(e) => {
      tracing::error!(%host, error = %e, "TLS MITM handshake failed");
      return;
    }
  };

  let outer_host = connect_req
    .uri()
    .authority()
    .map(|a| a.as_str().to_string())
    .unwrap_or(host);

  let mut stream = BufReader::new(tls_stream);
  loop {
    let mut req = match http1::read_request(&mut stream).await {
      Ok(Some(req)) => req,
      Ok(None) => break,
      Err(e) => {
        tracing::error!(host = %outer_host, error = %e, "TLS MITM failed to read request");
        return;
      }
    };

    let session = proxy.next_session();
    let mut ctx = Context::new(session, proxy.shared_round_tripper());
    ctx.set_connect_request(connect_req.clone());
    // The inner request arrived over the tunnel; its true peer is the
    // tunnel's client.
    req.set_remote_addr(connect_req.remote_addr());

    // In-tunnel requests use origin-form targets; rebuild the absolute
    // URL from the outer CONNECT host.
    if req.uri().scheme().is_none() {
      let rewritten = format!("https://{}{}", outer_host, req.uri());
      match rewritten.parse::<http::Uri>() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(e) => {
          tracing::error!(host = %outer_host, url = %rewritten, error = %e, "TLS MITM request URL");
          return;
        }
      }
    }
    tracing::debug!(session, uri = %req.uri(), "TLS MITM request");

    ctx.set_request(req.clone());
    let (req, canned) = proxy.filter_request(req, &mut ctx).await;
    ctx.set_request(req.clone());

    let mut req = req;
    let mut resp = canned;
    if resp.is_none() {
      let mut outbound = req.clone();
      remove_proxy_headers(&mut outbound);
      match ctx.round_tripper().round_trip(&outbound).await {
        Ok(got) => {
          tracing::debug!(session, status = %got.status_code(), "TLS MITM response");
          resp = Some(got);
        }
        Err(e) => {
          tracing::error!(session, error = %e, "TLS MITM round trip failed");
          ctx.set_error(e);
        }
      }
      if resp.is_none() {
        let (next, synthesized) = proxy.filter_response(req, None, &mut ctx).await;
        req = next;
        match synthesized {
          Some(s) => resp = Some(s),
          None => {
            http1::write_bad_gateway(&mut stream).await;
            return;
          }
        }
      }
    }

    let resp = resp.expect("response populated on every path above");
    ctx.set_response(resp.clone());
    let (_req, resp) = proxy.filter_response(req, Some(resp), &mut ctx).await;
    let Some(resp) = resp else {
      tracing::error!(session, "TLS MITM response dropped by handler");
      http1::write_bad_gateway(&mut stream).await;
      return;
    };

    // Chunked with `Connection: close`, unconditionally: handlers may have
    // rewritten the body, which would invalidate any declared length.
    if let Err(e) = http1::write_response_chunked(&mut stream, &resp).await {
      tracing::error!(session, error = %e, "TLS MITM failed to write response");
      return;
    }
  }
  tracing::debug!(host = %outer_host, "TLS MITM tunnel drained");
}
