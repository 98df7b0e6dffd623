//! CONNECT dispatch: the tunnel state machine.

use crate::action::{ClientStream, ConnectAction};
use crate::ctx::Context;
use crate::http1;
use crate::message::Request;
use crate::mitm;
use crate::proxy::Proxy;
use crate::stream::MaybeTlsStream;
use crate::tunnel;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};

const CONNECT_OK: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";
// Deliberately no terminating blank line: the hijack callback finishes the
// header block itself.
const PROXY_AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\n";

fn ensure_port(host: String) -> String {
  let has_port = host
    .rsplit_once(':')
    .map(|(_, tail)| !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()))
    .unwrap_or(false);
  if has_port {
    host
  } else {
    format!("{host}:80")
  }
}

/// Drive a CONNECT request to its conclusion. Owns the client connection
/// from here on.
pub(crate) async fn dispatch(proxy: Arc<Proxy>, req: Request, mut client: ClientStream) {
  let session = proxy.next_session();
  let mut ctx = Context::new(session, proxy.shared_round_tripper());

  let original_host = req
    .uri()
    .authority()
    .map(|a| a.as_str().to_string())
    .or_else(|| req.host().map(String::from))
    .unwrap_or_default();
  tracing::debug!(session, host = %original_host, "connect request");

  ctx.set_request(req.clone());
  let (req, action, host) = proxy.run_connect_handlers(req, original_host, &mut ctx).await;

  match action {
    ConnectAction::Accept => {
      let host = ensure_port(host);
      let target = match proxy.connect_dial(&host).await {
        Ok(target) => target,
        Err(e) => {
          tracing::error!(session, %host, error = %e, "accept connect failed to dial");
          http1::write_bad_gateway(&mut client).await;
          return;
        }
      };
      tracing::debug!(session, %host, "accept connect");
      if client.write_all(CONNECT_OK).await.is_err() {
        return;
      }
      let _ = client.flush().await;
      tunnel::splice(client, target).await;
    }
    ConnectAction::Reject => {
      tracing::debug!(session, %host, "reject connect");
      if let Some(resp) = ctx.take_response() {
        if let Err(e) = http1::write_response(&mut client, &resp).await {
          tracing::error!(session, error = %e, "failed to write reject response");
        }
      }
      let _ = client.shutdown().await;
    }
    ConnectAction::Hijack { callback } => {
      tracing::debug!(session, %host, "hijack connect");
      if client.write_all(CONNECT_OK).await.is_err() {
        return;
      }
      let _ = client.flush().await;
      callback(req, client).await;
    }
    ConnectAction::ProxyAuthHijack { callback } => {
      if client.write_all(PROXY_AUTH_REQUIRED).await.is_err() {
        return;
      }
      let _ = client.flush().await;
      callback(req, client).await;
    }
    ConnectAction::HttpMitm => {
      tracing::debug!(session, %host, "connect HTTP MITM");
      if client.write_all(CONNECT_OK).await.is_err() {
        return;
      }
      let _ = client.flush().await;
      let host = ensure_port(host);
      let target = match proxy.connect_dial(&host).await {
        Ok(target) => target,
        Err(e) => {
          tracing::error!(session, %host, error = %e, "HTTP MITM failed to dial");
          return;
        }
      };
      http_mitm_loop(proxy, Arc::new(req), client, target).await;
    }
    ConnectAction::Mitm { tls } => {
      tracing::debug!(session, %host, "connect TLS MITM");
      if client.write_all(CONNECT_OK).await.is_err() {
        return;
      }
      let _ = client.flush().await;
      // Detached so long-lived tunnels don't pin the accepting task.
      tokio::spawn(mitm::serve(proxy, Arc::new(req), host, tls, client));
    }
  }
}

/// Cleartext interception: read one request at a time off the tunnel, run
/// it through the handler chains, and either answer from a canned response
/// or forward it over the plain connection to the destination. Ends on
/// client EOF or the first unrecoverable I/O error.
async fn http_mitm_loop(
  proxy: Arc<Proxy>,
  connect_req: Arc<Request>,
  mut client: ClientStream,
  target: MaybeTlsStream,
) {
  let mut target = BufReader::new(target);
  loop {
    let mut req = match http1::read_request(&mut client).await {
      Ok(Some(req)) => req,
      Ok(None) => return,
      Err(e) => {
        tracing::error!(error = %e, "HTTP MITM failed to read request");
        return;
      }
    };
    req.set_remote_addr(connect_req.remote_addr());

    let session = proxy.next_session();
    let mut ctx = Context::new(session, proxy.shared_round_tripper());
    ctx.set_connect_request(connect_req.clone());
    ctx.set_request(req.clone());

    let (req, canned) = proxy.filter_request(req, &mut ctx).await;
    ctx.set_request(req.clone());

    let mut resp = canned;
    if resp.is_none() {
      if let Err(e) = http1::write_request(&mut target, &req, true).await {
        tracing::error!(session, error = %e, "HTTP MITM failed to forward request");
        http1::write_bad_gateway(&mut client).await;
        return;
      }
      match http1::read_response(&mut target, req.method()).await {
        Ok(got) => resp = Some(got),
        Err(e) => {
          tracing::error!(session, error = %e, "HTTP MITM failed to read response");
          http1::write_bad_gateway(&mut client).await;
          return;
        }
      }
    }

    if let Some(r) = resp.as_ref() {
      ctx.set_response(r.clone());
    }
    let (_req, resp) = proxy.filter_response(req, resp, &mut ctx).await;
    let Some(resp) = resp else {
      tracing::error!(session, "HTTP MITM response dropped by handler");
      http1::write_bad_gateway(&mut client).await;
      return;
    };
    if let Err(e) = http1::write_response(&mut client, &resp).await {
      tracing::error!(session, error = %e, "HTTP MITM failed to write response");
      return;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ensure_port_appends_default() {
    assert_eq!(ensure_port("example.com".into()), "example.com:80");
    assert_eq!(ensure_port("example.com:443".into()), "example.com:443");
  }
}
