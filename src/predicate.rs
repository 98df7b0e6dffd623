//! Composable guards over requests and responses.
//!
//! Predicates decide whether a registered handler runs for a given
//! exchange. They are plain boolean tests: total, side-effect free, and
//! conjoined at registration time (every predicate in the list must match).
//! [`Predicate::not`] is the only built-in combinator.

use crate::message::{Request, Response};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

/// A boolean test over a request, optionally looking at the response.
///
/// Request-shaped predicates ignore the response and can guard request,
/// response, and CONNECT handlers alike. Response-shaped predicates (see
/// [`content_type_is`]) return `false` while no response exists, so they
/// only ever select response handlers.
#[derive(Clone)]
pub struct Predicate {
  test: Arc<dyn Fn(&Request, Option<&Response>) -> bool + Send + Sync>,
}

impl Predicate {
  /// Build a predicate from a request test.
  pub fn from_fn<F>(f: F) -> Self
  where
    F: Fn(&Request) -> bool + Send + Sync + 'static,
  {
    Self {
      test: Arc::new(move |req, _| f(req)),
    }
  }

  /// Build a predicate from a test over the request and the response slot.
  pub fn from_response_fn<F>(f: F) -> Self
  where
    F: Fn(&Request, Option<&Response>) -> bool + Send + Sync + 'static,
  {
    Self { test: Arc::new(f) }
  }

  /// Negate a predicate.
  pub fn not(inner: Predicate) -> Self {
    Self {
      test: Arc::new(move |req, resp| !(inner.test)(req, resp)),
    }
  }

  pub(crate) fn eval(&self, req: &Request, resp: Option<&Response>) -> bool {
    (self.test)(req, resp)
  }
}

impl std::fmt::Debug for Predicate {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("Predicate")
  }
}

/// Host the request is directed at, with port when one was given:
/// the URI authority, or the raw `Host` header for origin-form requests.
fn request_host(req: &Request) -> &str {
  req
    .uri()
    .authority()
    .map(|a| a.as_str())
    .or_else(|| {
      req
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
    })
    .unwrap_or("")
}

/// Matches when the request URL starts with `prefix`, tried against the
/// bare path, `host+path`, and `scheme+host+path`.
///
/// `url_has_prefix("host/x")` matches both `GET /x` sent to `host` and an
/// absolute request for `http://host/x`.
pub fn url_has_prefix(prefix: impl Into<String>) -> Predicate {
  let prefix = prefix.into();
  Predicate::from_fn(move |req| {
    let path = req.uri().path();
    let host = request_host(req);
    let scheme = req.uri().scheme_str().unwrap_or("");
    path.starts_with(&prefix)
      || format!("{host}{path}").starts_with(&prefix)
      || format!("{scheme}{host}{path}").starts_with(&prefix)
  })
}

/// Matches when the request URL is one of `urls`, with or without the host
/// prefix: `url_is(["google.com/", "foo"])` matches `GET /` to google.com
/// and any request for `foo`.
pub fn url_is<I, S>(urls: I) -> Predicate
where
  I: IntoIterator<Item = S>,
  S: Into<String>,
{
  let set: HashSet<String> = urls.into_iter().map(Into::into).collect();
  Predicate::from_fn(move |req| {
    let path = req.uri().path();
    set.contains(path) || set.contains(&format!("{}{}", request_host(req), path))
  })
}

/// Matches when the destination host (with port, when present) matches any
/// of the given regular expressions.
pub fn host_matches<I>(patterns: I) -> Predicate
where
  I: IntoIterator<Item = Regex>,
{
  let patterns: Vec<Regex> = patterns.into_iter().collect();
  Predicate::from_fn(move |req| {
    let host = request_host(req);
    patterns.iter().any(|re| re.is_match(host))
  })
}

/// Matches when the destination host (with port, when present) equals one
/// of the given strings.
pub fn host_is<I, S>(hosts: I) -> Predicate
where
  I: IntoIterator<Item = S>,
  S: Into<String>,
{
  let set: HashSet<String> = hosts.into_iter().map(Into::into).collect();
  Predicate::from_fn(move |req| set.contains(request_host(req)))
}

/// Matches when the destination host is explicitly local: a 127.0.0.0/8
/// address, `::1` in either notation, or the literal `localhost`.
pub fn is_local_host() -> Predicate {
  Predicate::from_fn(|req| {
    let host = request_host(req);
    let bare = host
      .rsplit_once(':')
      .map(|(h, _)| h)
      .filter(|h| !h.contains(':') || h.starts_with('['))
      .unwrap_or(host);
    let bare = bare.trim_start_matches('[').trim_end_matches(']');
    bare == "localhost"
      || bare == "::1"
      || bare == "0:0:0:0:0:0:0:1"
      || bare
        .parse::<std::net::Ipv4Addr>()
        .map(|ip| ip.octets()[0] == 127)
        .unwrap_or(false)
  })
}

/// Matches when the destination URL matches `pattern`, tried against the
/// bare path and `host+path`.
pub fn url_matches(pattern: Regex) -> Predicate {
  Predicate::from_fn(move |req| {
    let path = req.uri().path();
    pattern.is_match(path) || pattern.is_match(&format!("{}{}", request_host(req), path))
  })
}

/// Matches when the host in the request URI equals `host`, ignoring the
/// port. `dst_host_is("www.reddit.com")` selects plain requests, CONNECTs
/// to any port, and decrypted in-tunnel requests for that site alike.
pub fn dst_host_is(host: impl Into<String>) -> Predicate {
  let host = host.into();
  Predicate::from_fn(move |req| req.host() == Some(host.as_str()))
}

/// Matches when the client's peer address starts with one of the given
/// `ip:` prefixes.
pub fn src_ip_is<I, S>(ips: I) -> Predicate
where
  I: IntoIterator<Item = S>,
  S: Into<String>,
{
  let prefixes: Vec<String> = ips.into_iter().map(|ip| format!("{}:", ip.into())).collect();
  Predicate::from_fn(move |req| match req.remote_addr() {
    Some(addr) => {
      let addr = addr.to_string();
      prefixes.iter().any(|p| addr.starts_with(p))
    }
    None => false,
  })
}

/// Matches when the response `Content-Type` equals one of the given types
/// exactly or begins with `type;`. Returns `false` while no response
/// exists, so this only ever selects response handlers.
pub fn content_type_is<I, S>(types: I) -> Predicate
where
  I: IntoIterator<Item = S>,
  S: Into<String>,
{
  let types: Vec<String> = types.into_iter().map(Into::into).collect();
  Predicate::from_response_fn(move |_req, resp| {
    let Some(resp) = resp else {
      return false;
    };
    let Some(content_type) = resp
      .headers()
      .get(http::header::CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
    else {
      return false;
    };
    types
      .iter()
      .any(|t| content_type == t || content_type.starts_with(&format!("{t};")))
  })
}
