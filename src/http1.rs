//! HTTP/1.x wire codec.
//!
//! Reads and writes whole messages over buffered streams. Bodies are
//! buffered: chunked payloads are decoded on read and the headers
//! normalized to a plain `Content-Length`, so the rest of the engine only
//! ever sees byte-counted bodies.

use crate::error::{Error, Result};
use crate::message::{Request, Response};
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request line and single header line cap.
const MAX_LINE: usize = 8 * 1024;
/// Total header block cap.
const MAX_HEADERS: usize = 64 * 1024;

/// Read one line, enforcing the line cap. Returns `None` on EOF before any
/// byte arrives.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = String::new();
  let n = reader.read_line(&mut line).await?;
  if n == 0 {
    return Ok(None);
  }
  if n > MAX_LINE {
    return Err(Error::invalid_request("line exceeds maximum length"));
  }
  while line.ends_with('\r') || line.ends_with('\n') {
    line.pop();
  }
  Ok(Some(line))
}

/// Read a header block up to and including the blank separator line.
async fn read_headers<R>(reader: &mut R) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut total = 0usize;
  loop {
    let line = match read_line(reader).await? {
      Some(line) => line,
      None => return Err(Error::invalid_request("unexpected EOF in headers")),
    };
    if line.is_empty() {
      return Ok(headers);
    }
    total += line.len();
    if total > MAX_HEADERS {
      return Err(Error::invalid_request("header block exceeds maximum size"));
    }
    if let Some(idx) = line.find(':') {
      let (name, value) = line.split_at(idx);
      if let (Ok(name), Ok(value)) = (
        http::header::HeaderName::from_bytes(name.trim().as_bytes()),
        HeaderValue::from_str(value[1..].trim()),
      ) {
        headers.append(name, value);
      }
      // Unparseable header lines are dropped rather than failing the
      // whole exchange.
    }
  }
}

fn parse_version(token: &str) -> Version {
  match token {
    "HTTP/1.0" => Version::HTTP_10,
    "HTTP/1.1" => Version::HTTP_11,
    _ => Version::HTTP_11,
  }
}

pub(crate) fn version_str(version: Version) -> &'static str {
  match version {
    Version::HTTP_10 => "HTTP/1.0",
    _ => "HTTP/1.1",
  }
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>> {
  match headers.get(CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => value
      .to_str()
      .ok()
      .and_then(|s| s.trim().parse::<usize>().ok())
      .map(Some)
      .ok_or_else(|| Error::invalid_request("malformed Content-Length")),
  }
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|raw| {
      raw
        .to_ascii_lowercase()
        .split(',')
        .any(|enc| enc.trim() == "chunked")
    })
    .unwrap_or(false)
}

/// Decode a chunked body, consuming the optional trailer section.
async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let size_line = read_line(reader)
      .await?
      .ok_or_else(|| Error::invalid_request("unexpected EOF in chunk size"))?;
    let size_token = size_line.split(';').next().unwrap_or("").trim();
    let size = usize::from_str_radix(size_token, 16)
      .map_err(|_| Error::invalid_request(format!("invalid chunk size: {size_token}")))?;
    if size == 0 {
      // Trailers, if any, end with a blank line.
      while let Some(line) = read_line(reader).await? {
        if line.is_empty() {
          break;
        }
      }
      return Ok(body);
    }
    let start = body.len();
    body.resize(start + size, 0);
    reader.read_exact(&mut body[start..]).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if &crlf != b"\r\n" {
      return Err(Error::invalid_request("chunk missing CRLF terminator"));
    }
  }
}

async fn read_fixed_body<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = vec![0u8; len];
  if len > 0 {
    reader.read_exact(&mut body).await?;
  }
  Ok(body)
}

/// Replace any transfer framing headers with the actual byte count.
fn normalize_body_headers(headers: &mut HeaderMap, len: usize) {
  headers.remove(TRANSFER_ENCODING);
  headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
}

/// Read one request from the client side of a connection.
///
/// Returns `Ok(None)` on a clean EOF before the request line, which is how
/// keep-alive connections and drained MITM tunnels end.
pub(crate) async fn read_request<R>(reader: &mut R) -> Result<Option<Request>>
where
  R: AsyncBufRead + Unpin,
{
  let line = match read_line(reader).await? {
    Some(line) => line,
    None => return Ok(None),
  };
  let mut parts = line.split_whitespace();
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m, t, v),
    _ => return Err(Error::invalid_request(format!("malformed request line: {line}"))),
  };
  let method = Method::from_bytes(method.as_bytes())?;
  let uri: Uri = target.parse()?;
  let version = parse_version(version);

  let headers = read_headers(reader).await?;

  let body = if method == Method::CONNECT {
    // A CONNECT carries no body; the tunnel payload follows raw.
    Vec::new()
  } else if is_chunked(&headers) {
    read_chunked_body(reader).await?
  } else if let Some(len) = content_length(&headers)? {
    read_fixed_body(reader, len).await?
  } else {
    Vec::new()
  };

  let mut builder = http::Request::builder()
    .method(method)
    .uri(uri)
    .version(version);
  if let Some(map) = builder.headers_mut() {
    *map = headers;
  }
  if body.len() > 0 || builder.headers_ref().is_some_and(|h| is_chunked(h)) {
    if let Some(map) = builder.headers_mut() {
      normalize_body_headers(map, body.len());
    }
  }
  let request = builder.body(Bytes::from(body))?;
  Ok(Some(request.into()))
}

/// Read the status line and headers of a response, leaving the body on the
/// stream. Used for CONNECT replies, which are bodyless on success.
pub(crate) async fn read_response_head<R>(reader: &mut R) -> Result<Response>
where
  R: AsyncBufRead + Unpin,
{
  let line = read_line(reader)
    .await?
    .ok_or_else(|| Error::invalid_request("EOF before response status line"))?;
  let mut parts = line.splitn(3, ' ');
  let version = parts
    .next()
    .ok_or_else(|| Error::invalid_request("status line missing HTTP version"))?;
  let status = parts
    .next()
    .ok_or_else(|| Error::invalid_request("status line missing status code"))?;
  let status = StatusCode::from_bytes(status.as_bytes())
    .map_err(|_| Error::invalid_request(format!("invalid status code in: {line}")))?;
  let version = parse_version(version);
  let headers = read_headers(reader).await?;

  let mut builder = http::Response::builder().status(status).version(version);
  if let Some(map) = builder.headers_mut() {
    *map = headers;
  }
  Ok(builder.body(Bytes::new())?.into())
}

fn body_forbidden(status: StatusCode, method: &Method) -> bool {
  method == Method::HEAD
    || status.is_informational()
    || matches!(status.as_u16(), 204 | 205 | 304)
}

/// Read a whole response, body included. `method` is the method of the
/// request this responds to, which decides whether a body may follow.
///
/// Bodies without explicit framing are read to EOF, which is why the
/// transport always asks origins for `Connection: close`.
pub(crate) async fn read_response<R>(reader: &mut R, method: &Method) -> Result<Response>
where
  R: AsyncBufRead + Unpin,
{
  let mut response = read_response_head(reader).await?;

  if body_forbidden(response.status(), method) {
    return Ok(response);
  }

  let body = if is_chunked(response.headers()) {
    let body = read_chunked_body(reader).await?;
    normalize_body_headers(response.headers_mut(), body.len());
    body
  } else if let Some(len) = content_length(response.headers())? {
    read_fixed_body(reader, len).await?
  } else {
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    body
  };

  *response.body_mut() = Bytes::from(body);
  Ok(response)
}

/// Serialize a request. `origin_form` chooses between a path-only request
/// target (for talking to the origin itself) and the absolute form a proxy
/// expects.
pub(crate) async fn write_request<W>(writer: &mut W, req: &Request, origin_form: bool) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let target = if origin_form {
    req
      .uri()
      .path_and_query()
      .map(|pq| pq.as_str())
      .unwrap_or("/")
      .to_string()
  } else {
    req.uri().to_string()
  };
  let head = format!("{} {} {}\r\n", req.method(), target, version_str(req.version()));
  writer.write_all(head.as_bytes()).await?;

  if !req.headers().contains_key(HOST) {
    if let Some(authority) = req.uri().authority() {
      writer
        .write_all(format!("Host: {}\r\n", authority.as_str()).as_bytes())
        .await?;
    }
  }
  for (name, value) in req.headers() {
    if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
      continue;
    }
    write_header(writer, name.as_str(), value).await?;
  }
  if !req.body().is_empty() || req.headers().contains_key(CONTENT_LENGTH) {
    writer
      .write_all(format!("Content-Length: {}\r\n", req.body().len()).as_bytes())
      .await?;
  }
  writer.write_all(b"\r\n").await?;
  if !req.body().is_empty() {
    writer.write_all(req.body()).await?;
  }
  writer.flush().await?;
  Ok(())
}

/// Serialize a response with byte-counted framing.
pub(crate) async fn write_response<W>(writer: &mut W, resp: &Response) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  write_status_line(writer, resp).await?;
  for (name, value) in resp.headers() {
    if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
      continue;
    }
    write_header(writer, name.as_str(), value).await?;
  }
  // An empty body with a declared length is a HEAD answer; keep the
  // origin's figure in that case.
  if resp.body().is_empty() {
    if let Some(value) = resp.headers().get(CONTENT_LENGTH) {
      write_header(writer, "Content-Length", value).await?;
    } else {
      writer.write_all(b"Content-Length: 0\r\n").await?;
    }
  } else {
    writer
      .write_all(format!("Content-Length: {}\r\n", resp.body().len()).as_bytes())
      .await?;
  }
  writer.write_all(b"\r\n").await?;
  if !resp.body().is_empty() {
    writer.write_all(resp.body()).await?;
  }
  writer.flush().await?;
  Ok(())
}

/// Serialize a response in chunked transfer encoding with
/// `Connection: close`, the only reply shape a decrypting tunnel emits.
/// The status line is always HTTP/1.1; any `Content-Length` is dropped
/// since handlers may have rewritten the body.
pub(crate) async fn write_response_chunked<W>(writer: &mut W, resp: &Response) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let reason = resp.status_code().canonical_reason().unwrap_or("");
  writer
    .write_all(format!("HTTP/1.1 {} {}\r\n", resp.status_code().as_u16(), reason).as_bytes())
    .await?;
  for (name, value) in resp.headers() {
    if name == CONTENT_LENGTH || name == TRANSFER_ENCODING || name == CONNECTION {
      continue;
    }
    write_header(writer, name.as_str(), value).await?;
  }
  writer.write_all(b"Transfer-Encoding: chunked\r\n").await?;
  writer.write_all(b"Connection: close\r\n").await?;
  writer.write_all(b"\r\n").await?;
  if !resp.body().is_empty() {
    writer
      .write_all(format!("{:x}\r\n", resp.body().len()).as_bytes())
      .await?;
    writer.write_all(resp.body()).await?;
    writer.write_all(b"\r\n").await?;
  }
  writer.write_all(b"0\r\n\r\n").await?;
  writer.flush().await?;
  Ok(())
}

async fn write_status_line<W>(writer: &mut W, resp: &Response) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let reason = resp.status_code().canonical_reason().unwrap_or("");
  writer
    .write_all(
      format!(
        "{} {} {}\r\n",
        version_str(resp.version()),
        resp.status_code().as_u16(),
        reason
      )
      .as_bytes(),
    )
    .await?;
  Ok(())
}

async fn write_header<W>(writer: &mut W, name: &str, value: &HeaderValue) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  writer.write_all(name.as_bytes()).await?;
  writer.write_all(b": ").await?;
  writer.write_all(value.as_bytes()).await?;
  writer.write_all(b"\r\n").await?;
  Ok(())
}

/// Write the bodyless 502 a client gets when the proxy cannot reach the
/// destination on its behalf.
pub(crate) async fn write_bad_gateway<W>(writer: &mut W)
where
  W: AsyncWrite + Unpin,
{
  if let Err(e) = writer.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await {
    tracing::error!(error = %e, "failed to write 502 to client");
  }
  let _ = writer.shutdown().await;
}
