use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::AsyncBufRead;

use crate::body::Body;
use crate::errors::{Error, Result};
use crate::response::{is_chunked, parse_version, read_body_exact, read_chunked_body, read_headers, read_line};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Longest request line accepted from a client.
pub const MAX_LINE_LENGTH: u64 = 8 * 1024;
/// Largest header block accepted from a client.
pub const MAX_HEADERS_LENGTH: u64 = 64 * 1024;

/// An HTTP/1.x request, either read off a client connection or built for `Client::execute()`.
#[derive(Default, Clone, PartialEq)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Serializes the request for an origin server.
  ///
  /// The request line is written in origin-form (`path?query`), a `Host` header is taken from
  /// the URI authority when the request carries none, and the body is framed with
  /// `Content-Length` whatever framing it arrived with.
  pub fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    http_requests.extend(self.origin_form().as_bytes());
    http_requests.extend(SPACE);
    http_requests.extend(version_str(self.version).as_bytes());
    http_requests.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      if let Some(authority) = self.uri.authority() {
        http_requests.extend(http::header::HOST.as_str().as_bytes());
        http_requests.extend(COLON_SPACE);
        http_requests.extend(authority.as_str().as_bytes());
        http_requests.extend(CR_LF);
      }
    }
    let mut headers = self.headers.clone();
    headers.remove(http::header::TRANSFER_ENCODING);
    headers.remove(http::header::CONTENT_LENGTH);
    let body_len = self.body.as_ref().map(|b| b.len()).unwrap_or_default();
    if body_len > 0 || matches!(self.method, Method::POST | Method::PUT | Method::PATCH) {
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body_len));
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = self.body() {
      http_requests.extend(b.as_ref());
    }
    Bytes::from(http_requests)
  }

  /// `path?query` of the target, `/` when the target has no path.
  pub fn origin_form(&self) -> String {
    let path = match self.uri.path() {
      "" => "/",
      p => p,
    };
    match self.uri.query() {
      Some(q) => format!("{}?{}", path, q),
      None => path.to_string(),
    }
  }

  /// Creates a new builder-style object to manufacture a `Request`
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
}

impl Request {
  /// The HTTP method of this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Mutable access to the method.
  #[inline]
  pub fn method_mut(&mut self) -> &mut Method {
    &mut self.method
  }
  /// The request target. Absolute-form for plain proxy requests, authority-form for
  /// `CONNECT` and origin-form inside a tunnel.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Mutable access to the request target.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Headers in wire order, duplicates preserved.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Mutable access to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// The protocol version from the request line.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// The de-chunked body, if any bytes were sent.
  #[inline]
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Mutable access to the body.
  #[inline]
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Whether this is a tunnel request.
  #[inline]
  pub fn is_connect(&self) -> bool {
    self.method == Method::CONNECT
  }
}

/// Reads HTTP/1.x requests off a client connection.
pub struct RequestReader;

impl RequestReader {
  /// Reads one full request, body included.
  ///
  /// Returns `Ok(None)` when the peer closed the stream before sending a byte.
  pub async fn read<R>(reader: &mut R) -> Result<Option<Request>>
  where
    R: AsyncBufRead + Unpin,
  {
    let line = read_line(reader, MAX_LINE_LENGTH).await?;
    if line.is_empty() {
      return Ok(None);
    }
    let line = trim_line(&line);
    let mut parts = line.split(|b| b == &b' ').filter(|p| !p.is_empty());
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
      (Some(m), Some(t), Some(v), None) => (m, t, v),
      _ => {
        return Err(Error::invalid_request(format!(
          "malformed request line: {}",
          line.escape_ascii()
        )))
      }
    };
    let method = Method::from_bytes(method)?;
    let uri = http::Uri::try_from(target)?;
    let version = parse_version(version)
      .ok_or_else(|| Error::invalid_request(format!("unsupported version: {}", version.escape_ascii())))?;
    let headers = read_headers(reader, MAX_HEADERS_LENGTH)
      .await
      .map_err(|err| Error::invalid_request(err.to_string()))?;
    let body = if is_chunked(&headers) {
      read_chunked_body(reader).await?
    } else if let Some(length) = content_length(&headers)? {
      read_body_exact(reader, length).await?
    } else {
      Vec::new()
    };
    Ok(Some(Request {
      uri,
      version,
      method,
      headers,
      body: if body.is_empty() { None } else { Some(body.into()) },
    }))
  }
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  match headers.get(http::header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => {
      let value = value
        .to_str()
        .map_err(|_| Error::invalid_request("non-ascii content-length"))?;
      Ok(Some(value.trim().parse()?))
    }
  }
}

pub(crate) fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(b"\r").unwrap_or(line)
}

pub(crate) fn version_str(version: Version) -> &'static str {
  match version {
    Version::HTTP_09 => "HTTP/0.9",
    Version::HTTP_10 => "HTTP/1.0",
    _ => "HTTP/1.1",
  }
}
