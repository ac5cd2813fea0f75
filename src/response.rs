use std::fmt::Debug;

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use http::{HeaderMap, HeaderValue, Method, Response as HttpResponse, StatusCode, Version};
use mime::Mime;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::body::Body;
use crate::errors::{new_io_error, Error, Result};
use crate::request::{trim_line, version_str, MAX_HEADERS_LENGTH, MAX_LINE_LENGTH};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// A Response read from an origin server.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  reason: String,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
  // body ran until the origin closed the connection
  eof_framed: bool,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body.eq(&other.body)
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      status_code: parts.status,
      reason: parts.status.canonical_reason().unwrap_or_default().to_string(),
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
      eof_framed: false,
    }
  }
}

impl Response {
  /// Serializes the response for the client.
  ///
  /// The reason phrase is kept as the origin sent it. A chunked or EOF-delimited body is
  /// reframed with `Content-Length`, even when it is empty.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(version_str(self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(self.status_line().as_bytes());
    http_response.extend(CR_LF);
    let mut headers = self.headers.clone();
    let body_len = self.body.as_ref().map(|b| b.len()).unwrap_or_default();
    let chunked = headers.remove(http::header::TRANSFER_ENCODING).is_some();
    if chunked || self.eof_framed || body_len > 0 {
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(body_len));
    }
    for (k, v) in headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    if let Some(b) = self.body() {
      http_response.extend(b.as_ref());
    }
    Bytes::from(http_response)
  }
  /// An HTTP response builder
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
}

impl Response {
  /// Decodes the body to text using the `charset` of the `Content-Type` header, UTF-8 otherwise.
  pub fn text(&self) -> String {
    match self.body() {
      Some(body) => decode_text(body, &self.headers),
      None => String::new(),
    }
  }
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Status code and reason phrase, e.g. `200 OK`.
  pub fn status_line(&self) -> String {
    if self.reason.is_empty() {
      match self.status_code.canonical_reason() {
        Some(reason) => format!("{} {}", self.status_code.as_u16(), reason),
        None => self.status_code.as_u16().to_string(),
      }
    } else {
      format!("{} {}", self.status_code.as_u16(), self.reason)
    }
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// The body as sent by the origin, de-chunked but not content-decoded.
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Mutable access to the body.
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
}

/// Reads an HTTP/1.x response off an origin connection.
pub struct ResponseReader;

impl ResponseReader {
  /// Reads status line, headers and the whole body.
  ///
  /// `method` is the method of the request this answers; `HEAD` responses carry no body.
  pub async fn read<R>(reader: &mut R, method: &Method) -> Result<Response>
  where
    R: AsyncBufRead + Unpin,
  {
    let line = read_line(reader, MAX_LINE_LENGTH).await?;
    if line.is_empty() {
      return Err(Error::invalid_response("connection closed before status line"));
    }
    let (version, status_code, reason) = parse_status_line(trim_line(&line))?;
    let headers = read_headers(reader, MAX_HEADERS_LENGTH).await?;
    let bodiless = *method == Method::HEAD
      || status_code.is_informational()
      || status_code == StatusCode::NO_CONTENT
      || status_code == StatusCode::NOT_MODIFIED;
    let mut eof_framed = false;
    let body = if bodiless {
      Vec::new()
    } else if is_chunked(&headers) {
      read_chunked_body(reader).await?
    } else if let Some(length) = headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.trim().parse::<u64>().ok())
    {
      read_body_exact(reader, length).await?
    } else {
      let mut body = Vec::new();
      reader.read_to_end(&mut body).await?;
      eof_framed = true;
      body
    };
    Ok(Response {
      version,
      status_code,
      reason,
      headers,
      body: if body.is_empty() { None } else { Some(body.into()) },
      eof_framed,
    })
  }
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode, String)> {
  let mut parts = line.splitn(3, |b| b == &b' ');
  let version = parts
    .next()
    .and_then(parse_version)
    .ok_or_else(|| Error::invalid_response(format!("invalid status line: {}", line.escape_ascii())))?;
  let status_code = parts
    .next()
    .filter(|s| s.len() == 3)
    .and_then(|s| StatusCode::from_bytes(s).ok())
    .ok_or_else(|| Error::invalid_response(format!("invalid status code: {}", line.escape_ascii())))?;
  let reason = parts
    .next()
    .map(|r| String::from_utf8_lossy(r).trim().to_string())
    .unwrap_or_default();
  Ok((version, status_code, reason))
}

pub(crate) fn parse_version(v: &[u8]) -> Option<Version> {
  match v {
    b"HTTP/0.9" => Some(Version::HTTP_09),
    b"HTTP/1.0" => Some(Version::HTTP_10),
    b"HTTP/1.1" => Some(Version::HTTP_11),
    _ => None,
  }
}

/// Reads one line including its terminator, at most `limit` bytes. Empty on EOF.
pub(crate) async fn read_line<R>(reader: &mut R, limit: u64) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  (&mut *reader).take(limit).read_until(b'\n', &mut line).await?;
  if !line.is_empty() && !line.ends_with(b"\n") {
    if line.len() as u64 >= limit {
      return Err(new_io_error(std::io::ErrorKind::InvalidData, "line too long"));
    }
    return Err(new_io_error(std::io::ErrorKind::UnexpectedEof, "unterminated line"));
  }
  Ok(line)
}

pub(crate) async fn read_headers<R>(reader: &mut R, limit: u64) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut total = 0u64;
  loop {
    let header_line = read_line(reader, MAX_LINE_LENGTH).await?;
    if header_line.is_empty() {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside header block",
      ));
    }
    total += header_line.len() as u64;
    if total > limit {
      return Err(new_io_error(std::io::ErrorKind::InvalidData, "header block too large"));
    }
    let header_line = trim_line(&header_line);
    if header_line.is_empty() {
      break;
    }
    let (k, v) = parser_headers(header_line)?;
    headers.append(k, v);
  }
  Ok(headers)
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(http::HeaderName, http::HeaderValue)> {
  let mut parts = buffer.splitn(2, |s| s == &b':');
  let (name, value) = match (parts.next(), parts.next()) {
    (Some(name), Some(value)) => (name, value),
    _ => {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "header line without colon",
      ))
    }
  };
  let name = http::HeaderName::from_bytes(name)?;
  let value = http::HeaderValue::from_bytes(value.trim_ascii())?;
  Ok((name, value))
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get_all(http::header::TRANSFER_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

pub(crate) async fn read_body_exact<R>(reader: &mut R, length: u64) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  (&mut *reader).take(length).read_to_end(&mut body).await?;
  if (body.len() as u64) < length {
    return Err(new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "connection closed before end of body",
    ));
  }
  Ok(body)
}

pub(crate) async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  loop {
    let size_line = read_line(reader, MAX_LINE_LENGTH).await?;
    if size_line.is_empty() {
      return Err(new_io_error(std::io::ErrorKind::UnexpectedEof, "truncated chunked body"));
    }
    let size_line = String::from_utf8_lossy(trim_line(&size_line)).to_string();
    // chunk extensions follow a ';'
    let size = size_line.split(';').next().unwrap_or_default().trim();
    let size = u64::from_str_radix(size, 16)?;
    if size == 0 {
      // trailers
      loop {
        let trailer = read_line(reader, MAX_LINE_LENGTH).await?;
        if trailer.is_empty() || trim_line(&trailer).is_empty() {
          break;
        }
      }
      break;
    }
    let mut chunk = read_body_exact(reader, size).await?;
    body.append(&mut chunk);
    read_line(reader, MAX_LINE_LENGTH).await?;
  }
  Ok(body)
}

/// Decodes `body` using the charset of the `Content-Type` header, falling back to UTF-8.
pub fn decode_text(body: &[u8], headers: &HeaderMap) -> String {
  let default_encoding = "utf-8";
  let content_type = headers
    .get(http::header::CONTENT_TYPE)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.parse::<Mime>().ok());
  let header_encoding = content_type
    .as_ref()
    .and_then(|mime| mime.get_param("charset").map(|charset| charset.as_str()))
    .unwrap_or(default_encoding);
  for encoding_name in &[header_encoding, default_encoding] {
    let encoding = Encoding::for_label(encoding_name.as_bytes()).unwrap_or(UTF_8);
    let (text, _, is_errors) = encoding.decode(body);
    if !is_errors {
      return text.into_owned();
    }
  }
  String::from_utf8_lossy(body).into_owned()
}
