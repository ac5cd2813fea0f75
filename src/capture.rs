//! Canonicalization of wire messages into captured records.
//!
//! Nothing here fails: pieces that cannot be parsed degrade to empty values so an exchange
//! is always recorded.
use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use http::{HeaderMap, Method};
use mime::Mime;
use time::OffsetDateTime;

use crate::record::{CapturedRequest, CapturedResponse, ParamValue, Params};
use crate::response::decode_text;
use crate::{Request, Response};

/// Canonical form of a header name: first letter and every letter after `-` upper-cased,
/// the rest lower-cased. Names with bytes outside the token set come back unchanged.
pub fn canonical_name(name: &str) -> String {
  let valid = name
    .bytes()
    .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b));
  if !valid {
    return name.to_string();
  }
  let mut upper = true;
  name
    .chars()
    .map(|c| {
      let mapped = if upper {
        c.to_ascii_uppercase()
      } else {
        c.to_ascii_lowercase()
      };
      upper = c == '-';
      mapped
    })
    .collect()
}

/// Collapses a header map to one value per canonical name, keeping the first occurrence.
pub fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
  let mut flat = BTreeMap::new();
  for (name, value) in headers.iter() {
    flat
      .entry(canonical_name(name.as_str()))
      .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
  }
  flat
}

/// Parses `application/x-www-form-urlencoded` pairs. Repeated names become `Multi`.
pub fn parse_query(query: &str) -> Params {
  let mut params = Params::new();
  for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
    match params.get_mut(name.as_ref()) {
      Some(existing) => existing.push(value.into_owned()),
      None => {
        params.insert(name.into_owned(), ParamValue::Single(value.into_owned()));
      }
    }
  }
  params
}

/// Cookies of the first `Cookie` header. Pairs without `=` are skipped.
pub fn parse_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
  let mut cookies = BTreeMap::new();
  let Some(header) = headers.get(http::header::COOKIE) else {
    return cookies;
  };
  let header = String::from_utf8_lossy(header.as_bytes());
  for pair in header.split(';') {
    if let Some((name, value)) = pair.trim().split_once('=') {
      cookies.insert(name.to_string(), value.to_string());
    }
  }
  cookies
}

/// Whether the headers declare a form-encoded body.
pub fn is_form_encoded(headers: &HeaderMap) -> bool {
  headers
    .get(http::header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.parse::<Mime>().ok())
    .map(|m| m.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str())
    .unwrap_or_default()
}

/// Response body as text: gunzipped when declared, then decoded with the declared charset.
pub fn decode_body(response: &Response) -> String {
  let Some(body) = response.body() else {
    return String::new();
  };
  let gzip = response
    .headers()
    .get_all(http::header::CONTENT_ENCODING)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .any(|v| v.to_ascii_lowercase().contains("gzip"));
  if gzip {
    let mut gzip_body = Vec::new();
    let mut d = MultiGzDecoder::new(&body[..]);
    match d.read_to_end(&mut gzip_body) {
      Ok(_) => return decode_text(&gzip_body, response.headers()),
      Err(err) => tracing::debug!("gzip decode failed, keeping raw body: {}", err),
    }
  }
  decode_text(body, response.headers())
}

/// Canonical view of a request read from a client.
pub fn parse_request(request: &Request) -> CapturedRequest {
  let uri = request.uri();
  let mut headers = flatten_headers(request.headers());
  if !headers.contains_key("Host") {
    if let Some(authority) = uri.authority() {
      headers.insert("Host".to_string(), authority.to_string());
    }
  }
  let raw_body = request
    .body()
    .as_ref()
    .map(|b| b.to_string_lossy())
    .unwrap_or_default();
  let form = if matches!(request.method(), &Method::POST | &Method::PUT)
    && is_form_encoded(request.headers())
  {
    Some(parse_query(&raw_body))
  } else {
    None
  };
  CapturedRequest {
    method: request.method().to_string(),
    path: uri.path().to_string(),
    query: uri.query().map(parse_query).unwrap_or_default(),
    headers,
    cookies: parse_cookies(request.headers()),
    form,
    raw_body,
    created_at: OffsetDateTime::now_utc(),
  }
}

/// Canonical view of an origin response.
pub fn parse_response(response: &Response, elapsed: Duration) -> CapturedResponse {
  CapturedResponse {
    code: response.status_code().as_u16(),
    message: response.status_line(),
    headers: flatten_headers(response.headers()),
    body: decode_body(response),
    elapsed,
  }
}
