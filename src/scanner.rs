//! Command-injection probing of captured requests.
//!
//! Each injection point is tried with a few shell payloads; an origin that echoes
//! `/etc/passwd` content is reported as vulnerable.
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use http::{HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};

use crate::capture::{canonical_name, decode_body, is_form_encoded};
use crate::errors::{Error, Result};
use crate::record::RecordId;
use crate::replay::to_outbound_request;
use crate::store::RecordStore;
use crate::{Client, Request};

/// Payloads appended to a value, tried in order.
pub const PAYLOADS: [&str; 3] = [";cat /etc/passwd;", "|cat /etc/passwd|", "`cat /etc/passwd`"];
/// Response marker of a successful injection.
pub const MARKER: &str = "root:";

/// Where a value lives in a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectionKind {
  /// query string parameter
  Query,
  /// request header
  Header,
  /// cookie inside the `Cookie` header
  Cookie,
  /// form-encoded body parameter
  Form,
}

impl fmt::Display for InjectionKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      InjectionKind::Query => "query",
      InjectionKind::Header => "header",
      InjectionKind::Cookie => "cookie",
      InjectionKind::Form => "form",
    })
  }
}

/// A single value that can be mutated.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionPoint {
  /// location
  pub kind: InjectionKind,
  /// parameter, header or cookie name
  pub name: String,
  /// value as captured
  pub value: String,
}

impl InjectionPoint {
  fn new(kind: InjectionKind, name: impl Into<String>, value: impl Into<String>) -> Self {
    Self {
      kind,
      name: name.into(),
      value: value.into(),
    }
  }
}

/// Outcome of scanning one record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
  /// one line per vulnerable point
  pub vulnerabilities: Vec<String>,
  /// one line per point that could not be tested
  pub errors: Vec<String>,
}

/// Lists every injection point of `request`.
///
/// Query parameters count for `GET` only and form parameters for form-encoded `POST` only.
/// Every header value and every cookie is a point.
pub fn scan_request(request: &Request) -> Vec<InjectionPoint> {
  let mut points = Vec::new();
  if request.method() == Method::GET {
    if let Some(query) = request.uri().query() {
      for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        points.push(InjectionPoint::new(InjectionKind::Query, name, value));
      }
    }
  }
  if request.method() == Method::POST && is_form_encoded(request.headers()) {
    if let Some(body) = request.body() {
      for (name, value) in url::form_urlencoded::parse(&body[..]) {
        points.push(InjectionPoint::new(InjectionKind::Form, name, value));
      }
    }
  }
  for (name, value) in request.headers() {
    // the target host is not a request parameter
    if name == http::header::HOST {
      continue;
    }
    points.push(InjectionPoint::new(
      InjectionKind::Header,
      canonical_name(name.as_str()),
      String::from_utf8_lossy(value.as_bytes()),
    ));
  }
  for (name, value) in cookie_pairs(request) {
    points.push(InjectionPoint::new(InjectionKind::Cookie, name, value));
  }
  points
}

fn cookie_pairs(request: &Request) -> Vec<(String, String)> {
  request
    .headers()
    .get_all(http::header::COOKIE)
    .iter()
    .flat_map(|v| {
      String::from_utf8_lossy(v.as_bytes())
        .split(';')
        .filter_map(|pair| {
          let (name, value) = pair.trim().split_once('=')?;
          (!name.is_empty()).then(|| (name.to_string(), value.to_string()))
        })
        .collect::<Vec<_>>()
    })
    .collect()
}

/// Re-encodes form pairs with `name` set to `value`, keeping its first position.
fn set_param(encoded: &[u8], name: &str, value: &str) -> String {
  let mut serializer = url::form_urlencoded::Serializer::new(String::new());
  let mut replaced = false;
  for (k, v) in url::form_urlencoded::parse(encoded) {
    if k == name {
      if !replaced {
        serializer.append_pair(name, value);
        replaced = true;
      }
    } else {
      serializer.append_pair(&k, &v);
    }
  }
  if !replaced {
    serializer.append_pair(name, value);
  }
  serializer.finish()
}

/// Copy of `request` with only `point` changed to carry `payload`.
pub fn mutate(request: &Request, point: &InjectionPoint, payload: &str) -> Result<Request> {
  let mut mutated = request.clone();
  let injected = format!("{}{}", point.value, payload);
  match point.kind {
    InjectionKind::Query => {
      let query = set_param(request.uri().query().unwrap_or_default().as_bytes(), &point.name, &injected);
      let mut parts = request.uri().clone().into_parts();
      parts.path_and_query = Some(format!("{}?{}", request.uri().path(), query).parse()?);
      *mutated.uri_mut() = http::Uri::from_parts(parts).map_err(|e| Error::invalid_request(e.to_string()))?;
    }
    InjectionKind::Form => {
      let body = request.body().as_ref().map(|b| b.to_vec()).unwrap_or_default();
      *mutated.body_mut() = Some(set_param(&body, &point.name, &injected).into());
    }
    InjectionKind::Header => {
      let name = HeaderName::from_bytes(point.name.as_bytes())?;
      mutated.headers_mut().insert(name, HeaderValue::from_str(&injected)?);
    }
    InjectionKind::Cookie => {
      if let Some(cookie) = request.headers().get(http::header::COOKIE) {
        let cookie = String::from_utf8_lossy(cookie.as_bytes()).replacen(&point.value, &injected, 1);
        mutated
          .headers_mut()
          .insert(http::header::COOKIE, HeaderValue::from_str(&cookie)?);
      }
    }
  }
  Ok(mutated)
}

/// Probes captured requests for command injection.
#[derive(Clone)]
pub struct Scanner {
  client: Client,
  records: Arc<dyn RecordStore>,
}

impl Scanner {
  /// A scanner sending probes through `client`.
  pub fn new(client: Client, records: Arc<dyn RecordStore>) -> Self {
    Self { client, records }
  }

  /// Tries every payload on `point`; stops at the first response containing the marker.
  pub async fn test_injection(&self, point: &InjectionPoint, request: &Request) -> Result<bool> {
    for payload in PAYLOADS {
      let probe = mutate(request, point, payload)?;
      let response = self.client.execute(&probe).await?;
      if decode_body(&response).contains(MARKER) {
        tracing::info!(kind = %point.kind, name = %point.name, payload, "injection confirmed");
        return Ok(true);
      }
    }
    Ok(false)
  }

  /// Scans record `id`, testing each distinct `(kind, name)` once, in order.
  pub async fn scan_by_id(&self, id: &RecordId) -> Result<ScanReport> {
    let record = self
      .records
      .get_by_id(id)
      .await?
      .ok_or_else(|| Error::NotFound(format!("request {}", id)))?;
    let request = to_outbound_request(&record.request)?;
    let mut checked = HashSet::new();
    let mut report = ScanReport::default();
    for point in scan_request(&request) {
      if !checked.insert((point.kind, point.name.clone())) {
        continue;
      }
      match self.test_injection(&point, &request).await {
        Ok(true) => report.vulnerabilities.push(format!(
          "{} '{}' is vulnerable to command injection",
          point.kind, point.name
        )),
        Ok(false) => {}
        Err(err) => report
          .errors
          .push(format!("{} '{}': {}", point.kind, point.name, err)),
      }
    }
    tracing::info!(
      %id,
      vulnerabilities = report.vulnerabilities.len(),
      errors = report.errors.len(),
      "scan finished"
    );
    Ok(report)
  }
}
