//! Re-sending captured requests.
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue};
use time::OffsetDateTime;

use crate::capture::parse_response;
use crate::errors::{Error, Result};
use crate::record::{CapturedRequest, Params, RecordId};
use crate::store::RecordStore;
use crate::{Client, Request};

/// Client tag of exchanges produced by replay.
pub const REPLAY_CLIENT: &str = "system";

const SKIPPED_HEADERS: [&str; 4] = ["host", "cookie", "content-length", "transfer-encoding"];

/// Encodes parameters as `a=1&b=2&b=3`, every value of a repeated name in order.
pub fn encode_params(params: &Params) -> String {
  let mut serializer = url::form_urlencoded::Serializer::new(String::new());
  for (name, value) in params {
    for v in value.values() {
      serializer.append_pair(name, v);
    }
  }
  serializer.finish()
}

/// Rebuilds an outbound HTTPS request from a captured one.
///
/// The authority comes from the captured `Host` header. `Cookie` is rebuilt from the cookie
/// map and body framing is left to the serializer. An empty raw body with form parameters
/// is sent as a form.
pub fn to_outbound_request(captured: &CapturedRequest) -> Result<Request> {
  let host = captured
    .headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case("host"))
    .map(|(_, v)| v.clone())
    .filter(|h| !h.is_empty())
    .ok_or_else(|| Error::invalid_request("captured request has no Host"))?;
  let mut target = if captured.path.is_empty() {
    "/".to_string()
  } else {
    captured.path.clone()
  };
  if !captured.query.is_empty() {
    target.push('?');
    target.push_str(&encode_params(&captured.query));
  }
  let uri = http::Uri::builder()
    .scheme("https")
    .authority(host.as_str())
    .path_and_query(target)
    .build()?;

  let mut builder = Request::builder().method(captured.method.as_str()).uri(uri);
  if let Some(headers) = builder.headers_mut() {
    for (name, value) in &captured.headers {
      if SKIPPED_HEADERS.iter().any(|s| name.eq_ignore_ascii_case(s)) {
        continue;
      }
      match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        (Ok(name), Ok(value)) => {
          headers.insert(name, value);
        }
        _ => tracing::debug!(header = %name, "skipping unrepresentable header"),
      }
    }
    headers.insert(http::header::HOST, HeaderValue::from_str(&host)?);
    if !captured.cookies.is_empty() {
      let cookie = captured
        .cookies
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("; ");
      headers.insert(http::header::COOKIE, HeaderValue::from_str(&cookie)?);
    }
  }

  let body = if !captured.raw_body.is_empty() {
    captured.raw_body.clone()
  } else {
    match &captured.form {
      Some(form) if !form.is_empty() => {
        if let Some(headers) = builder.headers_mut() {
          headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
          );
        }
        encode_params(form)
      }
      _ => String::new(),
    }
  };
  Ok(builder.body(body)?.into())
}

/// Re-sends stored requests straight to their origin.
#[derive(Clone)]
pub struct Replayer {
  client: Client,
  records: Arc<dyn RecordStore>,
}

impl Replayer {
  /// A replayer executing through `client`.
  pub fn new(client: Client, records: Arc<dyn RecordStore>) -> Self {
    Self { client, records }
  }

  /// Re-sends record `id` and stores the new exchange, returning its id.
  pub async fn repeat_by_id(&self, id: &RecordId) -> Result<RecordId> {
    let original = self
      .records
      .get_by_id(id)
      .await?
      .ok_or_else(|| Error::NotFound(format!("request {}", id)))?;
    let request = to_outbound_request(&original.request)?;
    tracing::info!(%id, uri = %request.uri(), "replaying request");
    let response = self.client.execute(&request).await?;
    let captured_request = CapturedRequest {
      created_at: OffsetDateTime::now_utc(),
      ..original.request
    };
    let captured_response = parse_response(&response, Duration::ZERO);
    let new_id = self
      .records
      .save(captured_request, captured_response, REPLAY_CLIENT)
      .await?;
    tracing::debug!(%id, %new_id, "replay stored");
    Ok(new_id)
  }
}
