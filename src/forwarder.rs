//! Relays one exchange to the origin and records it.
use std::sync::Arc;
use std::time::Instant;

use http::uri::{Authority, Scheme};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::capture::{parse_request, parse_response};
use crate::errors::{Error, Result};
use crate::store::RecordStore;
use crate::{Client, Request};

/// How the origin of a request is reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ForwardMode {
  /// Plain HTTP to the host and port of the request target (port 80 when absent).
  Plain,
  /// HTTPS to the tunnel host on port 443.
  Tls {
    /// host named by the `CONNECT` request, without port
    host: String,
  },
}

/// Sends requests upstream, times them, captures them and relays the response.
#[derive(Clone)]
pub struct Forwarder {
  client: Client,
  records: Arc<dyn RecordStore>,
}

impl Forwarder {
  /// A forwarder dialing through `client` and saving into `records`.
  pub fn new(client: Client, records: Arc<dyn RecordStore>) -> Self {
    Self { client, records }
  }

  /// Forwards `request` and writes the origin's response to `writer`.
  ///
  /// Nothing is written to `writer` when the origin cannot be reached or answers with
  /// something unreadable. Failing to save the capture does not fail the exchange.
  pub async fn forward<W>(
    &self,
    mut request: Request,
    mode: &ForwardMode,
    client_ip: &str,
    writer: &mut W,
  ) -> Result<()>
  where
    W: AsyncWrite + Unpin,
  {
    request.headers_mut().remove("proxy-connection");
    *request.uri_mut() = upstream_uri(&request, mode)?;
    tracing::debug!(peer = client_ip, method = %request.method(), uri = %request.uri(), "forwarding");

    let start = Instant::now();
    let response = match self.client.execute(&request).await {
      Ok(response) => response,
      Err(err) => {
        tracing::error!(peer = client_ip, uri = %request.uri(), error = %err, "upstream exchange failed");
        return Err(err);
      }
    };
    let elapsed = start.elapsed();

    let captured_request = parse_request(&request);
    let captured_response = parse_response(&response, elapsed);
    match self
      .records
      .save(captured_request, captured_response, client_ip)
      .await
    {
      Ok(id) => tracing::debug!(%id, status = response.status_code().as_u16(), ?elapsed, "exchange captured"),
      Err(err) => tracing::warn!(peer = client_ip, error = %err, "failed to save exchange"),
    }

    writer.write_all(&response.to_raw()).await?;
    writer.flush().await?;
    Ok(())
  }
}

/// Absolute URI the request is sent to.
fn upstream_uri(request: &Request, mode: &ForwardMode) -> Result<http::Uri> {
  let (scheme, authority) = match mode {
    ForwardMode::Plain => {
      let authority = match request.uri().authority() {
        Some(authority) => authority.clone(),
        None => request
          .headers()
          .get(http::header::HOST)
          .and_then(|h| h.to_str().ok())
          .and_then(|h| h.parse::<Authority>().ok())
          .ok_or_else(|| Error::invalid_request("request target names no host"))?,
      };
      (Scheme::HTTP, authority)
    }
    ForwardMode::Tls { host } => (Scheme::HTTPS, tunnel_authority(host)?),
  };
  let uri = http::Uri::builder()
    .scheme(scheme)
    .authority(authority)
    .path_and_query(request.origin_form())
    .build()?;
  Ok(uri)
}

fn tunnel_authority(host: &str) -> Result<Authority> {
  let authority = if host.contains(':') && !host.starts_with('[') {
    format!("[{}]:443", host)
  } else {
    format!("{}:443", host)
  };
  Ok(authority.parse::<Authority>()?)
}
