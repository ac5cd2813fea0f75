//! Proxy listener, connection dispatch and CONNECT interception.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

use crate::errors::{Error, Result};
use crate::forwarder::{ForwardMode, Forwarder};
use crate::issuer::CertificateIssuer;
use crate::request::RequestReader;

/// Bytes answering a `CONNECT` before the TLS handshake.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// State shared by every connection handler.
#[derive(Clone)]
pub struct ProxyHandler {
  forwarder: Forwarder,
  issuer: Arc<CertificateIssuer>,
}

impl ProxyHandler {
  /// Handler relaying through `forwarder` and minting tunnel certificates with `issuer`.
  pub fn new(forwarder: Forwarder, issuer: Arc<CertificateIssuer>) -> Self {
    Self { forwarder, issuer }
  }

  /// Serves one client connection until it is done. Never fails; problems are logged.
  pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
    let client_ip = peer.ip().to_string();
    let mut reader = BufReader::new(stream);
    let request = match RequestReader::read(&mut reader).await {
      Ok(Some(request)) => request,
      Ok(None) => {
        tracing::debug!(%peer, "connection closed before a request");
        return;
      }
      Err(err) => {
        tracing::warn!(%peer, error = %err, "malformed leading request");
        return;
      }
    };
    if request.is_connect() {
      let Some(host) = request.uri().host().map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string()) else {
        tracing::warn!(%peer, target = %request.uri(), "CONNECT without host");
        return;
      };
      // the reader may already hold the start of the client handshake
      self.handle_connect(reader, &host, &client_ip).await;
    } else {
      let mut stream = reader.into_inner();
      let _ = self
        .forwarder
        .forward(request, &ForwardMode::Plain, &client_ip, &mut stream)
        .await;
      let _ = stream.shutdown().await;
    }
  }

  /// Acknowledges the tunnel, terminates TLS with a leaf for `host` and relays every
  /// request inside it in order.
  pub async fn handle_connect<S>(&self, mut stream: S, host: &str, client_ip: &str)
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    if let Err(err) = write_established(&mut stream).await {
      tracing::debug!(peer = client_ip, error = %err, "failed to acknowledge CONNECT");
      return;
    }
    let issued = match self.issuer.get_certificate(host).await {
      Ok(issued) => issued,
      Err(err) => {
        tracing::error!(peer = client_ip, domain = host, error = %err, "[MITM] no certificate for tunnel");
        return;
      }
    };
    let acceptor = match issued.server_config() {
      Ok(config) => TlsAcceptor::from(Arc::new(config)),
      Err(err) => {
        tracing::error!(peer = client_ip, domain = host, error = %err, "[MITM] unusable certificate");
        return;
      }
    };
    let tls_stream = match acceptor.accept(stream).await {
      Ok(tls_stream) => tls_stream,
      Err(err) => {
        tracing::warn!(peer = client_ip, domain = host, error = %err, "[MITM] TLS handshake failed");
        return;
      }
    };
    tracing::debug!(peer = client_ip, domain = host, "[MITM] tunnel established");
    let mode = ForwardMode::Tls {
      host: host.to_string(),
    };
    let (read_half, mut write_half) = tokio::io::split(tls_stream);
    let mut reader = BufReader::new(read_half);
    loop {
      let request = match RequestReader::read(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => break,
        Err(err) => {
          tracing::debug!(peer = client_ip, domain = host, error = %err, "tunnel read ended");
          break;
        }
      };
      if self
        .forwarder
        .forward(request, &mode, client_ip, &mut write_half)
        .await
        .is_err()
      {
        break;
      }
    }
    let _ = write_half.shutdown().await;
  }
}

async fn write_established<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
  stream.write_all(CONNECT_ESTABLISHED).await?;
  stream.flush().await?;
  Ok(())
}

/// Accepts proxy clients and spawns a handler per connection.
pub struct ProxyServer {
  listener: TcpListener,
  handler: ProxyHandler,
}

impl ProxyServer {
  /// Binds the proxy listener.
  pub async fn bind(addr: impl ToSocketAddrs, handler: ProxyHandler) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::Config(format!("failed to bind proxy listener: {}", e)))?;
    Ok(Self { listener, handler })
  }

  /// Address the listener is bound to.
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Accepts until `shutdown` turns true, then waits for every running handler.
  pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let ProxyServer { listener, handler } = self;
    tracing::info!(addr = %listener.local_addr()?, "[MITM] proxy listening");
    let mut handlers = JoinSet::new();
    while !*shutdown.borrow_and_update() {
      tokio::select! {
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let handler = handler.clone();
            handlers.spawn(async move { handler.handle_connection(stream, peer).await });
          }
          Err(err) => tracing::warn!(error = %err, "accept failed"),
        },
        changed = shutdown.changed() => {
          if changed.is_err() {
            break;
          }
        }
        Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
          if let Err(err) = joined {
            tracing::warn!(error = %err, "connection handler aborted");
          }
        }
      }
    }
    drop(listener);
    tracing::info!(in_flight = handlers.len(), "[MITM] proxy stopping, draining connections");
    while let Some(joined) = handlers.join_next().await {
      if let Err(err) = joined {
        tracing::warn!(error = %err, "connection handler aborted");
      }
    }
    tracing::info!("[MITM] proxy stopped");
    Ok(())
  }
}
