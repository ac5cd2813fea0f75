use crate::errors::{new_io_error, Error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

/// Dial settings shared by every origin connection.
///
/// Deadlines default to 10 seconds for the dial and 30 seconds per read or write; `None`
/// removes one.
#[derive(Clone, Debug)]
pub struct ConnectorBuilder {
  insecure: bool,
  nodelay: bool,
  connect_timeout: Option<Duration>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  overrides: HashMap<String, SocketAddr>,
}

impl Default for ConnectorBuilder {
  fn default() -> Self {
    Self {
      insecure: false,
      nodelay: true,
      connect_timeout: Some(Duration::from_secs(10)),
      read_timeout: Some(Duration::from_secs(30)),
      write_timeout: Some(Duration::from_secs(30)),
      overrides: HashMap::new(),
    }
  }
}

impl ConnectorBuilder {
  /// Skip origin certificate verification. Off by default; meant for lab origins with
  /// self-signed certificates.
  pub fn insecure(mut self, insecure: bool) -> ConnectorBuilder {
    self.insecure = insecure;
    self
  }
  /// `TCP_NODELAY` on dialed sockets, on by default.
  pub fn nodelay(mut self, nodelay: bool) -> ConnectorBuilder {
    self.nodelay = nodelay;
    self
  }
  /// Deadline for resolving and dialing.
  pub fn connect_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.connect_timeout = timeout;
    self
  }
  /// Deadline for a single stalled read; progress re-arms it.
  pub fn read_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.read_timeout = timeout;
    self
  }
  /// Deadline for a single stalled write or flush.
  pub fn write_timeout(mut self, timeout: Option<Duration>) -> ConnectorBuilder {
    self.write_timeout = timeout;
    self
  }
  /// Pins `host` to `addr`, skipping DNS and whatever port the caller asked for.
  ///
  /// TLS still verifies and sends SNI for `host`. Names match case-insensitively.
  ///
  /// ```rust
  /// use mitm_recorder::ConnectorBuilder;
  ///
  /// let builder = ConnectorBuilder::default().resolve("example.com", ([127, 0, 0, 1], 8443).into());
  /// assert!(builder.build().is_ok());
  /// ```
  pub fn resolve(mut self, host: impl Into<String>, addr: SocketAddr) -> ConnectorBuilder {
    self.overrides.insert(host.into().to_ascii_lowercase(), addr);
    self
  }
  /// Builds the connector, loading the client TLS configuration once.
  pub fn build(&self) -> Result<Connector> {
    let tls = TlsConnector::from(Arc::new(tls::client_config(self.insecure)?));
    Ok(Connector {
      nodelay: self.nodelay,
      connect_timeout: self.connect_timeout,
      read_timeout: self.read_timeout,
      write_timeout: self.write_timeout,
      overrides: Arc::new(self.overrides.clone()),
      tls,
    })
  }
}

/// Dials origins.
#[derive(Clone)]
pub struct Connector {
  nodelay: bool,
  connect_timeout: Option<Duration>,
  read_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  overrides: Arc<HashMap<String, SocketAddr>>,
  tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .field("overrides", &self.overrides)
      .finish()
  }
}

impl Connector {
  /// Dials `addr` directly.
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| Error::Timeout(format!("connect to {}", addr)))??,
    };
    Ok(Socket::new(
      MaybeTlsStream::Tcp(s),
      self.read_timeout,
      self.write_timeout,
    ))
  }

  /// Resolve `host` and connect to the first address that accepts.
  ///
  /// A pinned address from [`ConnectorBuilder::resolve`] wins over DNS and `port`.
  pub async fn connect_with_host(&self, host: &str, port: u16) -> Result<Socket> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Some(addr) = self.overrides.get(&host.to_ascii_lowercase()) {
      tracing::debug!(host, %addr, "using pinned address");
      return self.connect_with_addr(*addr).await;
    }
    let lookup = tokio::net::lookup_host((host, port));
    let addrs: Vec<SocketAddr> = match self.connect_timeout {
      None => lookup.await?.collect(),
      Some(timeout) => tokio::time::timeout(timeout, lookup)
        .await
        .map_err(|_| Error::Timeout(format!("resolve {}", host)))??
        .collect(),
    };
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => return Ok(socket),
        Err(err) => {
          tracing::debug!(%addr, error = %err, "dial failed");
          last_error = Some(err);
        }
      }
    }
    Err(last_error.unwrap_or_else(|| {
      new_io_error(std::io::ErrorKind::NotFound, &format!("no address for {}", host))
    }))
  }

  /// Connect to the origin named by `target`, wrapping in TLS for `https`.
  ///
  /// The port is the one in the URI, else the scheme's default.
  pub async fn connect_with_uri(&self, target: &http::Uri) -> Result<Socket> {
    let host = target
      .host()
      .ok_or_else(|| Error::connection_error(format!("no host in {}", target)))?;
    let https = target.scheme() == Some(&http::uri::Scheme::HTTPS);
    let port = target.port_u16().unwrap_or(if https { 443 } else { 80 });
    let socket = self.connect_with_host(host, port).await?;
    if https {
      self.upgrade_to_tls(socket, host).await
    } else {
      Ok(socket)
    }
  }

  /// Performs the client handshake on an established connection.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let domain = domain.trim_start_matches('[').trim_end_matches(']');
    let domain = ServerName::try_from(domain.to_owned()).map_err(|e| Error::Other(e.to_string()))?;
    let this = self.tls.clone();
    let tls = stream
      .tls(move |t| async move { this.connect(domain, t).await })
      .await?;
    Ok(tls)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn pinned_host_skips_dns_and_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connector = ConnectorBuilder::default()
      .resolve("Origin.Invalid", addr)
      .build()
      .unwrap();
    let socket = connector.connect_with_host("origin.invalid", 443).await.unwrap();
    assert_eq!(socket.peer_addr().unwrap(), addr);
    listener.accept().await.unwrap();
  }

  #[tokio::test]
  async fn unpinned_host_still_resolves() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connector = ConnectorBuilder::default()
      .resolve("elsewhere.invalid", ([127, 0, 0, 1], 1).into())
      .build()
      .unwrap();
    let socket = connector.connect_with_host("127.0.0.1", addr.port()).await.unwrap();
    assert_eq!(socket.peer_addr().unwrap(), addr);
  }
}
