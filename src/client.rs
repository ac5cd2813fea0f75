use crate::errors::{Error, Result};
use crate::response::ResponseReader;
use crate::{Connector, ConnectorBuilder, Request, Response};
use tokio::io::{AsyncWriteExt, BufReader};

/// Executes single request/response exchanges against origin servers.
///
/// Every exchange dials a fresh connection. Redirects are returned as-is and nothing is
/// retried.
///
/// # Examples
///
/// ```rust,no_run
/// # async fn run() -> mitm_recorder::Result<()> {
/// use mitm_recorder::{Client, Request};
/// let client = Client::builder().build()?;
/// let request: Request = Request::builder()
///   .uri("http://example.com/")
///   .body(())
///   .map_err(mitm_recorder::Error::from)?
///   .into();
/// let response = client.execute(&request).await?;
/// println!("{}", response.status_line());
/// #   Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Client {
  connector: Connector,
}

impl Client {
  /// Wraps an existing connector.
  pub fn new(connector: Connector) -> Client {
    Client { connector }
  }
  /// Creates a `ClientBuilder` to configure a `Client`.
  pub fn builder() -> ClientBuilder {
    ClientBuilder::default()
  }
  /// Sends `request` to the origin named by its URI and reads the whole response.
  ///
  /// The URI must be absolute; `https` targets are reached over TLS.
  pub async fn execute(&self, request: &Request) -> Result<Response> {
    if request.uri().host().is_none() {
      return Err(Error::invalid_request(format!(
        "request target is not absolute: {}",
        request.uri()
      )));
    }
    let mut socket = self.connector.connect_with_uri(request.uri()).await?;
    socket.write_all(&request.to_raw()).await?;
    socket.flush().await?;
    let mut reader = BufReader::new(socket);
    ResponseReader::read(&mut reader, request.method()).await
  }
}

/// A `ClientBuilder` can be used to create a `Client` with custom configuration.
#[derive(Clone, Debug, Default)]
pub struct ClientBuilder {
  connector: ConnectorBuilder,
}

impl ClientBuilder {
  /// Replaces the connector settings.
  pub fn connector(mut self, connector: ConnectorBuilder) -> ClientBuilder {
    self.connector = connector;
    self
  }
  /// Returns a `Client` that uses this `ClientBuilder` configuration.
  pub fn build(self) -> Result<Client> {
    Ok(Client::new(self.connector.build()?))
  }
}
