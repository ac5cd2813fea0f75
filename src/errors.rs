//! engine error
use std::io::ErrorKind;
use std::num::ParseIntError;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `mitm_recorder::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while proxying, capturing, replaying or scanning.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// The peer sent something that is not an HTTP/1.x request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// The origin sent something that is not an HTTP/1.x response
  #[error("invalid response: {0}")]
  InvalidResponse(String),
  /// Dialing or relaying to the origin failed
  #[error("connection error: {0}")]
  Connection(String),
  /// A configured deadline elapsed
  #[error("timed out: {0}")]
  Timeout(String),
  /// No usable leaf certificate could be obtained for the domain
  #[error("certificate unavailable for {domain}: {reason}")]
  CertificateUnavailable {
    /// domain the certificate was requested for
    domain: String,
    /// what went wrong
    reason: String,
  },
  /// The CA signer failed
  #[error("signer error: {0}")]
  Signer(String),
  /// Record lookup missed
  #[error("not found: {0}")]
  NotFound(String),
  /// Store backend failure, raised by external `RecordStore`/`CertificateStore`
  /// implementations
  #[error("store error: {0}")]
  Store(String),
  /// Configuration could not be loaded or is inconsistent
  #[error("config error: {0}")]
  Config(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_unavailable(domain: impl Into<String>, reason: impl ToString) -> Self {
    let error = Error::CertificateUnavailable {
      domain: domain.into(),
      reason: reason.to_string(),
    };
    tracing::debug!("Certificate error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("Invalid request: {}", error);
    error
  }

  /// Create an invalid response error and log it
  pub fn invalid_response(msg: impl Into<String>) -> Self {
    let error = Error::InvalidResponse(msg.into());
    tracing::debug!("Invalid response: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::debug!("Connection error: {}", error);
    error
  }

  /// Create a signer error and log it
  pub fn signer_error(msg: impl Into<String>) -> Self {
    let error = Error::Signer(msg.into());
    tracing::debug!("Signer error: {}", error);
    error
  }

  /// Create a store error and log it. For external `RecordStore`/`CertificateStore`
  /// implementations; the in-memory stores never fail.
  pub fn store_error(msg: impl Into<String>) -> Self {
    let error = Error::Store(msg.into());
    tracing::debug!("Store error: {}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::method::InvalidMethod> for Error {
  fn from(value: http::method::InvalidMethod) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  fn from(value: tokio::time::error::Elapsed) -> Self {
    Error::Timeout(value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

pub(crate) fn builder<E: Into<Box<dyn std::error::Error + Send + Sync>>>(e: E) -> Error {
  Error::Other(e.into().to_string())
}
