//! Per-domain leaf certificates for intercepted tunnels.
//!
//! A stored certificate is reused while it has more than a day of validity left; otherwise
//! a new one is signed, paired with the fixed leaf key and stored.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

use crate::ca::CaSigner;
use crate::errors::{Error, Result};
use crate::record::CertificateRecord;
use crate::store::CertificateStore;
use crate::tls;

/// Remaining validity a stored certificate needs to be reused.
pub const REUSE_MARGIN: Duration = Duration::hours(24);

/// A certificate record together with its parsed TLS material.
pub struct IssuedCertificate {
  record: CertificateRecord,
  certs: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
}

impl IssuedCertificate {
  /// Parses the PEM material of `record`.
  pub fn from_record(record: CertificateRecord) -> Result<Self> {
    let certs = tls::certs_from_pem(record.cert_pem.as_bytes())?;
    let key = tls::key_from_pem(record.key_pem.as_bytes())?;
    Ok(Self { record, certs, key })
  }
  /// The stored record.
  pub fn record(&self) -> &CertificateRecord {
    &self.record
  }
  /// A server configuration presenting exactly this certificate.
  pub fn server_config(&self) -> Result<ServerConfig> {
    tls::server_config(self.certs.clone(), self.key.clone_key())
  }
}

impl std::fmt::Debug for IssuedCertificate {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IssuedCertificate")
      .field("domain", &self.record.domain)
      .field("expires_at", &self.record.expires_at)
      .finish()
  }
}

/// Reads `notAfter` from a PEM certificate.
pub fn certificate_expiry(cert_pem: &str) -> Result<OffsetDateTime> {
  let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
    .map_err(|e| Error::Other(format!("invalid certificate PEM: {}", e)))?;
  let cert = pem
    .parse_x509()
    .map_err(|e| Error::Other(format!("invalid certificate: {}", e)))?;
  OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
    .map_err(|e| Error::Other(format!("invalid notAfter: {}", e)))
}

/// Obtains or mints leaf certificates.
pub struct CertificateIssuer {
  store: Arc<dyn CertificateStore>,
  signer: Arc<dyn CaSigner>,
  leaf_key_path: PathBuf,
  last_serial: AtomicU64,
}

impl CertificateIssuer {
  /// `leaf_key_path` holds the fixed private key every leaf is issued for.
  pub fn new(
    store: Arc<dyn CertificateStore>,
    signer: Arc<dyn CaSigner>,
    leaf_key_path: impl Into<PathBuf>,
  ) -> Self {
    Self {
      store,
      signer,
      leaf_key_path: leaf_key_path.into(),
      last_serial: AtomicU64::new(0),
    }
  }

  /// Returns a usable certificate for `domain`, reusing a stored one when possible.
  ///
  /// Every failure is reported as [`Error::CertificateUnavailable`].
  pub async fn get_certificate(&self, domain: &str) -> Result<IssuedCertificate> {
    match self.reuse(domain).await {
      Ok(Some(issued)) => {
        tracing::debug!(domain, "reusing stored certificate");
        return Ok(issued);
      }
      Ok(None) => {}
      Err(err) => return Err(Error::certificate_unavailable(domain, err)),
    }
    self
      .mint(domain)
      .await
      .map_err(|err| Error::certificate_unavailable(domain, err))
  }

  async fn reuse(&self, domain: &str) -> Result<Option<IssuedCertificate>> {
    let threshold = OffsetDateTime::now_utc() + REUSE_MARGIN;
    let newest = self
      .store
      .find_by_domain(domain)
      .await?
      .into_iter()
      .filter(|r| r.expires_at > threshold)
      .max_by_key(|r| r.created_at);
    let Some(record) = newest else {
      return Ok(None);
    };
    match IssuedCertificate::from_record(record) {
      Ok(issued) => Ok(Some(issued)),
      Err(err) => {
        tracing::warn!(domain, error = %err, "stored certificate unusable, minting a new one");
        Ok(None)
      }
    }
  }

  async fn mint(&self, domain: &str) -> Result<IssuedCertificate> {
    let serial = self.next_serial();
    let cert_pem = self.signer.sign(domain, serial).await?;
    let key_pem = tokio::fs::read_to_string(&self.leaf_key_path)
      .await
      .map_err(|e| Error::Other(format!("failed to read {}: {}", self.leaf_key_path.display(), e)))?;
    let expires_at = certificate_expiry(&cert_pem)?;
    let record = CertificateRecord {
      domain: domain.to_string(),
      cert_pem,
      key_pem,
      created_at: OffsetDateTime::now_utc(),
      expires_at,
    };
    let issued = IssuedCertificate::from_record(record)?;
    // certificate and key must belong together
    issued.server_config()?;
    self.store.insert(issued.record.clone()).await?;
    tracing::info!(domain, serial, expires_at = %issued.record.expires_at, "[MITM] minted certificate");
    Ok(issued)
  }

  /// Current time in nanoseconds, bumped so no two calls share a serial.
  fn next_serial(&self) -> u64 {
    let now = OffsetDateTime::now_utc().unix_timestamp_nanos().max(0) as u64;
    let mut previous = self.last_serial.load(Ordering::Relaxed);
    loop {
      let next = now.max(previous + 1);
      match self
        .last_serial
        .compare_exchange_weak(previous, next, Ordering::Relaxed, Ordering::Relaxed)
      {
        Ok(_) => return next,
        Err(actual) => previous = actual,
      }
    }
  }
}
