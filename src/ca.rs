//! Leaf certificate signing.
//!
//! The CA itself is fixed: it is loaded from PEM, or lives behind an external program, and
//! is never generated or rotated here.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, KeyUsagePurpose, SanType};
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::process::Command;

use crate::errors::{Error, Result};

/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

/// Signs a leaf certificate for a domain.
#[async_trait::async_trait]
pub trait CaSigner: Send + Sync {
  /// Returns the PEM certificate for `domain` carrying `serial`.
  async fn sign(&self, domain: &str, serial: u64) -> Result<String>;
}

/// Runs `program [args..] <domain> <serial>` and takes stdout as the PEM certificate.
#[derive(Clone, Debug)]
pub struct CommandSigner {
  program: PathBuf,
  args: Vec<String>,
}

impl CommandSigner {
  /// A signer backed by `program`, with `args` placed before domain and serial.
  pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
    Self {
      program: program.into(),
      args,
    }
  }
}

#[async_trait::async_trait]
impl CaSigner for CommandSigner {
  async fn sign(&self, domain: &str, serial: u64) -> Result<String> {
    let output = Command::new(&self.program)
      .args(&self.args)
      .arg(domain)
      .arg(serial.to_string())
      .kill_on_drop(true)
      .output()
      .await
      .map_err(|e| Error::signer_error(format!("failed to run {}: {}", self.program.display(), e)))?;
    if !output.status.success() {
      return Err(Error::signer_error(format!(
        "{} exited with {}: {}",
        self.program.display(),
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
      )));
    }
    let pem = String::from_utf8(output.stdout)
      .map_err(|_| Error::signer_error("signer output is not UTF-8"))?;
    if pem.trim().is_empty() {
      return Err(Error::signer_error("signer produced no certificate"));
    }
    Ok(pem)
  }
}

/// Signs in-process with a fixed CA and the fixed leaf key.
pub struct LocalSigner {
  issuer: Issuer<'static, KeyPair>,
  leaf_key: KeyPair,
  validity: Duration,
}

impl LocalSigner {
  /// Builds a signer from PEM material.
  pub fn new(ca_cert_pem: &str, ca_key_pem: &str, leaf_key_pem: &str, validity_days: i64) -> Result<Self> {
    let key_pair = KeyPair::from_pem(ca_key_pem)
      .map_err(|e| Error::signer_error(format!("Failed to parse CA key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, key_pair)
      .map_err(|e| Error::signer_error(format!("Failed to create issuer from CA cert: {}", e)))?;
    let leaf_key = KeyPair::from_pem(leaf_key_pem)
      .map_err(|e| Error::signer_error(format!("Failed to parse leaf key: {}", e)))?;
    Ok(Self {
      issuer,
      leaf_key,
      validity: Duration::days(validity_days),
    })
  }

  /// Loads CA certificate, CA key and leaf key from disk.
  pub async fn from_files(
    ca_cert_path: impl AsRef<Path>,
    ca_key_path: impl AsRef<Path>,
    leaf_key_path: impl AsRef<Path>,
    validity_days: i64,
  ) -> Result<Self> {
    let ca_cert_pem = fs::read_to_string(ca_cert_path.as_ref()).await?;
    let ca_key_pem = fs::read_to_string(ca_key_path.as_ref()).await?;
    let leaf_key_pem = fs::read_to_string(leaf_key_path.as_ref()).await?;
    Self::new(&ca_cert_pem, &ca_key_pem, &leaf_key_pem, validity_days)
  }
}

#[async_trait::async_trait]
impl CaSigner for LocalSigner {
  async fn sign(&self, domain: &str, serial: u64) -> Result<String> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(serial.into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = domain.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(domain.try_into().map_err(|_| {
        Error::signer_error(format!("Invalid domain name: {}", domain))
      })?)]
    };
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + self.validity;

    let cert = params
      .signed_by(&self.leaf_key, &self.issuer)
      .map_err(|e| Error::signer_error(format!("Failed to sign server cert: {}", e)))?;
    Ok(cert.pem())
  }
}
