//! Captured exchanges and certificate records.
//!
//! Everything here is plain data: immutable once built, serializable for the stores and the
//! management API.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::errors::{Error, Result};

/// Identifier of a stored exchange: 12 bytes rendered as 24 lowercase hex characters.
///
/// Layout follows the usual object-id scheme: 4 bytes of big-endian seconds, 5 bytes fixed
/// per process, 3 bytes of a wrapping counter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId([u8; 12]);

static PROCESS_UNIQUE: OnceLock<[u8; 5]> = OnceLock::new();
static COUNTER: OnceLock<AtomicU32> = OnceLock::new();

impl RecordId {
  /// Mints a fresh identifier.
  pub fn generate() -> RecordId {
    let seconds = OffsetDateTime::now_utc().unix_timestamp() as u32;
    let process = PROCESS_UNIQUE.get_or_init(|| rand::thread_rng().gen());
    let counter = COUNTER
      .get_or_init(|| AtomicU32::new(rand::thread_rng().gen_range(0..0x00ff_ffff)))
      .fetch_add(1, Ordering::Relaxed);
    let mut bytes = [0u8; 12];
    bytes[..4].copy_from_slice(&seconds.to_be_bytes());
    bytes[4..9].copy_from_slice(process);
    bytes[9..].copy_from_slice(&counter.to_be_bytes()[1..]);
    RecordId(bytes)
  }
  /// Raw bytes.
  pub fn bytes(&self) -> [u8; 12] {
    self.0
  }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in self.0 {
      write!(f, "{:02x}", b)?;
    }
    Ok(())
  }
}

impl fmt::Debug for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "RecordId({})", self)
  }
}

impl FromStr for RecordId {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
      return Err(Error::invalid_request(format!("invalid record id: {}", s)));
    }
    let mut bytes = [0u8; 12];
    for (i, byte) in bytes.iter_mut().enumerate() {
      *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)?;
    }
    Ok(RecordId(bytes))
  }
}

impl Serialize for RecordId {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

impl<'de> Deserialize<'de> for RecordId {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(serde::de::Error::custom)
  }
}

/// Value of a query or form parameter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
  /// The name appeared once.
  Single(String),
  /// The name appeared several times; values in order of appearance.
  Multi(Vec<String>),
}

impl ParamValue {
  /// Every value, in order.
  pub fn values(&self) -> Vec<&str> {
    match self {
      ParamValue::Single(v) => vec![v.as_str()],
      ParamValue::Multi(vs) => vs.iter().map(|v| v.as_str()).collect(),
    }
  }
  /// Adds another occurrence, promoting `Single` to `Multi`.
  pub(crate) fn push(&mut self, value: String) {
    match self {
      ParamValue::Single(first) => {
        *self = ParamValue::Multi(vec![std::mem::take(first), value]);
      }
      ParamValue::Multi(vs) => vs.push(value),
    }
  }
}

/// Parameter map keyed by name.
pub type Params = BTreeMap<String, ParamValue>;

/// Canonical view of a client request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapturedRequest {
  /// request method
  pub method: String,
  /// path without query
  pub path: String,
  /// query string parameters
  #[serde(rename = "get_params")]
  pub query: Params,
  /// first value per canonical header name
  pub headers: BTreeMap<String, String>,
  /// cookies from the `Cookie` header
  pub cookies: BTreeMap<String, String>,
  /// form body parameters, only for form-encoded POST/PUT
  #[serde(rename = "post_params")]
  pub form: Option<Params>,
  /// body as received, lossy UTF-8
  pub raw_body: String,
  /// capture time
  #[serde(with = "time::serde::rfc3339")]
  pub created_at: OffsetDateTime,
}

/// Canonical view of an origin response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapturedResponse {
  /// status code
  pub code: u16,
  /// status line, e.g. `200 OK`
  pub message: String,
  /// first value per canonical header name
  pub headers: BTreeMap<String, String>,
  /// decoded body text
  pub body: String,
  /// time from writing the request to reading the last response byte
  #[serde(rename = "duration", with = "duration_nanos")]
  pub elapsed: Duration,
}

/// Where an exchange came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
  /// time the record was stored
  #[serde(with = "time::serde::rfc3339")]
  pub timestamp: OffsetDateTime,
  /// client address, or an origin tag such as `system`
  pub client_ip: String,
}

/// A stored exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
  /// store-assigned id
  pub id: RecordId,
  /// captured request
  pub request: CapturedRequest,
  /// captured response
  pub response: CapturedResponse,
  /// capture metadata
  pub metadata: RecordMetadata,
}

/// A leaf certificate minted for one domain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
  /// domain the leaf was minted for
  pub domain: String,
  /// certificate, PEM
  pub cert_pem: String,
  /// private key, PEM
  pub key_pem: String,
  /// insertion time
  #[serde(with = "time::serde::rfc3339")]
  pub created_at: OffsetDateTime,
  /// the certificate's `notAfter`
  #[serde(with = "time::serde::rfc3339")]
  pub expires_at: OffsetDateTime,
}

mod duration_nanos {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(d.as_nanos().min(u64::MAX as u128) as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_nanos(u64::deserialize(deserializer)?))
  }
}
