//! Persistence seams for captured exchanges and minted certificates.
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::errors::Result;
use crate::record::{
  CapturedRequest, CapturedResponse, CertificateRecord, RecordId, RecordMetadata, RequestRecord,
};

/// Stores captured exchanges. Records are append-only.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
  /// Persists an exchange and returns its freshly assigned id.
  async fn save(
    &self,
    request: CapturedRequest,
    response: CapturedResponse,
    client: &str,
  ) -> Result<RecordId>;
  /// Loads one record.
  async fn get_by_id(&self, id: &RecordId) -> Result<Option<RequestRecord>>;
  /// Every record, oldest first.
  async fn list(&self) -> Result<Vec<RequestRecord>>;
}

/// Stores leaf certificates. Several records may exist for one domain.
#[async_trait::async_trait]
pub trait CertificateStore: Send + Sync {
  /// Appends a record.
  async fn insert(&self, record: CertificateRecord) -> Result<()>;
  /// Records for `domain`, oldest first.
  async fn find_by_domain(&self, domain: &str) -> Result<Vec<CertificateRecord>>;
}

/// In-process `RecordStore`.
#[derive(Clone, Default)]
pub struct MemoryRecordStore {
  records: Arc<RwLock<Vec<RequestRecord>>>,
}

impl MemoryRecordStore {
  /// An empty store.
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
  async fn save(
    &self,
    request: CapturedRequest,
    response: CapturedResponse,
    client: &str,
  ) -> Result<RecordId> {
    let id = RecordId::generate();
    let record = RequestRecord {
      id,
      request,
      response,
      metadata: RecordMetadata {
        timestamp: OffsetDateTime::now_utc(),
        client_ip: client.to_string(),
      },
    };
    self.records.write().await.push(record);
    tracing::debug!(%id, client, "record saved");
    Ok(id)
  }

  async fn get_by_id(&self, id: &RecordId) -> Result<Option<RequestRecord>> {
    Ok(self.records.read().await.iter().find(|r| &r.id == id).cloned())
  }

  async fn list(&self) -> Result<Vec<RequestRecord>> {
    Ok(self.records.read().await.clone())
  }
}

/// In-process `CertificateStore`.
#[derive(Clone, Default)]
pub struct MemoryCertificateStore {
  records: Arc<RwLock<Vec<CertificateRecord>>>,
}

impl MemoryCertificateStore {
  /// An empty store.
  pub fn new() -> Self {
    Self::default()
  }
  /// Number of records across all domains.
  pub async fn len(&self) -> usize {
    self.records.read().await.len()
  }
  /// Whether the store holds no records.
  pub async fn is_empty(&self) -> bool {
    self.records.read().await.is_empty()
  }
}

#[async_trait::async_trait]
impl CertificateStore for MemoryCertificateStore {
  async fn insert(&self, record: CertificateRecord) -> Result<()> {
    tracing::debug!(domain = %record.domain, expires_at = %record.expires_at, "certificate stored");
    self.records.write().await.push(record);
    Ok(())
  }

  async fn find_by_domain(&self, domain: &str) -> Result<Vec<CertificateRecord>> {
    Ok(
      self
        .records
        .read()
        .await
        .iter()
        .filter(|r| r.domain == domain)
        .cloned()
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;
  use std::time::Duration;

  fn captured() -> (CapturedRequest, CapturedResponse) {
    let request = CapturedRequest {
      method: "GET".into(),
      path: "/".into(),
      query: Default::default(),
      headers: BTreeMap::from([("Host".to_string(), "example.com".to_string())]),
      cookies: Default::default(),
      form: None,
      raw_body: String::new(),
      created_at: OffsetDateTime::now_utc(),
    };
    let response = CapturedResponse {
      code: 200,
      message: "200 OK".into(),
      headers: Default::default(),
      body: "ok".into(),
      elapsed: Duration::from_millis(1),
    };
    (request, response)
  }

  #[tokio::test]
  async fn save_then_get_round_trips() {
    let store = MemoryRecordStore::new();
    let (request, response) = captured();
    let id = store
      .save(request.clone(), response.clone(), "127.0.0.1")
      .await
      .unwrap();
    let record = store.get_by_id(&id).await.unwrap().unwrap();
    assert_eq!(record.id, id);
    assert_eq!(record.request, request);
    assert_eq!(record.response, response);
    assert_eq!(record.metadata.client_ip, "127.0.0.1");
  }

  #[tokio::test]
  async fn list_keeps_insertion_order_and_unknown_id_is_none() {
    let store = MemoryRecordStore::new();
    let (request, response) = captured();
    let first = store.save(request.clone(), response.clone(), "a").await.unwrap();
    let second = store.save(request, response, "b").await.unwrap();
    assert_ne!(first, second);
    let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![first, second]);
    assert!(store.get_by_id(&RecordId::generate()).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn certificates_filtered_by_domain() {
    let store = MemoryCertificateStore::new();
    for domain in ["a.test", "b.test", "a.test"] {
      store
        .insert(CertificateRecord {
          domain: domain.into(),
          cert_pem: String::new(),
          key_pem: String::new(),
          created_at: OffsetDateTime::now_utc(),
          expires_at: OffsetDateTime::now_utc(),
        })
        .await
        .unwrap();
    }
    assert_eq!(store.find_by_domain("a.test").await.unwrap().len(), 2);
    assert_eq!(store.find_by_domain("c.test").await.unwrap().len(), 0);
    assert_eq!(store.len().await, 3);
  }
}
