//! JSON management API over the record store, replay and scanner.
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::errors::{Error, Result};
use crate::record::RecordId;
use crate::replay::Replayer;
use crate::scanner::Scanner;
use crate::store::RecordStore;

/// Everything the handlers reach.
#[derive(Clone)]
pub struct ApiState {
  records: Arc<dyn RecordStore>,
  replayer: Replayer,
  scanner: Scanner,
}

impl ApiState {
  /// Bundles the API collaborators.
  pub fn new(records: Arc<dyn RecordStore>, replayer: Replayer, scanner: Scanner) -> Self {
    Self {
      records,
      replayer,
      scanner,
    }
  }
}

/// Every management route.
pub fn routes(state: ApiState) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
  let list = warp::path!("requests")
    .and(warp::get())
    .and(with_state(state.clone()))
    .and_then(list_requests);

  let get = warp::path!("requests" / String)
    .and(warp::get())
    .and(with_state(state.clone()))
    .and_then(get_request);

  let repeat = warp::path!("repeat" / String)
    .and(warp::get())
    .and(with_state(state.clone()))
    .and_then(repeat_request);

  let scan = warp::path!("scan" / String)
    .and(warp::get())
    .and(with_state(state))
    .and_then(scan_request);

  list.or(get).unify().or(repeat).unify().or(scan).unify()
}

fn with_state(
  state: ApiState,
) -> impl Filter<Extract = (ApiState,), Error = std::convert::Infallible> + Clone {
  warp::any().map(move || state.clone())
}

fn error_reply(status: StatusCode, message: impl std::fmt::Display) -> Response {
  warp::reply::with_status(
    warp::reply::json(&serde_json::json!({ "error": message.to_string() })),
    status,
  )
  .into_response()
}

fn status_of(error: &Error) -> StatusCode {
  match error {
    Error::NotFound(_) => StatusCode::NOT_FOUND,
    Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
    Error::IO(_)
    | Error::Tls(_)
    | Error::Connection(_)
    | Error::Timeout(_)
    | Error::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
    _ => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

fn failure(error: Error) -> Response {
  let status = status_of(&error);
  if status.is_server_error() {
    tracing::warn!(error = %error, status = status.as_u16(), "management request failed");
  }
  error_reply(status, error)
}

fn parse_id(raw: &str) -> std::result::Result<RecordId, Response> {
  raw
    .parse::<RecordId>()
    .map_err(|_| error_reply(StatusCode::BAD_REQUEST, format!("invalid request id '{}'", raw)))
}

async fn list_requests(state: ApiState) -> std::result::Result<Response, Rejection> {
  Ok(match state.records.list().await {
    Ok(records) => warp::reply::json(&records).into_response(),
    Err(err) => failure(err),
  })
}

async fn get_request(id: String, state: ApiState) -> std::result::Result<Response, Rejection> {
  let id = match parse_id(&id) {
    Ok(id) => id,
    Err(reply) => return Ok(reply),
  };
  Ok(match state.records.get_by_id(&id).await {
    Ok(Some(record)) => warp::reply::json(&record).into_response(),
    Ok(None) => error_reply(StatusCode::NOT_FOUND, format!("request {} not found", id)),
    Err(err) => failure(err),
  })
}

async fn repeat_request(id: String, state: ApiState) -> std::result::Result<Response, Rejection> {
  let id = match parse_id(&id) {
    Ok(id) => id,
    Err(reply) => return Ok(reply),
  };
  Ok(match state.replayer.repeat_by_id(&id).await {
    Ok(new_id) => warp::reply::with_header(
      warp::reply::with_status(warp::reply(), StatusCode::SEE_OTHER),
      "location",
      format!("/requests/{}", new_id),
    )
    .into_response(),
    Err(err) => failure(err),
  })
}

async fn scan_request(id: String, state: ApiState) -> std::result::Result<Response, Rejection> {
  let id = match parse_id(&id) {
    Ok(id) => id,
    Err(reply) => return Ok(reply),
  };
  Ok(match state.scanner.scan_by_id(&id).await {
    Ok(report) => warp::reply::json(&report).into_response(),
    Err(err) => failure(err),
  })
}

/// Binds the API and returns its address with the serving future, which resolves once
/// `shutdown` turns true and in-flight requests are answered.
pub fn bind(
  addr: SocketAddr,
  state: ApiState,
  mut shutdown: watch::Receiver<bool>,
) -> Result<(SocketAddr, impl Future<Output = ()>)> {
  let (addr, server) = warp::serve(routes(state))
    .try_bind_with_graceful_shutdown(addr, async move {
      while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
          break;
        }
      }
    })
    .map_err(|e| Error::Config(format!("failed to bind API listener: {}", e)))?;
  tracing::info!(%addr, "management API listening");
  Ok((addr, server))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{CapturedRequest, CapturedResponse, RequestRecord};
  use crate::store::MemoryRecordStore;
  use crate::Client;
  use std::collections::BTreeMap;
  use std::time::Duration;
  use time::OffsetDateTime;

  async fn state_with_record() -> (ApiState, RecordId) {
    let store = Arc::new(MemoryRecordStore::new());
    let request = CapturedRequest {
      method: "GET".into(),
      path: "/".into(),
      query: BTreeMap::new(),
      headers: BTreeMap::from([("Host".to_string(), "127.0.0.1:1".to_string())]),
      cookies: BTreeMap::new(),
      form: None,
      raw_body: String::new(),
      created_at: OffsetDateTime::now_utc(),
    };
    let response = CapturedResponse {
      code: 200,
      message: "200 OK".into(),
      headers: BTreeMap::new(),
      body: "hello".into(),
      elapsed: Duration::from_millis(5),
    };
    let id = store.save(request, response, "127.0.0.1").await.unwrap();
    let client = Client::builder().build().unwrap();
    let state = ApiState::new(
      store.clone(),
      Replayer::new(client.clone(), store.clone()),
      Scanner::new(client, store),
    );
    (state, id)
  }

  #[tokio::test]
  async fn lists_and_fetches_records() {
    let (state, id) = state_with_record().await;
    let api = routes(state);

    let res = warp::test::request().path("/requests").reply(&api).await;
    assert_eq!(res.status(), StatusCode::OK);
    let list: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);

    let res = warp::test::request()
      .path(&format!("/requests/{}", id))
      .reply(&api)
      .await;
    assert_eq!(res.status(), StatusCode::OK);
    let record: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(record["id"], id.to_string());
    assert_eq!(record["response"]["body"], "hello");
  }

  #[tokio::test]
  async fn rejects_bad_and_unknown_ids() {
    let (state, _) = state_with_record().await;
    let api = routes(state);

    let res = warp::test::request().path("/requests/nothex").reply(&api).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let unknown = RecordId::generate();
    let res = warp::test::request()
      .path(&format!("/requests/{}", unknown))
      .reply(&api)
      .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert!(body["error"].is_string());

    let res = warp::test::request()
      .path(&format!("/scan/{}", unknown))
      .reply(&api)
      .await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
  }

  struct UnavailableStore;

  #[async_trait::async_trait]
  impl RecordStore for UnavailableStore {
    async fn save(&self, _: CapturedRequest, _: CapturedResponse, _: &str) -> Result<RecordId> {
      Err(Error::store_error("database offline"))
    }
    async fn get_by_id(&self, _: &RecordId) -> Result<Option<RequestRecord>> {
      Err(Error::store_error("database offline"))
    }
    async fn list(&self) -> Result<Vec<RequestRecord>> {
      Err(Error::store_error("database offline"))
    }
  }

  #[tokio::test]
  async fn store_failures_are_internal_errors() {
    let store: Arc<dyn RecordStore> = Arc::new(UnavailableStore);
    let client = Client::builder().build().unwrap();
    let api = routes(ApiState::new(
      store.clone(),
      Replayer::new(client.clone(), store.clone()),
      Scanner::new(client, store),
    ));

    let res = warp::test::request().path("/requests").reply(&api).await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
    assert_eq!(body["error"], "store error: database offline");

    let res = warp::test::request()
      .path(&format!("/requests/{}", RecordId::generate()))
      .reply(&api)
      .await;
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
  }

  #[tokio::test]
  async fn replay_of_unreachable_origin_is_bad_gateway() {
    let (state, id) = state_with_record().await;
    let api = routes(state);
    let res = warp::test::request()
      .path(&format!("/repeat/{}", id))
      .reply(&api)
      .await;
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
  }
}
