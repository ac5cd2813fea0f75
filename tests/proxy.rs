mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mitm_recorder::ca::CommandSigner;
use mitm_recorder::forwarder::Forwarder;
use mitm_recorder::issuer::CertificateIssuer;
use mitm_recorder::record::ParamValue;
use mitm_recorder::server::{ProxyHandler, ProxyServer, CONNECT_ESTABLISHED};
use mitm_recorder::store::{MemoryCertificateStore, MemoryRecordStore, RecordStore};
use mitm_recorder::{tls, Client, ConnectorBuilder, Method, Request, ResponseReader};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

struct Proxy {
  addr: SocketAddr,
  records: Arc<MemoryRecordStore>,
  certificates: Arc<MemoryCertificateStore>,
  shutdown: watch::Sender<bool>,
  task: tokio::task::JoinHandle<mitm_recorder::Result<()>>,
}

async fn start_proxy(issuer: impl FnOnce(Arc<MemoryCertificateStore>) -> CertificateIssuer) -> Proxy {
  start_proxy_with(Client::builder().build().unwrap(), issuer).await
}

async fn start_proxy_with(
  client: Client,
  issuer: impl FnOnce(Arc<MemoryCertificateStore>) -> CertificateIssuer,
) -> Proxy {
  let records = Arc::new(MemoryRecordStore::new());
  let certificates = Arc::new(MemoryCertificateStore::new());
  let issuer = Arc::new(issuer(certificates.clone()));
  let handler = ProxyHandler::new(Forwarder::new(client, records.clone()), issuer);
  let server = ProxyServer::bind("127.0.0.1:0", handler).await.unwrap();
  let addr = server.local_addr().unwrap();
  let (shutdown, rx) = watch::channel(false);
  let task = tokio::spawn(server.run(rx));
  Proxy {
    addr,
    records,
    certificates,
    shutdown,
    task,
  }
}

fn failing_issuer(store: Arc<MemoryCertificateStore>) -> CertificateIssuer {
  CertificateIssuer::new(store, Arc::new(CommandSigner::new("false", vec![])), "/nonexistent/cert.key")
}

/// Plain origin that reports the raw request head it received.
async fn plain_origin(delay: Duration) -> (SocketAddr, oneshot::Receiver<String>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (tx, rx) = oneshot::channel();
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
      let n = stream.read(&mut buf).await.unwrap();
      if n == 0 {
        break;
      }
      head.extend_from_slice(&buf[..n]);
    }
    let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
    tokio::time::sleep(delay).await;
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello")
      .await
      .unwrap();
  });
  (addr, rx)
}

#[tokio::test]
async fn connect_reply_is_exact_and_failed_issue_closes() {
  let proxy = start_proxy(failing_issuer).await;
  let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
  stream
    .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
    .await
    .unwrap();
  let mut received = Vec::new();
  tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut received))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(received, CONNECT_ESTABLISHED);
  assert_eq!(received.len(), 39);
  assert!(proxy.certificates.is_empty().await);
}

#[tokio::test]
async fn plain_request_is_forwarded_and_captured() {
  let proxy = start_proxy(failing_issuer).await;
  let (origin, head) = plain_origin(Duration::ZERO).await;

  let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
  let request = format!(
    "GET http://{origin}/hello?a=1&a=2 HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\nCookie: sid=abc\r\n\r\n"
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  let mut response = Vec::new();
  stream.read_to_end(&mut response).await.unwrap();
  let response = String::from_utf8(response).unwrap();
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(response.ends_with("\r\n\r\nhello"));

  let head = head.await.unwrap();
  assert!(head.starts_with("GET /hello?a=1&a=2 HTTP/1.1\r\n"));
  assert!(!head.to_ascii_lowercase().contains("proxy-connection"));

  let records = proxy.records.list().await.unwrap();
  assert_eq!(records.len(), 1);
  let record = &records[0];
  assert_eq!(record.metadata.client_ip, "127.0.0.1");
  assert_eq!(record.request.path, "/hello");
  assert_eq!(
    record.request.query["a"],
    ParamValue::Multi(vec!["1".into(), "2".into()])
  );
  assert_eq!(record.request.cookies["sid"], "abc");
  assert_eq!(record.response.code, 200);
  assert_eq!(record.response.body, "hello");
}

#[tokio::test]
async fn unreachable_origin_closes_without_response() {
  let proxy = start_proxy(failing_issuer).await;
  let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
  stream
    .write_all(b"GET http://127.0.0.1:1/ HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n")
    .await
    .unwrap();
  let mut response = Vec::new();
  stream.read_to_end(&mut response).await.unwrap();
  assert!(response.is_empty());
  assert!(proxy.records.list().await.unwrap().is_empty());
}

/// Client TLS config trusting only the test CA.
fn trusting(ca: &common::TestCa) -> TlsConnector {
  let mut roots = rustls::RootCertStore::empty();
  for cert in tls::certs_from_pem(ca.cert_pem.as_bytes()).unwrap() {
    roots.add(cert).unwrap();
  }
  let config = rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

const CONNECT_LOCALHOST: &[u8] = b"CONNECT localhost:443 HTTP/1.1\r\nHost: localhost:443\r\n\r\n";

async fn open_tunnel(proxy: SocketAddr, ca: &common::TestCa) -> tokio_rustls::client::TlsStream<TcpStream> {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  stream.write_all(CONNECT_LOCALHOST).await.unwrap();
  let mut reply = [0u8; 39];
  stream.read_exact(&mut reply).await.unwrap();
  assert_eq!(&reply[..], CONNECT_ESTABLISHED);

  trusting(ca)
    .connect(ServerName::try_from("localhost").unwrap(), stream)
    .await
    .unwrap()
}

fn local_issuer(ca: &common::TestCa) -> impl FnOnce(Arc<MemoryCertificateStore>) -> CertificateIssuer {
  let signer = Arc::new(ca.signer());
  let key_path = ca.leaf_key_path.clone();
  move |store| CertificateIssuer::new(store, signer, key_path)
}

#[tokio::test]
async fn tunnel_presents_issued_leaf_and_reuses_it() {
  let ca = common::TestCa::new();
  let proxy = start_proxy(local_issuer(&ca)).await;

  let tunnel = open_tunnel(proxy.addr, &ca).await;
  let leaf = tunnel.get_ref().1.peer_certificates().unwrap()[0].clone();
  let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref()).unwrap();
  let cn = parsed.subject().iter_common_name().next().unwrap().as_str().unwrap();
  assert_eq!(cn, "localhost");
  drop(tunnel);
  assert_eq!(proxy.certificates.len().await, 1);

  let tunnel = open_tunnel(proxy.addr, &ca).await;
  drop(tunnel);
  assert_eq!(proxy.certificates.len().await, 1);
}

#[tokio::test]
async fn shutdown_drains_in_flight_exchange() {
  let proxy = start_proxy(failing_issuer).await;
  let (origin, head) = plain_origin(Duration::from_millis(300)).await;

  let mut stream = TcpStream::connect(proxy.addr).await.unwrap();
  let request = format!("GET http://{origin}/slow HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  stream.write_all(request.as_bytes()).await.unwrap();
  head.await.unwrap();

  proxy.shutdown.send(true).unwrap();
  let mut response = Vec::new();
  stream.read_to_end(&mut response).await.unwrap();
  assert!(String::from_utf8_lossy(&response).ends_with("hello"));

  tokio::time::timeout(Duration::from_secs(5), proxy.task)
    .await
    .unwrap()
    .unwrap()
    .unwrap();
  assert!(TcpStream::connect(proxy.addr).await.is_err());
  assert_eq!(proxy.records.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn client_hello_sent_with_connect_head_is_not_lost() {
  let ca = common::TestCa::new();
  let proxy = start_proxy(local_issuer(&ca)).await;

  // The TLS client writes into a pipe; the pump glues its first flight onto the CONNECT
  // head so both reach the proxy in a single write.
  let (client_end, mut pump_end) = tokio::io::duplex(64 * 1024);
  let proxy_addr = proxy.addr;
  let pump = tokio::spawn(async move {
    let mut hello = vec![0u8; 64 * 1024];
    let n = pump_end.read(&mut hello).await.unwrap();
    let mut upstream = TcpStream::connect(proxy_addr).await.unwrap();
    let mut first_write = CONNECT_LOCALHOST.to_vec();
    first_write.extend_from_slice(&hello[..n]);
    upstream.write_all(&first_write).await.unwrap();
    let mut reply = [0u8; 39];
    upstream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..], CONNECT_ESTABLISHED);
    let _ = tokio::io::copy_bidirectional(&mut pump_end, &mut upstream).await;
  });

  let handshake = tokio::time::timeout(
    Duration::from_secs(10),
    trusting(&ca).connect(ServerName::try_from("localhost").unwrap(), client_end),
  )
  .await;
  let tunnel = handshake.expect("handshake stalled").unwrap();
  assert!(tunnel.get_ref().1.peer_certificates().is_some());
  drop(tunnel);
  pump.await.unwrap();
  assert_eq!(proxy.certificates.len().await, 1);
}

#[tokio::test]
async fn tunnel_relays_sequential_requests_and_captures_each() {
  let ca = common::TestCa::new();
  let origin = common::tls_origin(&ca, |request: &Request| format!("seen {}", request.uri())).await;
  let client = Client::builder()
    .connector(ConnectorBuilder::default().insecure(true).resolve("localhost", origin))
    .build()
    .unwrap();
  let proxy = start_proxy_with(client, local_issuer(&ca)).await;

  let mut tunnel = BufReader::new(open_tunnel(proxy.addr, &ca).await);
  for path in ["/first", "/second?n=2"] {
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nUser-Agent: tunnel-test\r\n\r\n");
    tunnel.get_mut().write_all(request.as_bytes()).await.unwrap();
    tunnel.get_mut().flush().await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(10), ResponseReader::read(&mut tunnel, &Method::GET))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(response.status_code().as_u16(), 200);
    assert_eq!(response.body().as_ref().unwrap().as_ref(), format!("seen {path}").as_bytes());
  }
  drop(tunnel);

  let records = proxy.records.list().await.unwrap();
  assert_eq!(records.len(), 2);
  assert_eq!(records[0].request.path, "/first");
  assert_eq!(records[1].request.path, "/second");
  assert_eq!(
    records[1].request.query["n"],
    ParamValue::Single("2".into())
  );
  for record in &records {
    assert_eq!(record.metadata.client_ip, "127.0.0.1");
    assert_eq!(record.request.headers["User-Agent"], "tunnel-test");
    assert_eq!(record.response.code, 200);
  }
  assert_eq!(records[0].response.body, "seen /first");
}
