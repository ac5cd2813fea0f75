#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use mitm_recorder::ca::{CaSigner, LocalSigner};
use mitm_recorder::{tls, Request, RequestReader};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// Throwaway CA plus the shared leaf key written to disk.
pub struct TestCa {
  pub cert_pem: String,
  pub key_pem: String,
  pub leaf_key_pem: String,
  pub leaf_key_path: PathBuf,
  _dir: tempfile::TempDir,
}

impl TestCa {
  pub fn new() -> TestCa {
    let mut params = CertificateParams::default();
    params
      .distinguished_name
      .push(DnType::CommonName, "mitm-recorder test CA");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    let leaf_key_pem = KeyPair::generate().unwrap().serialize_pem();
    let dir = tempfile::tempdir().unwrap();
    let leaf_key_path = dir.path().join("cert.key");
    std::fs::write(&leaf_key_path, &leaf_key_pem).unwrap();
    TestCa {
      cert_pem: cert.pem(),
      key_pem: key.serialize_pem(),
      leaf_key_pem,
      leaf_key_path,
      _dir: dir,
    }
  }

  pub fn signer(&self) -> LocalSigner {
    LocalSigner::new(&self.cert_pem, &self.key_pem, &self.leaf_key_pem, 30).unwrap()
  }
}

/// Starts an HTTPS origin on a random port answering every request with `respond(request)`.
pub async fn tls_origin<F>(ca: &TestCa, respond: F) -> SocketAddr
where
  F: Fn(&Request) -> String + Send + Sync + 'static,
{
  let cert_pem = ca.signer().sign("127.0.0.1", 7).await.unwrap();
  let config = tls::server_config(
    tls::certs_from_pem(cert_pem.as_bytes()).unwrap(),
    tls::key_from_pem(ca.leaf_key_pem.as_bytes()).unwrap(),
  )
  .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let respond = Arc::new(respond);
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        break;
      };
      let acceptor = acceptor.clone();
      let respond = respond.clone();
      tokio::spawn(async move {
        let Ok(stream) = acceptor.accept(stream).await else {
          return;
        };
        let mut reader = BufReader::new(stream);
        let Ok(Some(request)) = RequestReader::read(&mut reader).await else {
          return;
        };
        let body = respond(&request);
        let raw = format!(
          "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
          body.len(),
          body
        );
        let mut stream = reader.into_inner();
        let _ = stream.write_all(raw.as_bytes()).await;
        let _ = stream.shutdown().await;
      });
    }
  });
  addr
}
