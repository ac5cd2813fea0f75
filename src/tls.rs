//! TLS configuration and types
//!
//! Two distinct configurations live here: the client side used to reach origins, and the
//! server side presented to intercepted clients. They never share key material.
use std::io::Cursor;
use std::sync::Arc;
use tokio_rustls::rustls;
use tokio_rustls::rustls::crypto::CryptoProvider;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::pki_types::{ServerName, UnixTime};
use tokio_rustls::rustls::{
  client::danger::HandshakeSignatureValid, client::danger::ServerCertVerified,
  client::danger::ServerCertVerifier, DigitallySignedStruct, Error as TLSError, RootCertStore,
  SignatureScheme,
};

use crate::errors::{builder, Result};

fn provider() -> Arc<CryptoProvider> {
  CryptoProvider::get_default()
    .cloned()
    .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Builds the client configuration used to dial origins.
///
/// Trusts the platform's native roots, unless `insecure` is set, in which case any
/// certificate is accepted.
pub fn client_config(insecure: bool) -> Result<rustls::ClientConfig> {
  let config_builder = rustls::ClientConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|_| builder("invalid TLS versions"))?;
  let config = if insecure {
    config_builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier))
      .with_no_client_auth()
  } else {
    let mut root_cert_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
      tracing::debug!("skipping native root: {}", err);
    }
    let (added, ignored) = root_cert_store.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "loaded native root certificates");
    config_builder
      .with_root_certificates(root_cert_store)
      .with_no_client_auth()
  };
  Ok(config)
}

/// Builds a server configuration presenting exactly one certificate chain.
pub fn server_config(
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig> {
  let config = rustls::ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()
    .map_err(|_| builder("invalid TLS versions"))?
    .with_no_client_auth()
    .with_single_cert(cert_chain, key)?;
  Ok(config)
}

/// Parses every certificate of a PEM bundle.
pub fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
  let mut reader = Cursor::new(pem);
  let certs = rustls_pemfile::certs(&mut reader)
    .collect::<std::result::Result<Vec<_>, _>>()
    .map_err(|_| builder("invalid certificate encoding"))?;
  if certs.is_empty() {
    return Err(builder("no certificate found in PEM"));
  }
  Ok(certs)
}

/// Parses the first private key of a PEM document (PKCS#1, PKCS#8 or SEC1).
pub fn key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
  let mut reader = Cursor::new(pem);
  rustls_pemfile::private_key(&mut reader)
    .map_err(|_| builder("invalid private key encoding"))?
    .ok_or_else(|| builder("no private key found in PEM"))
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA1,
      SignatureScheme::ECDSA_SHA1_Legacy,
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
      SignatureScheme::ED448,
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn server_config_accepts_generated_pair() {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
      .unwrap()
      .self_signed(&key)
      .unwrap();
    let certs = certs_from_pem(cert.pem().as_bytes()).unwrap();
    let key = key_from_pem(key.serialize_pem().as_bytes()).unwrap();
    assert!(server_config(certs, key).is_ok());
  }

  #[test]
  fn rejects_pem_without_material() {
    assert!(certs_from_pem(b"not a pem").is_err());
    assert!(key_from_pem(b"not a pem").is_err());
  }

  #[test]
  fn insecure_client_config_builds() {
    assert!(client_config(true).is_ok());
  }
}
