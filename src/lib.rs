#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # mitm-recorder
//!
//! An intercepting HTTP/HTTPS proxy. Plain requests are relayed to their origin; `CONNECT`
//! tunnels are terminated with a leaf certificate minted for the requested host, and every
//! request inside the tunnel is relayed over a fresh TLS connection to that host. Each
//! exchange is captured into a [`store::RecordStore`].
//!
//! Stored exchanges can be sent again with [`replay::Replayer`] or probed for command
//! injection with [`scanner::Scanner`]. [`api`] exposes both over a small JSON API.
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mitm_recorder::ca::LocalSigner;
//! use mitm_recorder::forwarder::Forwarder;
//! use mitm_recorder::issuer::CertificateIssuer;
//! use mitm_recorder::server::{ProxyHandler, ProxyServer};
//! use mitm_recorder::store::{MemoryCertificateStore, MemoryRecordStore};
//!
//! # async fn run() -> mitm_recorder::Result<()> {
//! let records = Arc::new(MemoryRecordStore::new());
//! let signer = LocalSigner::from_files("certs/ca.crt", "certs/ca.key", "certs/cert.key", 365).await?;
//! let issuer = CertificateIssuer::new(
//!   Arc::new(MemoryCertificateStore::new()),
//!   Arc::new(signer),
//!   "certs/cert.key",
//! );
//! let client = mitm_recorder::Client::builder().build()?;
//! let handler = ProxyHandler::new(Forwarder::new(client, records), Arc::new(issuer));
//! let (_tx, shutdown) = tokio::sync::watch::channel(false);
//! ProxyServer::bind("127.0.0.1:8080", handler).await?.run(shutdown).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Sending a single request
//!
//! [`Client`] executes one exchange per connection and does not follow redirects.
//!
//! ```rust,no_run
//! # async fn run() -> mitm_recorder::Result<()> {
//! let client = mitm_recorder::Client::builder().build()?;
//! let request: mitm_recorder::Request = mitm_recorder::Request::builder()
//!   .uri("http://httpbin.org/get")
//!   .body(())?
//!   .into();
//! let response = client.execute(&request).await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```
mod body;
mod client;
mod connector;
mod errors;
mod request;
mod response;
mod socket;

pub mod api;
pub mod ca;
pub mod capture;
pub mod config;
pub mod forwarder;
pub mod issuer;
pub mod record;
pub mod replay;
pub mod scanner;
pub mod server;
pub mod store;
pub mod tls;

pub use body::Body;
pub use client::{Client, ClientBuilder};
pub use connector::{Connector, ConnectorBuilder};
pub use errors::{Error, Result};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use request::{Request, RequestReader};
pub use response::{decode_text, Response, ResponseReader};
pub use socket::{MaybeTlsStream, Socket};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
