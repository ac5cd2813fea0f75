use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use mitm_recorder::api::{self, ApiState};
use mitm_recorder::config::Config;
use mitm_recorder::forwarder::Forwarder;
use mitm_recorder::issuer::CertificateIssuer;
use mitm_recorder::replay::Replayer;
use mitm_recorder::scanner::Scanner;
use mitm_recorder::server::{ProxyHandler, ProxyServer};
use mitm_recorder::store::{MemoryCertificateStore, MemoryRecordStore, RecordStore};
use mitm_recorder::{Client, Result};

#[derive(Parser, Debug)]
#[command(name = "mitm-recorder")]
#[command(about = "Intercepting HTTP/HTTPS proxy that records, replays and scans traffic", long_about = None)]
struct Args {
  /// Path to a TOML configuration file
  #[arg(short, long, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Enable debug logging
  #[arg(short, long)]
  debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();

  let default_level = if args.debug { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("mitm_recorder={default_level}"))),
    )
    .init();

  let config = match Config::load(args.config.as_deref()) {
    Ok(config) => config,
    Err(e) => {
      error!("Failed to load configuration: {}", e);
      return Err(e);
    }
  };

  let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
  let signer = config.ca.signer().await?;
  let issuer = Arc::new(CertificateIssuer::new(
    Arc::new(MemoryCertificateStore::new()),
    signer,
    config.ca.leaf_key_path.clone(),
  ));
  let client = Client::builder()
    .connector(config.upstream.connector_builder())
    .build()?;

  let (shutdown_tx, shutdown_rx) = watch::channel(false);

  let handler = ProxyHandler::new(Forwarder::new(client.clone(), records.clone()), issuer);
  let proxy = ProxyServer::bind(config.proxy.listen, handler).await?;
  let proxy_task = tokio::spawn(proxy.run(shutdown_rx.clone()));

  let api_task = if config.api.enabled {
    let state = ApiState::new(
      records.clone(),
      Replayer::new(client.clone(), records.clone()),
      Scanner::new(client, records),
    );
    let (_, server) = api::bind(config.api.listen, state, shutdown_rx)?;
    Some(tokio::spawn(server))
  } else {
    None
  };

  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("Received shutdown signal"),
    Err(e) => error!("Failed to listen for shutdown signal: {}", e),
  }
  let _ = shutdown_tx.send(true);

  match proxy_task.await {
    Ok(Err(e)) => error!("Proxy stopped with error: {}", e),
    Err(e) => error!("Proxy task failed: {}", e),
    Ok(Ok(())) => {}
  }
  if let Some(api_task) = api_task {
    if let Err(e) = api_task.await {
      error!("API task failed: {}", e);
    }
  }
  info!("Shutdown complete");
  Ok(())
}
