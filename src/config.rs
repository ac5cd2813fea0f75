//! Runtime configuration.
//!
//! Layers, lowest first: built-in defaults, an optional TOML file, then `MITM_` environment
//! variables with `__` separating sections (`MITM_UPSTREAM__INSECURE=true`).
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::ca::{CaSigner, CommandSigner, LocalSigner};
use crate::errors::{Error, Result};
use crate::ConnectorBuilder;

/// Environment prefix of configuration variables.
pub const ENV_PREFIX: &str = "MITM_";

/// Whole configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// proxy listener
  pub proxy: ProxyConfig,
  /// management API
  pub api: ApiConfig,
  /// certificate signing
  pub ca: CaConfig,
  /// origin connections
  pub upstream: UpstreamConfig,
}

/// Proxy listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
  /// address the proxy accepts clients on
  pub listen: SocketAddr,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
    }
  }
}

/// Management API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// address the API listens on
  pub listen: SocketAddr,
  /// serve the API at all
  pub enabled: bool,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
      enabled: true,
    }
  }
}

/// Which signer mints leaf certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerKind {
  /// sign in-process with the CA files
  #[default]
  Local,
  /// run an external program
  Command,
}

/// Certificate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
  /// signer backend
  pub signer: SignerKind,
  /// CA certificate, PEM
  pub cert_path: PathBuf,
  /// CA private key, PEM
  pub key_path: PathBuf,
  /// fixed private key shared by every leaf, PEM
  pub leaf_key_path: PathBuf,
  /// program for the `command` signer
  pub command: Option<PathBuf>,
  /// arguments placed before domain and serial
  pub args: Vec<String>,
  /// lifetime of leaves signed locally
  pub validity_days: i64,
}

impl Default for CaConfig {
  fn default() -> Self {
    Self {
      signer: SignerKind::Local,
      cert_path: PathBuf::from("certs/ca.crt"),
      key_path: PathBuf::from("certs/ca.key"),
      leaf_key_path: PathBuf::from("certs/cert.key"),
      command: None,
      args: Vec::new(),
      validity_days: 365,
    }
  }
}

impl CaConfig {
  /// Builds the configured signer.
  pub async fn signer(&self) -> Result<Arc<dyn CaSigner>> {
    match self.signer {
      SignerKind::Local => {
        let signer = LocalSigner::from_files(
          &self.cert_path,
          &self.key_path,
          &self.leaf_key_path,
          self.validity_days,
        )
        .await
        .map_err(|e| Error::Config(format!("cannot load CA material: {}", e)))?;
        Ok(Arc::new(signer))
      }
      SignerKind::Command => {
        let program = self
          .command
          .clone()
          .ok_or_else(|| Error::Config("ca.command is required for the command signer".into()))?;
        Ok(Arc::new(CommandSigner::new(program, self.args.clone())))
      }
    }
  }
}

/// Origin connection settings. A zero timeout disables that deadline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
  /// accept any origin certificate
  pub insecure: bool,
  /// dial deadline
  pub connect_timeout_secs: u64,
  /// per-read deadline
  pub read_timeout_secs: u64,
  /// per-write deadline
  pub write_timeout_secs: u64,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      insecure: false,
      connect_timeout_secs: 10,
      read_timeout_secs: 30,
      write_timeout_secs: 30,
    }
  }
}

fn secs(value: u64) -> Option<Duration> {
  (value > 0).then(|| Duration::from_secs(value))
}

impl UpstreamConfig {
  /// Connector settings for origin dials.
  pub fn connector_builder(&self) -> ConnectorBuilder {
    ConnectorBuilder::default()
      .insecure(self.insecure)
      .connect_timeout(secs(self.connect_timeout_secs))
      .read_timeout(secs(self.read_timeout_secs))
      .write_timeout(secs(self.write_timeout_secs))
  }
}

impl Config {
  /// Loads defaults, then `path` if given, then the environment.
  pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    if let Some(path) = path {
      if !path.exists() {
        return Err(Error::Config(format!("config file {} not found", path.display())));
      }
      figment = figment.merge(Toml::file(path));
    }
    Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
  }

  /// Extracts and validates a configuration from any provider stack.
  pub fn from_figment(figment: Figment) -> Result<Config> {
    let config: Config = figment
      .extract()
      .map_err(|e| Error::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Rejects inconsistent settings.
  pub fn validate(&self) -> Result<()> {
    if self.api.enabled && self.api.listen == self.proxy.listen {
      return Err(Error::Config(
        "proxy and API listen addresses must differ".into(),
      ));
    }
    if self.ca.signer == SignerKind::Command && self.ca.command.is_none() {
      return Err(Error::Config(
        "ca.command is required for the command signer".into(),
      ));
    }
    if self.ca.validity_days <= 0 {
      return Err(Error::Config("ca.validity_days must be positive".into()));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn from_toml(toml: &str) -> Result<Config> {
    Config::from_figment(Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml)))
  }

  #[test]
  fn defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.proxy.listen.port(), 8080);
    assert_eq!(config.api.listen.port(), 8000);
    assert_eq!(config.ca.leaf_key_path, PathBuf::from("certs/cert.key"));
    assert_eq!(config.upstream.connect_timeout_secs, 10);
  }

  #[test]
  fn toml_overrides_defaults() {
    let config = from_toml(
      r#"
        [proxy]
        listen = "127.0.0.1:3128"
        [ca]
        signer = "command"
        command = "scripts/gen_cert.sh"
        [upstream]
        insecure = true
        read_timeout_secs = 0
      "#,
    )
    .unwrap();
    assert_eq!(config.proxy.listen, "127.0.0.1:3128".parse().unwrap());
    assert_eq!(config.ca.signer, SignerKind::Command);
    assert!(config.upstream.insecure);
    assert_eq!(config.upstream.write_timeout_secs, 30);
    assert_eq!(secs(config.upstream.read_timeout_secs), None);
  }

  #[test]
  fn rejects_shared_listen_address() {
    let err = from_toml(
      r#"
        [proxy]
        listen = "127.0.0.1:9000"
        [api]
        listen = "127.0.0.1:9000"
      "#,
    );
    assert!(matches!(err, Err(Error::Config(_))));
  }

  #[test]
  fn rejects_command_signer_without_command() {
    assert!(from_toml("[ca]\nsigner = \"command\"\n").is_err());
  }

  #[test]
  fn loads_from_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    std::io::Write::write_all(&mut file, b"[api]\nenabled = false\n").unwrap();
    let config = Config::load(Some(file.path())).unwrap();
    assert!(!config.api.enabled);
    assert!(Config::load(Some(Path::new("/nonexistent/mitm.toml"))).is_err());
  }
}
