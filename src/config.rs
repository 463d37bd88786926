//! Process configuration. Every field has a default, so an empty JSON object
//! is a complete configuration.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::forward::FORWARD_TIMEOUT;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// `local`, `dev` or `prod`; selects the log format and level
  pub log_env: String,
  /// Proxy listener
  pub proxy: ListenerConfig,
  /// Query API listener
  pub api: ListenerConfig,
  /// How long in-flight connections get after shutdown is requested
  #[serde(with = "seconds")]
  pub graceful_shutdown_timeout: Duration,
  /// Root CA material
  pub cert: CertConfig,
  /// Total deadline of one forwarded call
  #[serde(with = "seconds")]
  pub forward_timeout: Duration,
  /// TCP connect deadline toward upstreams
  #[serde(with = "seconds")]
  pub connect_timeout: Duration,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      log_env: "local".to_string(),
      proxy: ListenerConfig::proxy(),
      api: ListenerConfig::api(),
      graceful_shutdown_timeout: Duration::from_secs(10),
      cert: CertConfig::default(),
      forward_timeout: FORWARD_TIMEOUT,
      connect_timeout: Duration::from_secs(10),
    }
  }
}

impl Config {
  /// Read a JSON configuration file. Missing fields take their defaults.
  pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let raw = tokio::fs::read(path)
      .await
      .map_err(|e| Error::Other(format!("failed to read config {}: {}", path.display(), e)))?;
    Ok(serde_json::from_slice(&raw)?)
  }
}

/// One listening socket and its timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
  /// `host:port` to bind
  pub address: String,
  /// Bounds the TLS handshake and the tunneled request read
  #[serde(with = "seconds")]
  pub read_timeout: Duration,
  /// Bounds writing the response back
  #[serde(with = "seconds")]
  pub write_timeout: Duration,
  /// Bounds the wait for the first byte on a new connection
  #[serde(with = "seconds")]
  pub idle_timeout: Duration,
  /// Bounds reading the request head once it has started
  #[serde(with = "seconds")]
  pub read_header_timeout: Duration,
}

impl ListenerConfig {
  /// Proxy listener defaults.
  pub fn proxy() -> Self {
    ListenerConfig {
      address: "0.0.0.0:62801".to_string(),
      read_timeout: Duration::from_secs(4),
      write_timeout: Duration::from_secs(4),
      idle_timeout: Duration::from_secs(30),
      read_header_timeout: Duration::from_secs(10),
    }
  }
  /// Query API listener defaults.
  pub fn api() -> Self {
    ListenerConfig {
      address: "0.0.0.0:62802".to_string(),
      ..Self::proxy()
    }
  }
}

impl Default for ListenerConfig {
  fn default() -> Self {
    Self::proxy()
  }
}

/// Where the root CA lives and what leaves are issued as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertConfig {
  /// PEM root certificate
  pub ca_cert_file: PathBuf,
  /// PEM RSA root key
  pub ca_key_file: PathBuf,
  /// Organization written into every leaf subject
  pub organization: String,
}

impl Default for CertConfig {
  fn default() -> Self {
    CertConfig {
      ca_cert_file: PathBuf::from("./certs/ca.crt"),
      ca_key_file: PathBuf::from("./certs/ca.key"),
      organization: "Wiretap".to_string(),
    }
  }
}

mod seconds {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_secs())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
  }
}
