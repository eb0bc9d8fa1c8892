//! Configuration for the rxledger server binary.

use std::path::PathBuf;

use rxledger_core::commitment::Salt;
use rxledger_service::{ConsentConfig, DispatcherConfig, ReconcilerConfig, ServiceConfig};
use serde::Deserialize;

/// Runtime server configuration, deserialised from the config file layered
/// under `RXLEDGER_*` environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
  #[serde(default = "default_host")]
  pub host:         String,
  #[serde(default = "default_port")]
  pub port:         u16,
  #[serde(default = "default_ledger_path")]
  pub ledger_path:  PathBuf,
  #[serde(default = "default_mirror_path")]
  pub mirror_path:  PathBuf,
  /// Secret for patient identifier commitments. Required; never logged.
  pub patient_salt: Salt,
  #[serde(default)]
  pub service:      ServiceConfig,
  #[serde(default)]
  pub reconciler:   ReconcilerConfig,
  #[serde(default)]
  pub dispatcher:   DispatcherConfig,
  #[serde(default)]
  pub consent:      ConsentConfig,
}

fn default_host() -> String { "127.0.0.1".into() }

fn default_port() -> u16 { 8080 }

fn default_ledger_path() -> PathBuf { PathBuf::from("rxledger-ledger.db") }

fn default_mirror_path() -> PathBuf { PathBuf::from("rxledger-mirror.db") }

impl ServerConfig {
  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }
}

#[cfg(test)]
mod tests {
  use config::{Config, File, FileFormat};

  use super::*;

  fn parse(toml: &str) -> Result<ServerConfig, config::ConfigError> {
    Config::builder()
      .add_source(File::from_str(toml, FileFormat::Toml))
      .build()?
      .try_deserialize()
  }

  #[test]
  fn minimal_config_uses_defaults() {
    let cfg = parse(r#"patient_salt = "s3cret""#).unwrap();
    assert_eq!(cfg.address(), "127.0.0.1:8080");
    assert_eq!(cfg.service.max_page_size, 100);
    assert_eq!(cfg.reconciler.poll_interval_secs, 30);
    assert_eq!(cfg.consent.max_attempts, 3);
    assert!(cfg.dispatcher.webhook_url.is_none());
    assert!(!format!("{cfg:?}").contains("s3cret"));
  }

  #[test]
  fn sections_override_defaults() {
    let cfg = parse(
      r#"
        patient_salt = "s3cret"
        port = 9000

        [service]
        store_ref = "addr_test1wz"
        store_timeout_secs = 3

        [service.policy]
        redeem_requires_consent = false

        [dispatcher]
        webhook_url = "http://localhost:4000/notify"
      "#,
    )
    .unwrap();
    assert_eq!(cfg.port, 9000);
    assert_eq!(cfg.service.store_ref.as_str(), "addr_test1wz");
    assert_eq!(cfg.service.store_timeout_secs, 3);
    assert!(!cfg.service.policy.redeem_requires_consent);
    assert_eq!(cfg.dispatcher.webhook_url.as_deref(), Some("http://localhost:4000/notify"));
  }

  #[test]
  fn salt_is_required() {
    assert!(parse("port = 9000").is_err());
  }
}
