//! Runtime configuration for the service and its background workers.
//!
//! Every section deserialises with defaults, so an empty configuration source
//! yields a working development setup.

use std::time::Duration;

use serde::Deserialize;

use rxledger_core::{lifecycle::TransitionPolicy, record::StoreRef};

// ─── Service ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
  /// Location at which new prescriptions are created.
  pub store_ref:          StoreRef,
  /// Reserve locked with each new record (minimum lovelace on Cardano).
  pub minimum_reserve:    u64,
  /// Upper bound on every authoritative-store call.
  pub store_timeout_secs: u64,
  /// Largest page a mirror query may return.
  pub max_page_size:      usize,
  pub policy:             TransitionPolicy,
}

impl Default for ServiceConfig {
  fn default() -> Self {
    Self {
      store_ref:          StoreRef::new("rxledger:prescriptions"),
      minimum_reserve:    2_000_000,
      store_timeout_secs: 10,
      max_page_size:      100,
      policy:             TransitionPolicy::default(),
    }
  }
}

impl ServiceConfig {
  pub fn store_timeout(&self) -> Duration { Duration::from_secs(self.store_timeout_secs) }
}

// ─── Reconciler ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
  pub poll_interval_secs: u64,
  /// Locations to monitor. Empty means only the service's `store_ref`.
  pub store_refs:         Vec<StoreRef>,
}

impl Default for ReconcilerConfig {
  fn default() -> Self { Self { poll_interval_secs: 30, store_refs: Vec::new() } }
}

impl ReconcilerConfig {
  pub fn poll_interval(&self) -> Duration { Duration::from_secs(self.poll_interval_secs.max(1)) }
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
  pub poll_interval_secs:   u64,
  pub batch_size:           usize,
  /// Attempts before an event is parked as failed.
  pub max_attempts:         u32,
  /// Notification service endpoint. Events are only logged when unset.
  pub webhook_url:          Option<String>,
  pub request_timeout_secs: u64,
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    Self {
      poll_interval_secs:   10,
      batch_size:           50,
      max_attempts:         5,
      webhook_url:          None,
      request_timeout_secs: 10,
    }
  }
}

impl DispatcherConfig {
  pub fn poll_interval(&self) -> Duration { Duration::from_secs(self.poll_interval_secs.max(1)) }

  pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
}

// ─── Consent ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsentConfig {
  pub ttl_secs:     i64,
  pub max_attempts: u32,
}

impl Default for ConsentConfig {
  fn default() -> Self { Self { ttl_secs: 300, max_attempts: 3 } }
}
