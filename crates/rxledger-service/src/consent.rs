//! One-time-code consent gate.
//!
//! A six-digit code is generated per prescription, stored only as a hash, and
//! accepted once. The challenge is dropped on success, on expiry, and when the
//! attempt budget runs out.

use std::{
  collections::HashMap,
  convert::Infallible,
  sync::{Arc, Mutex, PoisonError},
};

use rand_core::{OsRng, RngCore as _};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use rxledger_core::{
  clock::{Clock, SystemClock},
  consent::{ConsentChallenge, ConsentGate, ConsentStore, IssuedChallenge},
  lifecycle::ConsentOutcome,
};

use crate::config::ConsentConfig;

#[derive(Debug, Error)]
pub enum ConsentError<E: std::error::Error + 'static> {
  #[error("consent store error: {0}")]
  Store(#[source] E),

  #[error("entropy source failed: {0}")]
  Entropy(#[source] rand_core::Error),
}

/// Largest multiple of 10^6 below 2^32; draws above it are rejected so every
/// code is equally likely.
const UNBIASED_LIMIT: u32 = 4_294_000_000;

fn generate_code() -> Result<String, rand_core::Error> {
  loop {
    let mut buf = [0u8; 4];
    OsRng.try_fill_bytes(&mut buf)?;
    let n = u32::from_le_bytes(buf);
    if n < UNBIASED_LIMIT {
      return Ok(format!("{:06}", n % 1_000_000));
    }
  }
}

fn hash_code(prescription_id: Uuid, code: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(prescription_id.as_bytes());
  hasher.update(code.trim().as_bytes());
  hex::encode(hasher.finalize())
}

// ─── Gate ────────────────────────────────────────────────────────────────────

pub struct OtpConsent<S> {
  store:        Arc<S>,
  clock:        Arc<dyn Clock>,
  ttl_secs:     i64,
  max_attempts: u32,
}

impl<S: ConsentStore> OtpConsent<S> {
  pub fn new(store: Arc<S>, config: &ConsentConfig) -> Self {
    Self {
      store,
      clock: Arc::new(SystemClock),
      ttl_secs: config.ttl_secs,
      max_attempts: config.max_attempts.max(1),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  async fn discard(&self, prescription_id: Uuid) -> Result<ConsentOutcome, ConsentError<S::Error>> {
    self
      .store
      .remove_challenge(prescription_id)
      .await
      .map_err(ConsentError::Store)?;
    Ok(ConsentOutcome::Rejected)
  }
}

impl<S: ConsentStore> ConsentGate for OtpConsent<S> {
  type Error = ConsentError<S::Error>;

  async fn issue(&self, prescription_id: Uuid) -> Result<IssuedChallenge, Self::Error> {
    let code = generate_code().map_err(ConsentError::Entropy)?;
    let expires_at = self.clock.now() + self.ttl_secs;

    self
      .store
      .put_challenge(ConsentChallenge {
        prescription_id,
        code_hash: hash_code(prescription_id, &code),
        expires_at,
        attempts: 0,
      })
      .await
      .map_err(ConsentError::Store)?;

    debug!(%prescription_id, expires_at, "consent challenge issued");
    Ok(IssuedChallenge { prescription_id, code, expires_at })
  }

  async fn verify<'a>(
    &'a self,
    prescription_id: Uuid,
    code: &'a str,
  ) -> Result<ConsentOutcome, Self::Error> {
    let Some(challenge) = self
      .store
      .get_challenge(prescription_id)
      .await
      .map_err(ConsentError::Store)?
    else {
      return Ok(ConsentOutcome::Rejected);
    };

    if self.clock.now() > challenge.expires_at || challenge.attempts >= self.max_attempts {
      debug!(%prescription_id, "consent challenge expired or exhausted");
      return self.discard(prescription_id).await;
    }

    if hash_code(prescription_id, code) == challenge.code_hash {
      self
        .store
        .remove_challenge(prescription_id)
        .await
        .map_err(ConsentError::Store)?;
      return Ok(ConsentOutcome::Verified);
    }

    let attempts = self
      .store
      .record_failed_attempt(prescription_id)
      .await
      .map_err(ConsentError::Store)?
      .unwrap_or(self.max_attempts);
    if attempts >= self.max_attempts {
      debug!(%prescription_id, attempts, "consent attempts exhausted");
      return self.discard(prescription_id).await;
    }
    Ok(ConsentOutcome::Rejected)
  }
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// Process-local challenge store for development and tests.
#[derive(Debug, Default)]
pub struct MemoryConsentStore {
  challenges: Mutex<HashMap<Uuid, ConsentChallenge>>,
}

impl MemoryConsentStore {
  fn with<T>(&self, f: impl FnOnce(&mut HashMap<Uuid, ConsentChallenge>) -> T) -> T {
    let mut guard = self.challenges.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
  }
}

impl ConsentStore for MemoryConsentStore {
  type Error = Infallible;

  async fn put_challenge(&self, challenge: ConsentChallenge) -> Result<(), Infallible> {
    self.with(|m| m.insert(challenge.prescription_id, challenge));
    Ok(())
  }

  async fn get_challenge(&self, prescription_id: Uuid) -> Result<Option<ConsentChallenge>, Infallible> {
    Ok(self.with(|m| m.get(&prescription_id).cloned()))
  }

  async fn record_failed_attempt(&self, prescription_id: Uuid) -> Result<Option<u32>, Infallible> {
    Ok(self.with(|m| {
      m.get_mut(&prescription_id).map(|c| {
        c.attempts += 1;
        c.attempts
      })
    }))
  }

  async fn remove_challenge(&self, prescription_id: Uuid) -> Result<(), Infallible> {
    self.with(|m| m.remove(&prescription_id));
    Ok(())
  }
}
