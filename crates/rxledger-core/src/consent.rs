//! Patient-consent gate and the challenge store behind it.
//!
//! A challenge is created when a code is sent, and removed on success, on
//! expiry, or once the attempt budget is spent.

use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::ConsentOutcome;

/// An outstanding consent challenge. Only a hash of the code is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentChallenge {
  pub prescription_id: Uuid,
  pub code_hash:       String,
  /// Unix seconds.
  pub expires_at:      i64,
  pub attempts:        u32,
}

/// Injected key-value store for challenges, keyed by prescription id. A new
/// challenge for the same prescription replaces the old one.
pub trait ConsentStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn put_challenge(
    &self,
    challenge: ConsentChallenge,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  fn get_challenge(
    &self,
    prescription_id: Uuid,
  ) -> impl Future<Output = Result<Option<ConsentChallenge>, Self::Error>> + Send + '_;

  /// Increment and return the attempt counter; `None` if no challenge exists.
  fn record_failed_attempt(
    &self,
    prescription_id: Uuid,
  ) -> impl Future<Output = Result<Option<u32>, Self::Error>> + Send + '_;

  fn remove_challenge(
    &self,
    prescription_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}

/// A freshly issued code, to be delivered to the patient out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedChallenge {
  pub prescription_id: Uuid,
  pub code:            String,
  pub expires_at:      i64,
}

/// The external consent/OTP verification black box.
pub trait ConsentGate: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  fn issue(
    &self,
    prescription_id: Uuid,
  ) -> impl Future<Output = Result<IssuedChallenge, Self::Error>> + Send + '_;

  fn verify<'a>(
    &'a self,
    prescription_id: Uuid,
    code: &'a str,
  ) -> impl Future<Output = Result<ConsentOutcome, Self::Error>> + Send + 'a;
}
