//! Error types for `rxledger-core`.
//!
//! Validation and transition failures are plain values: the record model
//! returns them, it never panics or unwinds across the validation boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{ActorId, RecordRef};

/// Malformed input. The caller's fault; never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
  #[error("invalid input: {0}")]
  InvalidInput(&'static str),

  #[error("missing required field: {0}")]
  MissingField(&'static str),

  #[error("issued_at ({issued_at}) must be earlier than expiry_at ({expiry_at})")]
  InvalidValidityWindow { issued_at: i64, expiry_at: i64 },

  #[error("quantity must be greater than zero")]
  ZeroQuantity,
}

/// A transition that the current record state does not permit.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionError {
  #[error("prescription expired at {expiry_at} (now {now})")]
  Expired { expiry_at: i64, now: i64 },

  #[error("no refills remaining")]
  NoRefillsRemaining,

  #[error("{actor} is not authorized for this action")]
  Unauthorized { actor: ActorId },

  #[error("patient consent code required")]
  ConsentRequired,

  #[error("patient consent code invalid")]
  ConsentInvalid,

  #[error("reference {reference} has already been consumed")]
  StaleReference { reference: RecordRef },

  #[error("invalid action: {reason}")]
  InvalidAction { reason: String },
}

impl TransitionError {
  /// No retry of the same request can ever succeed.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      Self::Expired { .. }
        | Self::NoRefillsRemaining
        | Self::Unauthorized { .. }
        | Self::InvalidAction { .. }
    )
  }

  /// Worth retrying once the caller has fixed its precondition: fresh consent
  /// for consent failures, a re-fetched reference for stale ones.
  pub fn is_retryable(&self) -> bool { !self.is_terminal() }

  /// Stable machine-readable name, matching the serde tag.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Expired { .. } => "expired",
      Self::NoRefillsRemaining => "no_refills_remaining",
      Self::Unauthorized { .. } => "unauthorized",
      Self::ConsentRequired => "consent_required",
      Self::ConsentInvalid => "consent_invalid",
      Self::StaleReference { .. } => "stale_reference",
      Self::InvalidAction { .. } => "invalid_action",
    }
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error(transparent)]
  Transition(#[from] TransitionError),

  #[error("malformed record reference: {0:?}")]
  MalformedReference(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
