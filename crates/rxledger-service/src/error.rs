//! Error type for `rxledger-service`.

use thiserror::Error;
use uuid::Uuid;

use rxledger_core::{TransitionError, ValidationError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error(transparent)]
  Transition(#[from] TransitionError),

  #[error("core error: {0}")]
  Core(rxledger_core::Error),

  #[error("prescription not found: {0}")]
  NotFound(Uuid),

  #[error("prescription {0} already exists")]
  AlreadyExists(Uuid),

  /// The key was already used for a different request.
  #[error("idempotency key {key:?} was used for a different request")]
  IdempotencyConflict { key: String },

  /// The outcome is unknown; retry with the same idempotency key.
  #[error("authoritative store did not answer {operation} in time")]
  StoreTimeout { operation: &'static str },

  #[error("authoritative store unavailable: {0}")]
  StoreUnavailable(BoxError),

  #[error("mirror store error: {0}")]
  Mirror(BoxError),

  #[error("consent gate error: {0}")]
  Consent(BoxError),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),
}

impl From<rxledger_core::Error> for Error {
  fn from(err: rxledger_core::Error) -> Self {
    match err {
      rxledger_core::Error::Validation(e) => Self::Validation(e),
      rxledger_core::Error::Transition(e) => Self::Transition(e),
      other => Self::Core(other),
    }
  }
}

impl Error {
  pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::StoreUnavailable(Box::new(err))
  }

  pub fn mirror(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Mirror(Box::new(err))
  }

  pub fn consent(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Consent(Box::new(err))
  }

  /// Whether the caller should retry, with the same idempotency key, after
  /// fixing whatever precondition the error names.
  pub fn is_retryable(&self) -> bool {
    match self {
      Self::Transition(e) => e.is_retryable(),
      Self::StoreTimeout { .. }
      | Self::StoreUnavailable(_)
      | Self::Mirror(_)
      | Self::Consent(_) => true,
      Self::Validation(_)
      | Self::Core(_)
      | Self::NotFound(_)
      | Self::AlreadyExists(_)
      | Self::IdempotencyConflict { .. }
      | Self::Json(_) => false,
    }
  }

  /// Stable machine-readable name for API responses and logs.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Validation(_) => "validation",
      Self::Transition(e) => e.kind(),
      Self::Core(_) | Self::Json(_) => "internal",
      Self::NotFound(_) => "not_found",
      Self::AlreadyExists(_) => "already_exists",
      Self::IdempotencyConflict { .. } => "idempotency_conflict",
      Self::StoreTimeout { .. } => "store_timeout",
      Self::StoreUnavailable(_) => "store_unavailable",
      Self::Mirror(_) => "mirror_unavailable",
      Self::Consent(_) => "consent_unavailable",
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use rxledger_core::record::RecordRef;

  use super::*;

  #[test]
  fn core_errors_are_split_by_taxonomy() {
    let e: Error = rxledger_core::Error::from(ValidationError::ZeroQuantity).into();
    assert!(matches!(e, Error::Validation(_)));
    assert!(!e.is_retryable());

    let stale = TransitionError::StaleReference { reference: RecordRef::new(Uuid::nil(), 0) };
    let e: Error = rxledger_core::Error::from(stale).into();
    assert_eq!(e.kind(), "stale_reference");
    assert!(e.is_retryable());

    let e: Error = TransitionError::NoRefillsRemaining.into();
    assert!(!e.is_retryable());
    assert!(Error::StoreTimeout { operation: "submit" }.is_retryable());
  }
}
