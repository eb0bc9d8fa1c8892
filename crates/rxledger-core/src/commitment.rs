//! Privacy-preserving identifier commitments.
//!
//! Raw patient identifiers never enter a shared record. They are replaced by
//! a salted SHA-256 commitment that supports equality checks only.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// A one-way commitment to a sensitive identifier (64 lowercase hex chars).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Commitment(String);

impl Commitment {
  /// Wrap an already-computed commitment, e.g. one read back from storage or
  /// supplied as a query filter.
  pub fn from_hex(hex: impl Into<String>) -> Self { Self(hex.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Commitment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Deployment-wide secret salt. Its value is never printed.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Salt(String);

impl Salt {
  pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }

  fn expose(&self) -> &str { &self.0 }
}

impl fmt::Debug for Salt {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Salt(<redacted>)") }
}

/// Commit to `identifier` under `salt`.
///
/// The salt is length-prefixed so that `("ab", "c")` and `("a", "bc")` can
/// never collide.
pub fn hash_identifier(
  identifier: &str,
  salt: &str,
) -> Result<Commitment, ValidationError> {
  if identifier.trim().is_empty() {
    return Err(ValidationError::InvalidInput("identifier must not be empty"));
  }
  if salt.trim().is_empty() {
    return Err(ValidationError::InvalidInput("salt must not be empty"));
  }

  let mut hasher = Sha256::new();
  hasher.update((salt.len() as u64).to_le_bytes());
  hasher.update(salt.as_bytes());
  hasher.update(identifier.as_bytes());
  Ok(Commitment(hex::encode(hasher.finalize())))
}

/// A hasher bound to one deployment's salt.
#[derive(Debug, Clone)]
pub struct IdentifierHasher {
  salt: Salt,
}

impl IdentifierHasher {
  pub fn new(salt: Salt) -> Result<Self, ValidationError> {
    if salt.expose().trim().is_empty() {
      return Err(ValidationError::InvalidInput("salt must not be empty"));
    }
    Ok(Self { salt })
  }

  pub fn commit(&self, identifier: &str) -> Result<Commitment, ValidationError> {
    hash_identifier(identifier, self.salt.expose())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deterministic_for_same_inputs() {
    let a = hash_identifier("patient-42", "tenant-a").unwrap();
    let b = hash_identifier("patient-42", "tenant-a").unwrap();
    assert_eq!(a, b);
    assert_eq!(a.as_str().len(), 64);
    assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[test]
  fn different_salts_do_not_correlate() {
    let a = hash_identifier("patient-42", "tenant-a").unwrap();
    let b = hash_identifier("patient-42", "tenant-b").unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn salt_boundary_is_unambiguous() {
    let a = hash_identifier("c", "ab").unwrap();
    let b = hash_identifier("bc", "a").unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn commitment_does_not_contain_identifier() {
    let c = hash_identifier("alice@example.com", "s3cret").unwrap();
    assert!(!c.as_str().contains("alice"));
  }

  #[test]
  fn empty_inputs_are_rejected() {
    assert!(matches!(
      hash_identifier("", "salt"),
      Err(ValidationError::InvalidInput(_))
    ));
    assert!(matches!(
      hash_identifier("id", "  "),
      Err(ValidationError::InvalidInput(_))
    ));
    assert!(IdentifierHasher::new(Salt::new("")).is_err());
  }

  #[test]
  fn salt_debug_is_redacted() {
    let salt = Salt::new("hunter2");
    assert!(!format!("{salt:?}").contains("hunter2"));
  }
}
