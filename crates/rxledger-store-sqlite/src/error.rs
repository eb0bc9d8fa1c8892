//! Error type for `rxledger-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] rxledger_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A column held a value no domain type accepts.
  #[error("undecodable column {column}: {value:?}")]
  Decode { column: &'static str, value: String },

  #[error("{0} does not fit in an SQLite integer")]
  OutOfRange(&'static str),

  #[error("mirror record not found: {0}")]
  RecordNotFound(uuid::Uuid),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
