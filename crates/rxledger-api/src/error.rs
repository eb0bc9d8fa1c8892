//! API error type and [`axum::response::IntoResponse`] implementation.
//!
//! Every error body is `{ "error", "kind", "retryable" }`. `kind` is stable
//! and machine-readable; `retryable` tells the caller whether repeating the
//! request (with the same idempotency key) can succeed.

use axum::{
  Json,
  extract::rejection::{JsonRejection, PathRejection, QueryRejection},
  http::StatusCode,
  response::{IntoResponse, Response},
};
use rxledger_core::TransitionError;
use rxledger_service::Error as ServiceError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
  #[error("missing Idempotency-Key header")]
  MissingIdempotencyKey,

  /// The body, path or query string could not be extracted.
  #[error("bad request: {0}")]
  BadRequest(String),

  #[error(transparent)]
  Service(#[from] ServiceError),
}

impl From<JsonRejection> for ApiError {
  fn from(rejection: JsonRejection) -> Self { Self::BadRequest(rejection.body_text()) }
}

impl From<PathRejection> for ApiError {
  fn from(rejection: PathRejection) -> Self { Self::BadRequest(rejection.body_text()) }
}

impl From<QueryRejection> for ApiError {
  fn from(rejection: QueryRejection) -> Self { Self::BadRequest(rejection.body_text()) }
}

fn transition_status(e: &TransitionError) -> StatusCode {
  match e {
    TransitionError::Expired { .. }
    | TransitionError::NoRefillsRemaining
    | TransitionError::StaleReference { .. } => StatusCode::CONFLICT,
    TransitionError::Unauthorized { .. } | TransitionError::ConsentInvalid => StatusCode::FORBIDDEN,
    TransitionError::ConsentRequired => StatusCode::PRECONDITION_REQUIRED,
    TransitionError::InvalidAction { .. } => StatusCode::UNPROCESSABLE_ENTITY,
  }
}

impl ApiError {
  pub fn status(&self) -> StatusCode {
    match self {
      Self::MissingIdempotencyKey | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
      Self::Service(e) => match e {
        ServiceError::Validation(_) | ServiceError::IdempotencyConflict { .. } => {
          StatusCode::UNPROCESSABLE_ENTITY
        }
        ServiceError::Transition(t) => transition_status(t),
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::AlreadyExists(_) => StatusCode::CONFLICT,
        ServiceError::StoreTimeout { .. }
        | ServiceError::StoreUnavailable(_)
        | ServiceError::Mirror(_)
        | ServiceError::Consent(_) => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Core(_) | ServiceError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
      },
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Self::MissingIdempotencyKey => "missing_idempotency_key",
      Self::BadRequest(_) => "bad_request",
      Self::Service(e) => e.kind(),
    }
  }

  pub fn retryable(&self) -> bool {
    match self {
      Self::MissingIdempotencyKey | Self::BadRequest(_) => false,
      Self::Service(e) => e.is_retryable(),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      error!(kind = self.kind(), error = %self, "request failed");
    }
    let body = json!({
      "error": self.to_string(),
      "kind": self.kind(),
      "retryable": self.retryable(),
    });
    (status, Json(body)).into_response()
  }
}
