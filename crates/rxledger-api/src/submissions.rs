//! Handlers for `/submissions` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/submissions` | Body: a signed request; returns the receipt |
//! | `GET`  | `/submissions/:id` | `accepted`, `rejected` or `unknown` |

use axum::{
  Json,
  extract::{
    Path, State,
    rejection::{JsonRejection, PathRejection},
  },
};
use rxledger_core::{
  builder::SignedRequest,
  consent::ConsentGate,
  ledger::{Ledger, Receipt, RequestStatus},
  mirror::MirrorStore,
};
use uuid::Uuid;

use crate::{SharedService, error::ApiError};

/// `POST /submissions`
pub async fn submit<L, M, G>(
  State(service): State<SharedService<L, M, G>>,
  signed: Result<Json<SignedRequest>, JsonRejection>,
) -> Result<Json<Receipt>, ApiError>
where
  L: Ledger + 'static,
  M: MirrorStore + 'static,
  G: ConsentGate + 'static,
{
  let Json(signed) = signed?;
  Ok(Json(service.submit(signed).await?))
}

/// `GET /submissions/:id`
pub async fn status<L, M, G>(
  State(service): State<SharedService<L, M, G>>,
  id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<RequestStatus>, ApiError>
where
  L: Ledger + 'static,
  M: MirrorStore + 'static,
  G: ConsentGate + 'static,
{
  let Path(id) = id?;
  Ok(Json(service.request_status(id).await?))
}
