//! Handlers for `/prescriptions` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/prescriptions` | `Idempotency-Key` required; 201, or 200 on replay |
//! | `GET`  | `/prescriptions` | `?issuer&patient&status&limit&offset` |
//! | `GET`  | `/prescriptions/:id` | Mirror row and live version |
//! | `POST` | `/prescriptions/:id/redeem` | `Idempotency-Key` required |
//! | `POST` | `/prescriptions/:id/refill` | `Idempotency-Key` required |
//! | `POST` | `/prescriptions/:id/consent` | Sends a one-time code; 202 |
//!
//! Transition endpoints return the unsigned request for the caller to sign
//! and hand to `POST /submissions`.

use axum::{
  Json,
  extract::{
    Path, Query, State,
    rejection::{JsonRejection, PathRejection, QueryRejection},
  },
  http::{HeaderMap, StatusCode},
  response::IntoResponse,
};
use rxledger_core::{
  consent::ConsentGate,
  ledger::Ledger,
  mirror::{MirrorQuery, MirrorRecord, MirrorStore},
  record::ActorId,
};
use rxledger_service::service::{
  ConsentRequested, CreatePrescription, PrescriptionView, RedeemPrescription,
  RefillPrescription, TransitionOutcome,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{SharedService, error::ApiError};

pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

fn idempotency_key(headers: &HeaderMap) -> Result<&str, ApiError> {
  headers
    .get(IDEMPOTENCY_KEY)
    .and_then(|v| v.to_str().ok())
    .map(str::trim)
    .filter(|k| !k.is_empty())
    .ok_or(ApiError::MissingIdempotencyKey)
}

// ─── Create ──────────────────────────────────────────────────────────────────

/// `POST /prescriptions`
pub async fn create<L, M, G>(
  State(service): State<SharedService<L, M, G>>,
  headers: HeaderMap,
  body: Result<Json<CreatePrescription>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError>
where
  L: Ledger + 'static,
  M: MirrorStore + 'static,
  G: ConsentGate + 'static,
{
  let key = idempotency_key(&headers)?;
  let Json(body) = body?;
  let outcome = service.create_prescription(body, key).await?;
  let status = if outcome.replayed { StatusCode::OK } else { StatusCode::CREATED };
  Ok((status, Json(outcome)))
}

// ─── Search ──────────────────────────────────────────────────────────────────

/// `GET /prescriptions[?issuer=&patient=&status=&limit=&offset=]`
pub async fn list<L, M, G>(
  State(service): State<SharedService<L, M, G>>,
  query: Result<Query<MirrorQuery>, QueryRejection>,
) -> Result<Json<Vec<MirrorRecord>>, ApiError>
where
  L: Ledger + 'static,
  M: MirrorStore + 'static,
  G: ConsentGate + 'static,
{
  let Query(query) = query?;
  Ok(Json(service.search(query).await?))
}

/// `GET /prescriptions/:id`
pub async fn get_one<L, M, G>(
  State(service): State<SharedService<L, M, G>>,
  id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<PrescriptionView>, ApiError>
where
  L: Ledger + 'static,
  M: MirrorStore + 'static,
  G: ConsentGate + 'static,
{
  let Path(id) = id?;
  Ok(Json(service.get_prescription(id).await?))
}

// ─── Transitions ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RedeemBody {
  pub dispenser:    ActorId,
  #[serde(default)]
  pub consent_code: Option<String>,
}

/// `POST /prescriptions/:id/redeem`
pub async fn redeem<L, M, G>(
  State(service): State<SharedService<L, M, G>>,
  id: Result<Path<Uuid>, PathRejection>,
  headers: HeaderMap,
  body: Result<Json<RedeemBody>, JsonRejection>,
) -> Result<Json<TransitionOutcome>, ApiError>
where
  L: Ledger + 'static,
  M: MirrorStore + 'static,
  G: ConsentGate + 'static,
{
  let key = idempotency_key(&headers)?;
  let (Path(id), Json(body)) = (id?, body?);
  let input = RedeemPrescription {
    record_id:    id,
    dispenser:    body.dispenser,
    consent_code: body.consent_code,
  };
  Ok(Json(service.redeem_prescription(input, key).await?))
}

#[derive(Debug, Deserialize)]
pub struct RefillBody {
  pub actor:        ActorId,
  #[serde(default)]
  pub consent_code: Option<String>,
}

/// `POST /prescriptions/:id/refill`
pub async fn refill<L, M, G>(
  State(service): State<SharedService<L, M, G>>,
  id: Result<Path<Uuid>, PathRejection>,
  headers: HeaderMap,
  body: Result<Json<RefillBody>, JsonRejection>,
) -> Result<Json<TransitionOutcome>, ApiError>
where
  L: Ledger + 'static,
  M: MirrorStore + 'static,
  G: ConsentGate + 'static,
{
  let key = idempotency_key(&headers)?;
  let (Path(id), Json(body)) = (id?, body?);
  let input = RefillPrescription {
    record_id:    id,
    actor:        body.actor,
    consent_code: body.consent_code,
  };
  Ok(Json(service.refill_prescription(input, key).await?))
}

/// `POST /prescriptions/:id/consent`
pub async fn request_consent<L, M, G>(
  State(service): State<SharedService<L, M, G>>,
  id: Result<Path<Uuid>, PathRejection>,
) -> Result<(StatusCode, Json<ConsentRequested>), ApiError>
where
  L: Ledger + 'static,
  M: MirrorStore + 'static,
  G: ConsentGate + 'static,
{
  let Path(id) = id?;
  let requested = service.request_consent(id).await?;
  Ok((StatusCode::ACCEPTED, Json(requested)))
}
