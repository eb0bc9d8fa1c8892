//! JSON REST API for rxledger.
//!
//! Exposes an axum [`Router`] over a [`PrescriptionService`]. Signing, auth,
//! TLS, and transport concerns are the caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", rxledger_api::api_router(service.clone()))
//! ```

pub mod error;
pub mod prescriptions;
pub mod submissions;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use rxledger_core::{consent::ConsentGate, ledger::Ledger, mirror::MirrorStore};
use rxledger_service::PrescriptionService;

pub use error::ApiError;

pub type SharedService<L, M, G> = Arc<PrescriptionService<L, M, G>>;

/// Build a fully-materialised API router for `service`.
pub fn api_router<L, M, G>(service: SharedService<L, M, G>) -> Router<()>
where
  L: Ledger + 'static,
  M: MirrorStore + 'static,
  G: ConsentGate + 'static,
{
  Router::new()
    // Prescriptions
    .route(
      "/prescriptions",
      get(prescriptions::list::<L, M, G>).post(prescriptions::create::<L, M, G>),
    )
    .route("/prescriptions/{id}", get(prescriptions::get_one::<L, M, G>))
    .route("/prescriptions/{id}/redeem", post(prescriptions::redeem::<L, M, G>))
    .route("/prescriptions/{id}/refill", post(prescriptions::refill::<L, M, G>))
    .route("/prescriptions/{id}/consent", post(prescriptions::request_consent::<L, M, G>))
    // Submissions
    .route("/submissions", post(submissions::submit::<L, M, G>))
    .route("/submissions/{id}", get(submissions::status::<L, M, G>))
    .with_state(service)
}
