//! Orchestration for rxledger: the prescription service, the reconciler that
//! keeps the mirror in step with the ledger, outbox delivery, and the one-time
//! code consent gate.
//!
//! Everything here is generic over the traits in `rxledger-core`; backends are
//! chosen by the binary.

pub mod config;
pub mod consent;
pub mod dispatch;
pub mod error;
pub mod reconciler;
pub mod service;

pub use config::{ConsentConfig, DispatcherConfig, ReconcilerConfig, ServiceConfig};
pub use consent::{MemoryConsentStore, OtpConsent};
pub use dispatch::{ConfiguredNotifier, NotificationDispatcher, Notifier};
pub use error::{Error, Result};
pub use reconciler::{Reconciler, SyncReport};
pub use service::PrescriptionService;
