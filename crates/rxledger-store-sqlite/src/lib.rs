//! SQLite backends for rxledger.
//!
//! [`SqliteLedger`] is an authoritative store that enforces single consumption
//! of record versions with compare-and-swap updates. [`SqliteMirror`] holds the
//! query mirror, the idempotency table, the event outbox, and consent
//! challenges.
//!
//! Both wrap [`tokio_rusqlite`] so all database access runs on a dedicated
//! thread without blocking the async runtime.

mod encode;
mod ledger;
mod mirror;
mod schema;

pub mod error;

pub use error::{Error, Result};
pub use ledger::SqliteLedger;
pub use mirror::SqliteMirror;

#[cfg(test)]
mod tests;
