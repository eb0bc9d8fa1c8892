//! Core types and trait definitions for rxledger, a prescription lifecycle
//! engine modelled on extended-UTxO records.
//!
//! This crate is deliberately free of HTTP and database dependencies. The
//! record model and transaction builder are pure; storage, consent, and time
//! are reached only through the traits defined here.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod builder;
pub mod clock;
pub mod codec;
pub mod commitment;
pub mod consent;
pub mod error;
pub mod event;
pub mod ledger;
pub mod lifecycle;
pub mod mirror;
pub mod record;

pub use error::{Error, Result, TransitionError, ValidationError};
