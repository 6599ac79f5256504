//! Core types and pure logic for the bidline tender pipeline.
//!
//! This crate is deliberately free of HTTP and database dependencies. It
//! holds the revision ledger model, hashing, change detection, scoring, the
//! delivery state machine and the job retry policy, plus the [`TenderStore`]
//! trait every backend implements.
//!
//! [`TenderStore`]: store::TenderStore

// Native `async fn` in traits; the store trait spells out `Send` futures.
#![allow(async_fn_in_trait)]

pub mod change;
pub mod delivery;
pub mod error;
pub mod hash;
pub mod index;
pub mod jobs;
pub mod matching;
pub mod retry;
pub mod store;
pub mod subscription;
pub mod tender;

pub use error::{Error, Result};
