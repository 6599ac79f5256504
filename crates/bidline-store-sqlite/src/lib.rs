//! SQLite backend for the bidline revision ledger.
//!
//! Wraps [`tokio_rusqlite`] so all database access runs on a dedicated thread
//! without blocking the async runtime. Every multi-row write (revision append,
//! chunk batch, dead-lettering) is a single SQLite transaction.

mod encode;
mod index;
mod ledger;
mod outbox;
mod queue;
mod schema;
mod store;

pub mod error;

pub use error::{Error, Result};
pub use store::SqliteStore;

#[cfg(test)]
mod tests;
