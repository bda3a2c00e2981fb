//! In-memory transaction engine
//!
//! The session core treats the storage layer as a collaborator. This crate
//! is that collaborator: an in-memory engine with
//! - transactions carrying a monotonic savepoint counter and an undo log,
//! - row-locking `TransactionMap`s over ordered key/row storage,
//! - an append index allocating synthetic keys for primary-key-less inserts,
//! - a redo-log thread that runs commit callbacks after the log flush.
//!
//! Isolation levels are recorded on the transaction and honored by this
//! engine's contract (writes are locked, reads see committed state); the
//! session layer never reorders commits around it.

mod engine;
mod index;
mod map;
mod transaction;
mod value;

pub use engine::TransactionEngine;
pub use index::AppendIndex;
pub use map::{PutOutcome, Row, TransactionMap};
pub use transaction::{Transaction, TransactionListener, TransactionStatus};
pub use value::{LobHandle, Value};
