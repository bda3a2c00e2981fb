//! Common types for the Opal session core
//!
//! This crate defines:
//! - The database error type and result alias
//! - Transaction isolation levels
//! - A time-based expiring map
//! - Callback aliases for the asynchronous command surface
//! - Wall-clock helpers

mod callback;
mod error;
mod expiring;
mod isolation;
mod time;

pub use callback::{AsyncHandler, AsyncResult, CommitCallback};
pub use error::{DbError, Result};
pub use expiring::ExpiringMap;
pub use isolation::IsolationLevel;
pub use time::now_millis;
