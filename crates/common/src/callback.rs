//! Callback aliases for the asynchronous command surface
//!
//! Statement execution and commit are asynchronous from the wire layer's
//! point of view: the caller registers a handler and the session invokes it
//! once on the handler thread that completes the work. Handlers must be
//! non-blocking.

use crate::error::DbError;

/// Result delivered to an async handler
pub type AsyncResult<T> = Result<T, DbError>;

/// One-shot handler for an asynchronous statement result
pub type AsyncHandler<T> = Box<dyn FnOnce(AsyncResult<T>) + Send>;

/// One-shot callback invoked after the commit log flush
pub type CommitCallback = Box<dyn FnOnce() + Send>;
