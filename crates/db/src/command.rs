//! Yieldable commands
//!
//! A yieldable is a resumable unit of statement work. Its `run` must return
//! promptly: it either completes the statement, yields after recording why
//! the session cannot progress (status `Waiting`), or returns an error for
//! the dispatching handler to route to the registered async handler.

use opal_common::{DbError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// A resumable unit of statement work
pub trait Yieldable: Send {
    /// Execute one work quantum; non-blocking
    fn run(&mut self) -> Result<()>;

    /// Abandon the command without delivering a result
    fn stop(&mut self);

    /// Rewind one step so the next `run` repeats the interrupted work
    fn back(&mut self);

    /// Deliver an error to the registered async handler
    fn on_error(&mut self, error: DbError);

    /// Dispatch priority; higher runs first within a handler
    fn priority(&self) -> i32 {
        0
    }
}

/// A yieldable bound to its originating request and session
///
/// Cloneable so the scheduler can take a handle out of the session slot
/// without emptying it; the inner mutex is uncontended because a session is
/// dispatched by at most one handler at a time.
#[derive(Clone)]
pub struct YieldableCommand {
    packet_id: i32,
    session_id: u64,
    inner: Arc<Mutex<Box<dyn Yieldable>>>,
}

impl YieldableCommand {
    pub fn new(packet_id: i32, session_id: u64, yieldable: Box<dyn Yieldable>) -> Self {
        Self {
            packet_id,
            session_id,
            inner: Arc::new(Mutex::new(yieldable)),
        }
    }

    /// Request-correlation id of the originating packet
    pub fn packet_id(&self) -> i32 {
        self.packet_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn priority(&self) -> i32 {
        self.inner.lock().priority()
    }

    /// Run one work quantum
    pub fn run(&self) -> Result<()> {
        self.inner.lock().run()
    }

    /// Abandon without a result
    pub fn stop(&self) {
        self.inner.lock().stop();
    }

    /// Rewind one step
    pub fn back(&self) {
        self.inner.lock().back();
    }

    /// Route an error to the command's async handler
    pub fn on_error(&self, error: DbError) {
        self.inner.lock().on_error(error);
    }
}

/// Notified when a waiting session's transaction times out at dispatch
pub trait TimeoutListener: Send + Sync {
    fn on_timeout(&self, command: &YieldableCommand, error: &DbError);
}
