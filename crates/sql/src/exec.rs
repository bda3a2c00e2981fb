//! Synchronous execution drivers
//!
//! Convenience wrappers for embedded callers and tests: submit a yieldable
//! command and pump the session's dispatch gate on the calling thread until
//! the registered handler fires. The pump behaves like a handler: it runs
//! one quantum at a time, checks wait timeouts, and routes failed runs back
//! through the session.

use opal_common::{AsyncResult, DbError, Result};
use opal_db::{LocalResult, PreparedStatement, Session};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bound on how long a driver pumps before giving up
const DRIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Prepare and execute an update statement, returning its update count
pub fn execute_update(session: &Arc<Session>, sql: &str) -> Result<i32> {
    let statement = session.prepare(sql, -1)?;
    execute_update_stmt(session, &statement)
}

/// Execute a prepared update statement
pub fn execute_update_stmt(
    session: &Arc<Session>,
    statement: &Arc<dyn PreparedStatement>,
) -> Result<i32> {
    let slot: Arc<Mutex<Option<AsyncResult<i32>>>> = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    let yieldable = statement.create_yieldable_update(
        session.clone(),
        Box::new(move |result| {
            *sink.lock() = Some(result);
        }),
    )?;
    session.submit_yieldable_command(statement.id(), yieldable)?;
    drive(session, &slot)
}

/// Prepare and execute a query, returning the materialized result
pub fn execute_query(session: &Arc<Session>, sql: &str) -> Result<Arc<LocalResult>> {
    let statement = session.prepare(sql, -1)?;
    execute_query_stmt(session, &statement)
}

/// Execute a prepared query statement
pub fn execute_query_stmt(
    session: &Arc<Session>,
    statement: &Arc<dyn PreparedStatement>,
) -> Result<Arc<LocalResult>> {
    let slot: Arc<Mutex<Option<AsyncResult<Arc<LocalResult>>>>> = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    let yieldable = statement.create_yieldable_query(
        session.clone(),
        Box::new(move |result| {
            *sink.lock() = Some(result);
        }),
    )?;
    session.submit_yieldable_command(statement.id(), yieldable)?;
    drive(session, &slot)
}

fn drive<T>(session: &Arc<Session>, slot: &Arc<Mutex<Option<AsyncResult<T>>>>) -> Result<T> {
    let deadline = Instant::now() + DRIVE_TIMEOUT;
    loop {
        if let Some(result) = slot.lock().take() {
            return result;
        }
        if let Some(command) = session.yieldable_command(true, None) {
            if let Err(error) = command.run() {
                session.handle_command_failure(&command, error);
            }
        } else {
            // waiting on a lock, a commit flush, or another session's handler
            std::thread::sleep(Duration::from_millis(1));
        }
        if Instant::now() >= deadline {
            return Err(DbError::Internal(
                "statement did not complete in time".to_string(),
            ));
        }
    }
}
