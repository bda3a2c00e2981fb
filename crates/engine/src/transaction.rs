//! Engine-assigned transactions
//!
//! A transaction carries a monotonic savepoint counter (one tick per logged
//! write), an undo log for partial rollback, the set of row locks it holds,
//! and per-key queues of transactions waiting on those locks. The owning
//! session drives commit and rollback; waiters are woken through their
//! registered listeners when locks are released.

use crate::engine::TransactionEngine;
use crate::map::{Row, TransactionMap};
use opal_common::{CommitCallback, DbError, IsolationLevel, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Status of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionStatus {
    Open = 0,
    Committing = 1,
    Committed = 2,
    RolledBack = 3,
    /// Blocked on a lock held by another transaction
    Waiting = 4,
}

impl TransactionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionStatus::Open,
            1 => TransactionStatus::Committing,
            2 => TransactionStatus::Committed,
            3 => TransactionStatus::RolledBack,
            _ => TransactionStatus::Waiting,
        }
    }
}

/// Woken when a lock the listener's session waits on is released
pub trait TransactionListener: Send + Sync {
    fn wake(&self);
}

struct UndoEntry {
    map: Arc<TransactionMap>,
    key: i64,
    old: Option<Row>,
    savepoint: i32,
}

struct RowLockRecord {
    map: Arc<TransactionMap>,
    key: i64,
    savepoint: i32,
}

struct Waiter {
    transaction_id: u64,
    listener: Arc<dyn TransactionListener>,
}

struct WaitState {
    description: String,
    since: Instant,
    timeout_millis: u64,
}

/// An engine-assigned transaction
pub struct Transaction {
    id: u64,
    name: String,
    self_weak: Weak<Transaction>,
    engine: Weak<TransactionEngine>,
    auto_commit: bool,
    isolation: IsolationLevel,
    status: AtomicU8,
    session_id: AtomicU64,
    savepoint_id: AtomicI32,
    named_savepoints: Mutex<HashMap<String, i32>>,
    undo: Mutex<Vec<UndoEntry>>,
    row_locks: Mutex<Vec<RowLockRecord>>,
    waiting_transactions: Mutex<HashMap<i64, Vec<Waiter>>>,
    global_name: Mutex<Option<String>>,
    replication_name: Mutex<Option<String>>,
    retry_replication_names: Mutex<Vec<String>>,
    retry_savepoint_id: AtomicI32,
    wait_state: Mutex<Option<WaitState>>,
    /// Transaction currently blocking this one, if any
    locked_by: AtomicU64,
}

impl Transaction {
    pub(crate) fn new(
        id: u64,
        engine: Weak<TransactionEngine>,
        auto_commit: bool,
        isolation: IsolationLevel,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            id,
            name: format!("t-{}", id),
            self_weak: self_weak.clone(),
            engine,
            auto_commit,
            isolation,
            status: AtomicU8::new(TransactionStatus::Open as u8),
            session_id: AtomicU64::new(0),
            savepoint_id: AtomicI32::new(0),
            named_savepoints: Mutex::new(HashMap::new()),
            undo: Mutex::new(Vec::new()),
            row_locks: Mutex::new(Vec::new()),
            waiting_transactions: Mutex::new(HashMap::new()),
            global_name: Mutex::new(None),
            replication_name: Mutex::new(None),
            retry_replication_names: Mutex::new(Vec::new()),
            retry_savepoint_id: AtomicI32::new(0),
            wait_state: Mutex::new(None),
            locked_by: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Local transaction name, the stem of the global name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: TransactionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Owning session id (0 until attached)
    pub fn session_id(&self) -> u64 {
        self.session_id.load(Ordering::Acquire)
    }

    pub fn set_session_id(&self, session_id: u64) {
        self.session_id.store(session_id, Ordering::Release);
    }

    pub fn set_global_name(&self, name: Option<String>) {
        *self.global_name.lock() = name;
    }

    pub fn global_name(&self) -> Option<String> {
        self.global_name.lock().clone()
    }

    pub fn set_replication_name(&self, name: Option<String>) {
        *self.replication_name.lock() = name;
    }

    pub fn replication_name(&self) -> Option<String> {
        self.replication_name.lock().clone()
    }

    /// Transaction blocking this one (0 if none)
    pub fn locked_by(&self) -> u64 {
        self.locked_by.load(Ordering::Acquire)
    }

    pub fn set_locked_by(&self, transaction_id: u64) {
        self.locked_by.store(transaction_id, Ordering::Release);
    }

    // === Savepoints and undo ===

    /// Current savepoint id; advances by one per logged write
    pub fn savepoint_id(&self) -> i32 {
        self.savepoint_id.load(Ordering::Acquire)
    }

    /// Create a named savepoint at the current log position
    pub fn add_savepoint(&self, name: &str) {
        self.named_savepoints
            .lock()
            .insert(name.to_string(), self.savepoint_id());
    }

    /// Roll back to a named savepoint
    pub fn rollback_to_savepoint_name(&self, name: &str) -> Result<()> {
        let id = self
            .named_savepoints
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| DbError::NotFound(format!("savepoint {}", name)))?;
        self.rollback_to_savepoint(id);
        Ok(())
    }

    /// Undo every write logged after `savepoint` and release the row locks
    /// acquired since then
    pub fn rollback_to_savepoint(&self, savepoint: i32) {
        {
            let mut undo = self.undo.lock();
            while undo
                .last()
                .map_or(false, |entry| entry.savepoint > savepoint)
            {
                if let Some(entry) = undo.pop() {
                    entry.map.restore(entry.key, entry.old);
                }
            }
        }
        self.release_row_locks_after(savepoint);
        self.savepoint_id.store(savepoint, Ordering::Release);
        self.named_savepoints.lock().retain(|_, id| *id <= savepoint);
    }

    /// Log an undo record for a write; returns the new savepoint id
    pub(crate) fn log_undo(&self, map: Arc<TransactionMap>, key: i64, old: Option<Row>) -> i32 {
        let savepoint = self.savepoint_id.fetch_add(1, Ordering::AcqRel) + 1;
        self.undo.lock().push(UndoEntry {
            map,
            key,
            old,
            savepoint,
        });
        savepoint
    }

    /// Record a row lock acquired by this transaction
    pub(crate) fn record_row_lock(&self, map: Arc<TransactionMap>, key: i64) {
        let savepoint = self.savepoint_id() + 1;
        self.row_locks.lock().push(RowLockRecord {
            map,
            key,
            savepoint,
        });
    }

    fn release_row_locks_after(&self, savepoint: i32) {
        let released: Vec<RowLockRecord> = {
            let mut locks = self.row_locks.lock();
            let mut kept = Vec::with_capacity(locks.len());
            let mut dropped = Vec::new();
            for record in locks.drain(..) {
                if record.savepoint > savepoint {
                    dropped.push(record);
                } else {
                    kept.push(record);
                }
            }
            *locks = kept;
            dropped
        };
        for record in &released {
            record.map.unlock_row(self.id, record.key);
        }
        for record in &released {
            self.wake_waiters(record.key);
        }
    }

    fn release_all_row_locks(&self) {
        let released: Vec<RowLockRecord> = self.row_locks.lock().drain(..).collect();
        for record in &released {
            record.map.unlock_row(self.id, record.key);
        }
        self.wake_all_waiters();
    }

    // === Waiter queues ===

    /// Queue `waiter` behind the row lock on `key` held by this transaction
    pub fn add_waiting_transaction(
        &self,
        key: i64,
        waiter: u64,
        listener: Arc<dyn TransactionListener>,
    ) {
        self.waiting_transactions
            .lock()
            .entry(key)
            .or_default()
            .push(Waiter {
                transaction_id: waiter,
                listener,
            });
    }

    /// Remove a queued waiter (after its timeout elapsed)
    pub fn remove_waiting_transaction(&self, key: i64, waiter: u64) {
        let mut waiting = self.waiting_transactions.lock();
        if let Some(queue) = waiting.get_mut(&key) {
            queue.retain(|w| w.transaction_id != waiter);
            if queue.is_empty() {
                waiting.remove(&key);
            }
        }
    }

    fn wake_waiters(&self, key: i64) {
        let waiters = self.waiting_transactions.lock().remove(&key);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                waiter.listener.wake();
            }
        }
    }

    fn wake_all_waiters(&self) {
        let drained: Vec<Waiter> = {
            let mut waiting = self.waiting_transactions.lock();
            waiting.drain().flat_map(|(_, v)| v).collect()
        };
        for waiter in drained {
            waiter.listener.wake();
        }
    }

    // === Lock-wait bookkeeping ===

    /// Mark this transaction blocked; `check_timeout` raises once
    /// `timeout_millis` elapse
    pub fn set_waiting(&self, description: impl Into<String>, timeout_millis: u64) {
        *self.wait_state.lock() = Some(WaitState {
            description: description.into(),
            since: Instant::now(),
            timeout_millis,
        });
        self.set_status(TransactionStatus::Waiting);
    }

    /// Clear the blocked marker (the lock was granted)
    pub fn clear_waiting(&self) {
        *self.wait_state.lock() = None;
        self.set_locked_by(0);
        if self.status() == TransactionStatus::Waiting {
            self.set_status(TransactionStatus::Open);
        }
    }

    /// Raise `LockTimeout` if the current wait exceeded its bound
    pub fn check_timeout(&self) -> Result<()> {
        let expired = {
            let state = self.wait_state.lock();
            match state.as_ref() {
                Some(ws) if ws.since.elapsed().as_millis() as u64 >= ws.timeout_millis => {
                    Some(ws.description.clone())
                }
                _ => None,
            }
        };
        if let Some(description) = expired {
            *self.wait_state.lock() = None;
            return Err(DbError::LockTimeout(description));
        }
        Ok(())
    }

    // === Replication retry names ===

    /// Install the retry-name list together with the locked-row savepoint
    pub fn set_retry_replication_names(&self, names: &[String], locked_row_savepoint: i32) {
        *self.retry_replication_names.lock() = names.to_vec();
        self.retry_savepoint_id
            .store(locked_row_savepoint, Ordering::Release);
    }

    pub fn retry_replication_names(&self) -> Vec<String> {
        self.retry_replication_names.lock().clone()
    }

    /// Savepoint of the locked row the retry list was recorded against
    pub fn retry_savepoint_id(&self) -> i32 {
        self.retry_savepoint_id.load(Ordering::Acquire)
    }

    // === Commit / rollback ===

    /// Commit synchronously: flush the log, then finalize
    pub fn commit(&self) -> Result<()> {
        self.set_status(TransactionStatus::Committing);
        if let Some(engine) = self.engine.upgrade() {
            engine.flush_log_sync();
        }
        self.finalize_commit();
        Ok(())
    }

    /// Commit asynchronously: the callback runs on the log thread after the
    /// flush, once local state is finalized
    pub fn async_commit(&self, callback: CommitCallback) {
        self.set_status(TransactionStatus::Committing);
        let Some(txn) = self.self_weak.upgrade() else {
            return;
        };
        match self.engine.upgrade() {
            Some(engine) => engine.flush_log(Box::new(move || {
                txn.finalize_commit();
                callback();
            })),
            None => {
                // engine already shut down; nothing left to order against
                txn.finalize_commit();
                callback();
            }
        }
    }

    /// Phase 1 of a distributed commit: log the commit-ready record
    pub fn prepare_commit(&self, global_name: &str) -> Result<()> {
        self.set_global_name(Some(global_name.to_string()));
        if let Some(engine) = self.engine.upgrade() {
            engine.log_prepared(global_name);
        }
        Ok(())
    }

    /// Phase 2 of a distributed commit: finalize after the coordinator's
    /// decision record is durable
    pub fn commit_distributed(&self) {
        self.set_status(TransactionStatus::Committing);
        self.finalize_commit();
    }

    fn finalize_commit(&self) {
        self.undo.lock().clear();
        self.named_savepoints.lock().clear();
        self.release_all_row_locks();
        self.set_status(TransactionStatus::Committed);
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_transaction(self.id);
        }
        tracing::debug!(txn = self.id, "transaction committed");
    }

    /// Undo everything and release all locks
    pub fn rollback(&self) {
        self.rollback_to_savepoint(0);
        self.release_all_row_locks();
        self.named_savepoints.lock().clear();
        self.set_status(TransactionStatus::RolledBack);
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_transaction(self.id);
        }
        tracing::debug!(txn = self.id, "transaction rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn engine() -> Arc<TransactionEngine> {
        TransactionEngine::new()
    }

    fn row(key: i64, v: i32) -> Row {
        Row::new(key, vec![Value::Int(v)])
    }

    #[test]
    fn test_savepoint_rollback_restores_rows() {
        let engine = engine();
        let map = engine.get_map("t");
        let txn = engine.begin_transaction(false, IsolationLevel::default());

        map.put(&txn, 1, row(1, 1)).unwrap();
        let sp = txn.savepoint_id();
        map.put(&txn, 2, row(2, 2)).unwrap();
        assert!(map.get(2).is_some());

        txn.rollback_to_savepoint(sp);
        assert!(map.get(2).is_none());
        assert_eq!(map.get(1), Some(row(1, 1)));
        assert_eq!(txn.savepoint_id(), sp);
    }

    #[test]
    fn test_named_savepoint_roundtrip_restores_state() {
        let engine = engine();
        let map = engine.get_map("t");
        let txn = engine.begin_transaction(false, IsolationLevel::default());

        map.put(&txn, 1, row(1, 1)).unwrap();
        let before = txn.savepoint_id();
        txn.add_savepoint("a");
        map.put(&txn, 2, row(2, 2)).unwrap();
        txn.rollback_to_savepoint_name("a").unwrap();

        assert_eq!(txn.savepoint_id(), before);
        assert!(map.get(2).is_none());
    }

    #[test]
    fn test_rollback_releases_row_locks() {
        let engine = engine();
        let map = engine.get_map("t");
        let a = engine.begin_transaction(false, IsolationLevel::default());
        let b = engine.begin_transaction(false, IsolationLevel::default());

        map.put(&a, 1, row(1, 1)).unwrap();
        assert!(!map.try_lock_row(&b, 1));

        a.rollback();
        assert!(map.try_lock_row(&b, 1));
    }

    #[test]
    fn test_partial_rollback_keeps_earlier_locks() {
        let engine = engine();
        let map = engine.get_map("t");
        let a = engine.begin_transaction(false, IsolationLevel::default());
        let b = engine.begin_transaction(false, IsolationLevel::default());

        map.put(&a, 1, row(1, 1)).unwrap();
        let sp = a.savepoint_id();
        map.put(&a, 2, row(2, 2)).unwrap();

        a.rollback_to_savepoint(sp);
        assert!(!map.try_lock_row(&b, 1), "earlier lock must be preserved");
        assert!(map.try_lock_row(&b, 2), "later lock must be released");
    }

    #[test]
    fn test_waiter_woken_on_commit() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Flag(AtomicBool);
        impl TransactionListener for Flag {
            fn wake(&self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let engine = engine();
        let map = engine.get_map("t");
        let a = engine.begin_transaction(false, IsolationLevel::default());
        let b = engine.begin_transaction(false, IsolationLevel::default());

        map.put(&a, 1, row(1, 1)).unwrap();
        let listener = Arc::new(Flag(AtomicBool::new(false)));
        a.add_waiting_transaction(1, b.id(), listener.clone());

        a.commit().unwrap();
        assert!(listener.0.load(Ordering::SeqCst));
        assert!(map.try_lock_row(&b, 1));
    }

    #[test]
    fn test_check_timeout() {
        let engine = engine();
        let txn = engine.begin_transaction(false, IsolationLevel::default());

        txn.set_waiting("row 1 of t", 10);
        assert!(txn.check_timeout().is_ok());
        std::thread::sleep(std::time::Duration::from_millis(20));
        let err = txn.check_timeout().unwrap_err();
        assert!(matches!(err, DbError::LockTimeout(_)));
    }
}
