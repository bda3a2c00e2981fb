//! Transactional key/row maps
//!
//! Writes take a per-key row lock owned by the writing transaction and log
//! an undo record into it; a blocked write reports the owning transaction so
//! the session layer can queue a waiter instead of blocking the handler.

use crate::index::AppendIndex;
use crate::transaction::Transaction;
use crate::value::Value;
use opal_common::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

/// A stored row: synthetic key plus column values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: i64,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(key: i64, values: Vec<Value>) -> Self {
        Self { key, values }
    }
}

/// Outcome of a transactional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The write was applied
    Ok,
    /// The row lock is held by another transaction
    Blocked {
        /// Id of the owning transaction
        owner: u64,
    },
}

/// An ordered map of rows with per-key transactional locks
pub struct TransactionMap {
    name: String,
    self_weak: Weak<TransactionMap>,
    rows: RwLock<BTreeMap<i64, Row>>,
    row_locks: Mutex<HashMap<i64, u64>>,
    append: AppendIndex,
}

impl TransactionMap {
    pub(crate) fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            name: name.into(),
            self_weak: self_weak.clone(),
            rows: RwLock::new(BTreeMap::new()),
            row_locks: Mutex::new(HashMap::new()),
            append: AppendIndex::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The append index allocating synthetic keys for this map
    pub fn append_index(&self) -> &AppendIndex {
        &self.append
    }

    /// Read a committed-or-own row
    pub fn get(&self, key: i64) -> Option<Row> {
        self.rows.read().get(&key).cloned()
    }

    /// Snapshot of all rows in key order
    pub fn scan(&self) -> Vec<Row> {
        self.rows.read().values().cloned().collect()
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().len() == 0
    }

    /// Try to take the row lock on `key` for `txn` (re-entrant)
    pub fn try_lock_row(&self, txn: &Arc<Transaction>, key: i64) -> bool {
        let mut locks = self.row_locks.lock();
        match locks.get(&key) {
            Some(owner) if *owner == txn.id() => true,
            Some(_) => false,
            None => {
                locks.insert(key, txn.id());
                drop(locks);
                if let Some(map) = self.self_weak.upgrade() {
                    txn.record_row_lock(map, key);
                }
                true
            }
        }
    }

    /// Owner of the row lock on `key`, if any
    pub fn row_lock_owner(&self, key: i64) -> Option<u64> {
        self.row_locks.lock().get(&key).copied()
    }

    /// Write a row under `txn`, taking the row lock
    pub fn put(&self, txn: &Arc<Transaction>, key: i64, row: Row) -> Result<PutOutcome> {
        if let Some(owner) = self.lock_or_owner(txn, key) {
            return Ok(PutOutcome::Blocked { owner });
        }
        let old = {
            let mut rows = self.rows.write();
            rows.insert(key, row)
        };
        if let Some(map) = self.self_weak.upgrade() {
            txn.log_undo(map, key, old);
        }
        Ok(PutOutcome::Ok)
    }

    /// Remove a row under `txn`, taking the row lock
    pub fn remove(&self, txn: &Arc<Transaction>, key: i64) -> Result<PutOutcome> {
        if let Some(owner) = self.lock_or_owner(txn, key) {
            return Ok(PutOutcome::Blocked { owner });
        }
        let old = {
            let mut rows = self.rows.write();
            rows.remove(&key)
        };
        if let Some(map) = self.self_weak.upgrade() {
            txn.log_undo(map, key, old);
        }
        Ok(PutOutcome::Ok)
    }

    /// Truncate every row (session-temp table semantics; no undo)
    pub fn clear(&self) {
        self.rows.write().clear();
        self.row_locks.lock().clear();
    }

    fn lock_or_owner(&self, txn: &Arc<Transaction>, key: i64) -> Option<u64> {
        if self.try_lock_row(txn, key) {
            None
        } else {
            self.row_lock_owner(key)
        }
    }

    /// Release the row lock held by `txn_id` on `key`
    pub(crate) fn unlock_row(&self, txn_id: u64, key: i64) {
        let mut locks = self.row_locks.lock();
        if locks.get(&key) == Some(&txn_id) {
            locks.remove(&key);
        }
    }

    /// Restore a row to its pre-write state (undo application)
    pub(crate) fn restore(&self, key: i64, old: Option<Row>) {
        let mut rows = self.rows.write();
        match old {
            Some(row) => {
                rows.insert(key, row);
            }
            None => {
                rows.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransactionEngine;
    use opal_common::IsolationLevel;

    fn setup() -> (Arc<TransactionEngine>, Arc<TransactionMap>) {
        let engine = TransactionEngine::new();
        let map = engine.get_map("t");
        (engine, map)
    }

    #[test]
    fn test_put_get_scan() {
        let (engine, map) = setup();
        let txn = engine.begin_transaction(true, IsolationLevel::default());

        map.put(&txn, 2, Row::new(2, vec![Value::Int(2)])).unwrap();
        map.put(&txn, 1, Row::new(1, vec![Value::Int(1)])).unwrap();

        assert_eq!(map.get(1).unwrap().values, vec![Value::Int(1)]);
        let keys: Vec<i64> = map.scan().iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![1, 2], "scan is key ordered");
    }

    #[test]
    fn test_blocked_write_reports_owner() {
        let (engine, map) = setup();
        let a = engine.begin_transaction(false, IsolationLevel::default());
        let b = engine.begin_transaction(false, IsolationLevel::default());

        map.put(&a, 1, Row::new(1, vec![Value::Int(1)])).unwrap();
        let outcome = map.put(&b, 1, Row::new(1, vec![Value::Int(9)])).unwrap();
        assert_eq!(outcome, PutOutcome::Blocked { owner: a.id() });
        // the blocked write must not have been applied
        assert_eq!(map.get(1).unwrap().values, vec![Value::Int(1)]);
    }

    #[test]
    fn test_row_lock_is_reentrant() {
        let (engine, map) = setup();
        let a = engine.begin_transaction(false, IsolationLevel::default());

        map.put(&a, 1, Row::new(1, vec![Value::Int(1)])).unwrap();
        let outcome = map.put(&a, 1, Row::new(1, vec![Value::Int(2)])).unwrap();
        assert_eq!(outcome, PutOutcome::Ok);
        assert_eq!(map.get(1).unwrap().values, vec![Value::Int(2)]);
    }

    #[test]
    fn test_remove_is_undoable() {
        let (engine, map) = setup();
        let txn = engine.begin_transaction(false, IsolationLevel::default());

        map.put(&txn, 1, Row::new(1, vec![Value::Int(1)])).unwrap();
        let sp = txn.savepoint_id();
        map.remove(&txn, 1).unwrap();
        assert!(map.get(1).is_none());

        txn.rollback_to_savepoint(sp);
        assert!(map.get(1).is_some());
    }
}
