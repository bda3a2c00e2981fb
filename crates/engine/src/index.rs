//! Append index for primary-key-less inserts
//!
//! Synthetic keys are allocated from a monotonic counter. Under replication
//! the append lock serializes local appenders, and after a conflict the
//! resolver publishes a `replication name → start key` map so every replica
//! retries into its own deterministic range.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// Allocates synthetic row keys and carries append-conflict state
pub struct AppendIndex {
    next_key: AtomicI64,
    max_key: AtomicI64,
    name_to_start_key: Mutex<HashMap<String, i64>>,
    append_lock: Mutex<Option<u64>>,
}

impl AppendIndex {
    pub(crate) fn new() -> Self {
        Self {
            next_key: AtomicI64::new(1),
            max_key: AtomicI64::new(0),
            name_to_start_key: Mutex::new(HashMap::new()),
            append_lock: Mutex::new(None),
        }
    }

    /// Allocate `count` consecutive keys, returning the first
    ///
    /// Allocation never reuses keys below `max_key`, so ranges handed out by
    /// conflict resolution are not double-assigned.
    pub fn allocate(&self, count: i64) -> i64 {
        loop {
            let current = self.next_key.load(Ordering::Acquire);
            let start = current.max(self.max_key.load(Ordering::Acquire) + 1);
            if self
                .next_key
                .compare_exchange(current, start + count, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return start;
            }
        }
    }

    /// Raise the allocation floor (set by append conflict resolution)
    pub fn set_max_key(&self, max_key: i64) {
        self.max_key.store(max_key, Ordering::Release);
    }

    pub fn max_key(&self) -> i64 {
        self.max_key.load(Ordering::Acquire)
    }

    /// Publish the deterministic start key per replication name
    pub fn set_replication_start_keys(&self, map: HashMap<String, i64>) {
        *self.name_to_start_key.lock() = map;
    }

    /// Start key assigned to `replication_name` by conflict resolution
    pub fn assigned_start_key(&self, replication_name: &str) -> Option<i64> {
        self.name_to_start_key.lock().get(replication_name).copied()
    }

    /// Forget the assignment for `replication_name`
    pub fn remove_replication_name(&self, replication_name: &str) {
        self.name_to_start_key.lock().remove(replication_name);
    }

    /// Take the append lock for a session; re-entrant for the holder
    pub fn lock_append(&self, session_id: u64) -> bool {
        let mut lock = self.append_lock.lock();
        match *lock {
            Some(holder) => holder == session_id,
            None => {
                *lock = Some(session_id);
                true
            }
        }
    }

    /// Release the append lock if held by `session_id`
    pub fn unlock_append(&self, session_id: u64) {
        let mut lock = self.append_lock.lock();
        if *lock == Some(session_id) {
            *lock = None;
        }
    }

    /// Session currently holding the append lock
    pub fn append_lock_holder(&self) -> Option<u64> {
        *self.append_lock.lock()
    }
}
