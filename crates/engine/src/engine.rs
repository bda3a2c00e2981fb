//! The transaction engine
//!
//! Owns transaction id allocation, the map registry, the distributed-commit
//! record sets, and the redo-log thread. Log durability is simulated: flush
//! requests are serialized onto a dedicated thread and commit callbacks run
//! there once the flush completes, which preserves the ordering contract the
//! session layer depends on (unlink after flush, result after flush).

use crate::map::TransactionMap;
use crate::transaction::Transaction;
use crate::value::LobHandle;
use opal_common::{CommitCallback, IsolationLevel};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

enum LogTask {
    Flush(CommitCallback),
    Sync(Sender<()>),
    Shutdown,
}

/// The process-local transaction engine
pub struct TransactionEngine {
    self_weak: Weak<TransactionEngine>,
    next_txn_id: AtomicU64,
    next_lob_id: AtomicU64,
    maps: Mutex<HashMap<String, Arc<TransactionMap>>>,
    transactions: Mutex<HashMap<u64, Weak<Transaction>>>,
    prepared_globals: Mutex<HashSet<String>>,
    committed_globals: Mutex<HashSet<String>>,
    log_sender: Mutex<Option<Sender<LogTask>>>,
    log_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionEngine {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = channel::<LogTask>();
        let handle = std::thread::Builder::new()
            .name("redo-log".to_string())
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    match task {
                        LogTask::Flush(callback) => callback(),
                        LogTask::Sync(done) => {
                            let _ = done.send(());
                        }
                        LogTask::Shutdown => break,
                    }
                }
            })
            .ok();

        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            next_txn_id: AtomicU64::new(1),
            next_lob_id: AtomicU64::new(1),
            maps: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            prepared_globals: Mutex::new(HashSet::new()),
            committed_globals: Mutex::new(HashSet::new()),
            log_sender: Mutex::new(Some(sender)),
            log_thread: Mutex::new(handle),
        })
    }

    /// Begin a transaction with the session's commit mode and isolation level
    pub fn begin_transaction(&self, auto_commit: bool, isolation: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::AcqRel);
        let txn = Transaction::new(id, self.self_weak.clone(), auto_commit, isolation);
        self.transactions.lock().insert(id, Arc::downgrade(&txn));
        tracing::debug!(txn = id, auto_commit, "transaction started");
        txn
    }

    /// Resolve a live transaction by id
    pub fn find_transaction(&self, id: u64) -> Option<Arc<Transaction>> {
        self.transactions.lock().get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn remove_transaction(&self, id: u64) {
        self.transactions.lock().remove(&id);
    }

    /// Get or create the map with the given name
    pub fn get_map(&self, name: &str) -> Arc<TransactionMap> {
        let mut maps = self.maps.lock();
        maps.entry(name.to_string())
            .or_insert_with(|| TransactionMap::new(name))
            .clone()
    }

    /// Look up an existing map
    pub fn find_map(&self, name: &str) -> Option<Arc<TransactionMap>> {
        self.maps.lock().get(name).cloned()
    }

    /// Drop a map and its contents
    pub fn drop_map(&self, name: &str) {
        self.maps.lock().remove(name);
    }

    /// Allocate a LOB handle
    pub fn new_lob(&self) -> Arc<LobHandle> {
        LobHandle::new(self.next_lob_id.fetch_add(1, Ordering::AcqRel))
    }

    // === Redo log ===

    /// Queue a log flush; the callback runs on the log thread afterwards
    pub fn flush_log(&self, callback: CommitCallback) {
        let sender = self.log_sender.lock();
        match sender.as_ref() {
            Some(sender) if sender.send(LogTask::Flush(callback)).is_ok() => {}
            _ => {
                // log thread gone (shutdown path); nothing left to order against
            }
        }
    }

    /// Flush the log and wait for it to become durable
    pub fn flush_log_sync(&self) {
        let (done_tx, done_rx) = channel();
        let sent = {
            let sender = self.log_sender.lock();
            match sender.as_ref() {
                Some(sender) => sender.send(LogTask::Sync(done_tx)).is_ok(),
                None => false,
            }
        };
        if sent {
            let _ = done_rx.recv();
        }
    }

    // === Distributed commit records ===

    /// Log a commit-ready record for phase 1 of a distributed commit
    pub fn log_prepared(&self, global_name: &str) {
        self.prepared_globals.lock().insert(global_name.to_string());
        self.flush_log_sync();
        tracing::debug!(global = global_name, "commit-ready logged");
    }

    /// Log the coordinator's global commit decision
    pub fn record_commit_decision(&self, global_name: &str) {
        self.committed_globals
            .lock()
            .insert(global_name.to_string());
        self.flush_log_sync();
        tracing::debug!(global = global_name, "commit decision logged");
    }

    /// Whether a global transaction reached its commit decision
    pub fn validate_transaction(&self, global_name: &str) -> bool {
        self.committed_globals.lock().contains(global_name)
    }

    /// Whether a commit-ready record exists for the global transaction
    pub fn is_prepared(&self, global_name: &str) -> bool {
        self.prepared_globals.lock().contains(global_name)
    }
}

impl Drop for TransactionEngine {
    fn drop(&mut self) {
        if let Some(sender) = self.log_sender.lock().take() {
            let _ = sender.send(LogTask::Shutdown);
        }
        if let Some(handle) = self.log_thread.lock().take() {
            let _ = handle.join();
        }
    }
}
