//! Database object locks
//!
//! A `DbObjectLock` guards one catalog object (table, index, schema, ...).
//! At most one session holds it; waiters queue with a listener and are woken
//! when the holder releases. The holder always appears in its own session's
//! lock list exactly once; callers manage that list, the lock only manages
//! ownership and the queue.

use crate::session::Session;
use opal_engine::TransactionListener;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// Kind of catalog object a lock guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbObjectType {
    Database,
    Schema,
    Table,
    Index,
    Constraint,
}

struct LockWaiter {
    session: Weak<Session>,
    session_id: u64,
    listener: Arc<dyn TransactionListener>,
}

/// Lock on a single database object
pub struct DbObjectLock {
    object_type: DbObjectType,
    object_name: String,
    self_weak: Weak<DbObjectLock>,
    owner: Mutex<Option<Weak<Session>>>,
    waiting: Mutex<Vec<LockWaiter>>,
    retry_replication_names: Mutex<Vec<String>>,
}

impl DbObjectLock {
    pub fn new(object_type: DbObjectType, object_name: impl Into<String>) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            object_type,
            object_name: object_name.into(),
            self_weak: self_weak.clone(),
            owner: Mutex::new(None),
            waiting: Mutex::new(Vec::new()),
            retry_replication_names: Mutex::new(Vec::new()),
        })
    }

    pub fn object_type(&self) -> DbObjectType {
        self.object_type
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Current holder, if alive
    pub fn owner(&self) -> Option<Arc<Session>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Try to take the lock for `session`; re-entrant for the holder
    ///
    /// On first acquisition the lock is appended to the session's lock list.
    pub fn try_lock(&self, session: &Session) -> bool {
        {
            let mut owner = self.owner.lock();
            match owner.as_ref().and_then(Weak::upgrade) {
                Some(current) => return current.id() == session.id(),
                None => *owner = Some(session.weak()),
            }
        }
        if let Some(lock) = self.self_weak.upgrade() {
            session.add_lock(lock);
        }
        true
    }

    /// Queue `session` behind the current holder (at most once)
    pub fn add_waiting(&self, session: &Session, listener: Arc<dyn TransactionListener>) {
        let mut waiting = self.waiting.lock();
        if waiting.iter().any(|w| w.session_id == session.id()) {
            return;
        }
        waiting.push(LockWaiter {
            session: session.weak(),
            session_id: session.id(),
            listener,
        });
    }

    /// Remove a queued waiter (its wait timed out or its session closed)
    pub fn remove_waiting(&self, session_id: u64) {
        self.waiting.lock().retain(|w| w.session_id != session_id);
    }

    /// Release the lock held by `session`
    ///
    /// With `new_owner` the ownership transfers atomically (replication
    /// conflict resolution); otherwise every waiter is woken to race for the
    /// lock on its next dispatch. `succeeded` records whether the guarded
    /// operation committed; the catalog layer has already applied or undone
    /// its changes by the time the lock is released.
    pub fn unlock(&self, session: &Session, succeeded: bool, new_owner: Option<&Session>) {
        {
            let mut owner = self.owner.lock();
            let held_by_session = owner
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|s| s.id() == session.id())
                .unwrap_or(false);
            if !held_by_session {
                return;
            }
            *owner = new_owner.map(Session::weak);
        }
        tracing::debug!(
            object = %self.object_name,
            session = session.id(),
            succeeded,
            transferred = new_owner.is_some(),
            "object lock released"
        );
        match new_owner {
            Some(next) => {
                if let Some(lock) = self.self_weak.upgrade() {
                    next.add_lock(lock);
                }
            }
            None => self.wake_waiters(),
        }
    }

    fn wake_waiters(&self) {
        let drained: Vec<LockWaiter> = self.waiting.lock().drain(..).collect();
        for waiter in drained {
            if waiter.session.upgrade().is_some() {
                waiter.listener.wake();
            }
        }
    }

    /// Number of queued waiters
    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Install the replication retry-name list on this lock
    pub fn set_retry_replication_names(&self, names: &[String]) {
        *self.retry_replication_names.lock() = names.to_vec();
    }

    pub fn retry_replication_names(&self) -> Vec<String> {
        self.retry_replication_names.lock().clone()
    }
}

impl fmt::Debug for DbObjectLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbObjectLock")
            .field("object_type", &self.object_type)
            .field("object_name", &self.object_name)
            .field("waiting", &self.waiting_count())
            .finish()
    }
}
