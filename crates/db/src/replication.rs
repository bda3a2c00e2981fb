//! Replication conflict resolution
//!
//! Replicas race to apply the same logical write under distinct replication
//! names. The winning candidate's session resolves the conflict so that
//! every replica, given the same retry-name list, derives the same outcome:
//! the first name in the list wins a lock conflict, and append conflicts are
//! settled by handing every claimant a deterministic key range.

use crate::session::Session;
use crate::status::SessionStatus;
use opal_common::Result;
use opal_engine::{Transaction, TransactionMap};
use opal_protocol::{
    AppendRetryName, ReplicationAck, ReplicationConflictType, ReplicationUpdateAck,
};
use std::collections::HashMap;
use std::sync::Arc;

/// A row this session holds the lock on, with the savepoint taken at lock
/// time so a conflict can rewind exactly to it
#[derive(Debug, Clone, Copy)]
pub struct LockedRow {
    pub key: i64,
    pub savepoint_id: i32,
}

/// Replication-scoped session state
pub(crate) struct ReplicationState {
    pub replication_name: Option<String>,
    pub last_replication_name: Option<String>,
    pub conflict_type: ReplicationConflictType,
    pub locked_exclusively_by: Option<Arc<Session>>,
    pub start_key: i64,
    pub append_count: i32,
    pub append_map: Option<Arc<TransactionMap>>,
    pub append_replication_name: Option<String>,
    pub ack_version: i32,
    pub is_final_result: bool,
    pub storage_replication_mode: bool,
    pub locked_row: Option<LockedRow>,
}

impl Default for ReplicationState {
    fn default() -> Self {
        Self {
            replication_name: None,
            last_replication_name: None,
            conflict_type: ReplicationConflictType::None,
            locked_exclusively_by: None,
            start_key: -1,
            append_count: 0,
            append_map: None,
            append_replication_name: None,
            ack_version: 0,
            is_final_result: false,
            storage_replication_mode: false,
            locked_row: None,
        }
    }
}

impl Session {
    // === Conflict state, set by the storage layer when it detects a race ===

    pub fn set_replication_conflict_type(&self, conflict_type: ReplicationConflictType) {
        self.replication.lock().conflict_type = conflict_type;
    }

    pub fn replication_conflict_type(&self) -> ReplicationConflictType {
        self.replication.lock().conflict_type
    }

    pub fn set_locked_exclusively_by(&self, session: Option<Arc<Session>>) {
        self.replication.lock().locked_exclusively_by = session;
    }

    pub fn set_start_key(&self, start_key: i64) {
        self.replication.lock().start_key = start_key;
    }

    pub fn set_append_count(&self, append_count: i32) {
        self.replication.lock().append_count = append_count;
    }

    pub fn set_append_map(&self, map: Option<Arc<TransactionMap>>) {
        self.replication.lock().append_map = map;
    }

    pub fn set_current_locked_row(&self, key: i64, savepoint_id: i32) {
        self.replication.lock().locked_row = Some(LockedRow { key, savepoint_id });
    }

    pub fn current_locked_row(&self) -> Option<LockedRow> {
        self.replication.lock().locked_row
    }

    pub fn is_final_result(&self) -> bool {
        self.replication.lock().is_final_result
    }

    pub fn set_final_result(&self, is_final_result: bool) {
        self.replication.lock().is_final_result = is_final_result;
    }

    pub fn is_storage_replication_mode(&self) -> bool {
        self.replication.lock().storage_replication_mode
    }

    pub fn set_storage_replication_mode(&self, mode: bool) {
        self.replication.lock().storage_replication_mode = mode;
    }

    pub fn ack_version(&self) -> i32 {
        self.replication.lock().ack_version
    }

    /// Whether the session sits on an unresolved replication conflict
    pub fn needs_handle_replication_conflict(&self) -> bool {
        let holder_known = self.replication.lock().locked_exclusively_by.is_some();
        if !holder_known {
            // resolve the blocking session through the engine's transaction
            let blocking = self
                .transaction()
                .map(|transaction| transaction.locked_by())
                .unwrap_or(0);
            if blocking != 0 {
                let holder = self
                    .database()
                    .transaction_engine()
                    .find_transaction(blocking)
                    .and_then(|transaction| {
                        self.database().find_session(transaction.session_id())
                    });
                if let Some(holder) = holder {
                    self.replication.lock().locked_exclusively_by = Some(holder);
                }
            }
        }
        let replication = self.replication.lock();
        replication.replication_name.is_some()
            && replication.conflict_type != ReplicationConflictType::None
    }

    // === Ack construction ===

    /// Build the ack describing the outcome of a replicated update
    ///
    /// `ack_version` increments per ack for the same statement so replicas
    /// can deduplicate retry notifications.
    pub fn create_replication_update_ack(
        &self,
        update_count: i32,
        prepared: bool,
    ) -> ReplicationAck {
        let (conflict_type, locked_by, start_key, append_count) = {
            let replication = self.replication.lock();
            (
                replication.conflict_type,
                replication.locked_exclusively_by.clone(),
                replication.start_key,
                replication.append_count,
            )
        };
        let mut update_count = update_count;
        let mut first = -1i64;
        let mut uncommitted_replication_name = None;
        match conflict_type {
            ReplicationConflictType::RowLock | ReplicationConflictType::DbObjectLock => {
                uncommitted_replication_name =
                    locked_by.as_ref().and_then(|holder| holder.replication_name());
            }
            ReplicationConflictType::Append => {
                if start_key >= 0 {
                    // the retry succeeded; the first ack's holder is obsolete
                    self.replication.lock().locked_exclusively_by = None;
                } else {
                    uncommitted_replication_name =
                        locked_by.as_ref().and_then(|holder| holder.replication_name());
                }
                first = start_key;
                update_count = append_count;
            }
            ReplicationConflictType::None => {}
        }
        let is_if_ddl = self
            .current_command()
            .map(|command| command.is_if_ddl())
            .unwrap_or(false);
        let (ack_version, is_final_result) = {
            let mut replication = self.replication.lock();
            replication.ack_version += 1;
            (replication.ack_version, replication.is_final_result)
        };
        let ack = ReplicationUpdateAck {
            update_count,
            first,
            uncommitted_replication_name,
            conflict_type,
            ack_version,
            is_if_ddl,
            is_final_result,
        };
        // inside a distributed transaction the participant variant is used
        if !self.is_root() && !self.is_auto_commit() {
            if prepared {
                ReplicationAck::DTransactionPreparedUpdate { ack, phase: 1 }
            } else {
                ReplicationAck::DTransactionUpdate(ack)
            }
        } else if prepared {
            ReplicationAck::PreparedUpdate { ack, phase: 1 }
        } else {
            ReplicationAck::Update(ack)
        }
    }

    // === Retry negotiation ===

    /// Apply the retry-name list to the transaction and to every held lock
    ///
    /// The list deliberately lands on all locks, not only the conflicting
    /// one; an unrelated lock's earlier retry list is overwritten.
    pub fn set_retry_replication_names(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        let locks = self.locks_snapshot();
        for lock in locks {
            lock.set_retry_replication_names(names);
        }
        let locked_row_savepoint = self
            .current_locked_row()
            .map(|row| row.savepoint_id)
            .unwrap_or(0);
        if let Some(transaction) = self.transaction() {
            transaction.set_retry_replication_names(names, locked_row_savepoint);
        }
    }

    /// Negotiate a replication conflict for this (winning) session
    pub fn handle_replica_conflict(&self, mut retry_names: Vec<String>) -> Result<()> {
        if self.is_storage_replication_mode() {
            return self.commit();
        }
        self.replication.lock().ack_version = 0;
        let conflict_type = self.replication_conflict_type();
        if matches!(
            conflict_type,
            ReplicationConflictType::RowLock | ReplicationConflictType::DbObjectLock
        ) {
            self.set_retry_replication_names(&retry_names);
        }
        match conflict_type {
            ReplicationConflictType::RowLock => {
                // this session's name wins: it goes first in the retry list,
                // and the row lock transfers from the current holder
                if let Some(own_name) = self.replication_name() {
                    retry_names.insert(0, own_name);
                }
                let holder = self.replication.lock().locked_exclusively_by.take();
                if let (Some(holder), Some(transaction)) = (holder, self.transaction()) {
                    holder.replica_rollback(&retry_names, &transaction);
                }
                self.replication.lock().conflict_type = ReplicationConflictType::None;
                self.raw_set_status(SessionStatus::Retrying);
                tracing::debug!(session = self.id(), "row lock conflict resolved");
                return Ok(());
            }
            ReplicationConflictType::DbObjectLock => {
                let holder = self.replication.lock().locked_exclusively_by.take();
                if let Some(holder) = holder {
                    // the retry list also reaches the deposed holder's locks
                    holder.set_retry_replication_names(&retry_names);
                    holder.rollback_current_command_transfer(self);
                    self.replication.lock().conflict_type = ReplicationConflictType::None;
                    self.raw_set_status(SessionStatus::Retrying);
                    tracing::debug!(session = self.id(), "object lock conflict resolved");
                    return Ok(());
                }
            }
            ReplicationConflictType::Append => {
                let assignments = derive_append_assignments(&retry_names)?;
                let holder = {
                    let mut replication = self.replication.lock();
                    replication.append_replication_name = replication.replication_name.clone();
                    replication.locked_exclusively_by.take()
                };
                if let Some(map) = self.replication.lock().append_map.clone() {
                    let index = map.append_index();
                    index.set_max_key(assignments.max_key);
                    index.set_replication_start_keys(assignments.start_keys);
                    index.unlock_append(self.id());
                    if let Some(holder) = holder {
                        index.unlock_append(holder.id());
                        holder.set_status(SessionStatus::RetryingReturnResult);
                    }
                }
                self.raw_set_status(SessionStatus::Retrying);
                tracing::debug!(
                    session = self.id(),
                    max_key = assignments.max_key,
                    "append conflict resolved"
                );
                return Ok(());
            }
            ReplicationConflictType::None => {}
        }
        // nothing to negotiate: clean up and idle
        self.clean_replication_state();
        let command = {
            let slot = self.yieldable_command_slot();
            self.set_yieldable_command(None);
            slot
        };
        if let Some(command) = command {
            command.stop();
        }
        if !self.is_auto_commit() {
            self.set_status(SessionStatus::StatementCompleted);
        }
        Ok(())
    }

    /// Loser side of a row-lock conflict: rewind to the locked-row
    /// savepoint and queue behind the winner keyed by the row
    pub(crate) fn replica_rollback(
        &self,
        retry_names: &[String],
        owner: &Arc<Transaction>,
    ) {
        let locked_row = self.current_locked_row();
        let savepoint = locked_row.map(|row| row.savepoint_id).unwrap_or(0);
        if let Some(transaction) = self.transaction() {
            transaction.set_retry_replication_names(retry_names, savepoint);
            transaction.rollback_to_savepoint(savepoint);
            if let Some(row) = locked_row {
                owner.add_waiting_transaction(row.key, transaction.id(), self.transaction_listener());
            }
        }
        if let Some(command) = self.yieldable_command_slot() {
            command.back();
        }
        self.raw_set_status(SessionStatus::Waiting);
    }

    /// Drop all replication-scoped state, deregistering this session's
    /// append assignment
    pub(crate) fn clean_replication_state(&self) {
        let mut replication = self.replication.lock();
        if let (Some(map), Some(name)) = (
            replication.append_map.clone(),
            replication.append_replication_name.clone(),
        ) {
            map.append_index().remove_replication_name(&name);
        }
        let last_replication_name = replication.last_replication_name.clone();
        *replication = ReplicationState {
            last_replication_name,
            ..ReplicationState::default()
        };
    }
}

struct AppendAssignments {
    max_key: i64,
    start_keys: HashMap<String, i64>,
}

/// Derive the deterministic `replication name → start key` map
///
/// Claims are ordered by their original start key (name as tiebreaker) and
/// packed contiguously from the smallest claimed key, so the result is
/// independent of the order the retry list arrived in.
fn derive_append_assignments(retry_names: &[String]) -> Result<AppendAssignments> {
    let mut entries = Vec::with_capacity(retry_names.len());
    for name in retry_names {
        entries.push(name.parse::<AppendRetryName>()?);
    }
    let min_key = entries.iter().map(|e| e.first).min().unwrap_or(0);
    let total: i64 = entries.iter().map(|e| e.count as i64).sum();
    entries.sort_by(|a, b| {
        (a.first, a.replication_name.as_str()).cmp(&(b.first, b.replication_name.as_str()))
    });
    let mut start_keys = HashMap::with_capacity(entries.len());
    let mut next = min_key;
    for entry in &entries {
        start_keys.insert(entry.replication_name.clone(), next);
        next += entry.count as i64;
    }
    Ok(AppendAssignments {
        max_key: min_key + total,
        start_keys,
    })
}
