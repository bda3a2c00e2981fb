//! Per-session resources
//!
//! Everything a session owns besides its transaction: local temporary
//! objects, temporary result handles, the LOB unlink set, the query cache,
//! and the cursor cache. Collections are allocated on first write because
//! many short-lived sessions never use them.

use crate::database::TableInfo;
use crate::result::TemporaryResult;
use crate::statement::PreparedStatement;
use lru::LruCache;
use opal_common::{DbError, ExpiringMap, Result};
use opal_engine::{TransactionEngine, TransactionMap, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Cap on tracked temporary results; further adds are silently ignored
const MAX_TEMPORARY_RESULTS: usize = 100;

/// A session-local temporary table
#[derive(Clone)]
pub struct TempTable {
    pub info: Arc<TableInfo>,
    pub map: Arc<TransactionMap>,
}

/// A session-local temporary index
#[derive(Debug, Clone)]
pub struct TempIndex {
    pub name: String,
    pub table_name: String,
}

/// A session-local temporary constraint
#[derive(Debug, Clone)]
pub struct TempConstraint {
    pub name: String,
    pub table_name: String,
}

/// A session-scoped stored procedure
#[derive(Debug, Clone)]
pub struct Procedure {
    pub name: String,
    pub sql: String,
}

/// A handle parked in the cursor cache for the wire layer
#[derive(Clone)]
pub enum CachedObject {
    Statement(Arc<dyn PreparedStatement>),
    Result(Arc<dyn TemporaryResult>),
}

/// Session-owned resources; guarded by the session's state mutex
#[derive(Default)]
pub struct SessionResources {
    temp_tables: Option<HashMap<String, TempTable>>,
    temp_indexes: Option<HashMap<String, TempIndex>>,
    temp_constraints: Option<HashMap<String, TempConstraint>>,
    procedures: Option<HashMap<String, Procedure>>,
    temporary_results: Option<Vec<Arc<dyn TemporaryResult>>>,
    unlink_lob_map: Option<HashMap<String, Value>>,
    pub(crate) query_cache: Option<LruCache<String, Arc<dyn PreparedStatement>>>,
    pub(crate) query_cache_meta_id: u64,
    cursor_cache: Option<ExpiringMap<i32, CachedObject>>,
}

impl SessionResources {
    // === Temporary tables ===

    pub fn add_temp_table(&mut self, table: TempTable) -> Result<()> {
        let key = table.info.name.to_ascii_lowercase();
        let tables = self.temp_tables.get_or_insert_with(HashMap::new);
        if tables.contains_key(&key) {
            return Err(DbError::TableOrViewAlreadyExists(table.info.name.clone()));
        }
        tables.insert(key, table);
        Ok(())
    }

    pub fn find_temp_table(&self, name: &str) -> Option<&TempTable> {
        self.temp_tables
            .as_ref()
            .and_then(|tables| tables.get(&name.to_ascii_lowercase()))
    }

    pub fn remove_temp_table(&mut self, name: &str) -> Option<TempTable> {
        self.temp_tables
            .as_mut()
            .and_then(|tables| tables.remove(&name.to_ascii_lowercase()))
    }

    /// Apply commit/close-time temp-table policy
    ///
    /// Dropping removes the backing map; truncation clears it in place.
    pub fn clean_temp_tables(&mut self, engine: &TransactionEngine, close_session: bool) {
        let Some(tables) = self.temp_tables.as_mut() else {
            return;
        };
        let mut dropped = Vec::new();
        for (key, table) in tables.iter() {
            use crate::database::OnCommit;
            if close_session || table.info.on_commit == OnCommit::Drop {
                dropped.push(key.clone());
            } else if table.info.on_commit == OnCommit::DeleteRows {
                table.map.clear();
            }
        }
        for key in dropped {
            if let Some(table) = tables.remove(&key) {
                engine.drop_map(table.map.name());
            }
        }
        if close_session {
            self.temp_tables = None;
        }
    }

    // === Temporary indexes and constraints ===

    pub fn add_temp_index(&mut self, index: TempIndex) -> Result<()> {
        let key = index.name.to_ascii_lowercase();
        let indexes = self.temp_indexes.get_or_insert_with(HashMap::new);
        if indexes.contains_key(&key) {
            return Err(DbError::IndexAlreadyExists(index.name.clone()));
        }
        indexes.insert(key, index);
        Ok(())
    }

    pub fn find_temp_index(&self, name: &str) -> Option<&TempIndex> {
        self.temp_indexes
            .as_ref()
            .and_then(|indexes| indexes.get(&name.to_ascii_lowercase()))
    }

    pub fn remove_temp_index(&mut self, name: &str) -> Option<TempIndex> {
        self.temp_indexes
            .as_mut()
            .and_then(|indexes| indexes.remove(&name.to_ascii_lowercase()))
    }

    pub fn add_temp_constraint(&mut self, constraint: TempConstraint) -> Result<()> {
        let key = constraint.name.to_ascii_lowercase();
        let constraints = self.temp_constraints.get_or_insert_with(HashMap::new);
        if constraints.contains_key(&key) {
            return Err(DbError::ConstraintAlreadyExists(constraint.name.clone()));
        }
        constraints.insert(key, constraint);
        Ok(())
    }

    pub fn find_temp_constraint(&self, name: &str) -> Option<&TempConstraint> {
        self.temp_constraints
            .as_ref()
            .and_then(|constraints| constraints.get(&name.to_ascii_lowercase()))
    }

    // === Procedures ===

    pub fn add_procedure(&mut self, procedure: Procedure) {
        self.procedures
            .get_or_insert_with(HashMap::new)
            .insert(procedure.name.to_ascii_lowercase(), procedure);
    }

    pub fn find_procedure(&self, name: &str) -> Option<&Procedure> {
        self.procedures
            .as_ref()
            .and_then(|procedures| procedures.get(&name.to_ascii_lowercase()))
    }

    pub fn remove_procedure(&mut self, name: &str) -> Option<Procedure> {
        self.procedures
            .as_mut()
            .and_then(|procedures| procedures.remove(&name.to_ascii_lowercase()))
    }

    // === Temporary results ===

    /// Track a result handle to close at commit; ignores handles that do not
    /// need closing and stops tracking at the cap
    pub fn add_temporary_result(&mut self, result: Arc<dyn TemporaryResult>) {
        if !result.needs_close() {
            return;
        }
        let results = self.temporary_results.get_or_insert_with(Vec::new);
        if results.len() >= MAX_TEMPORARY_RESULTS {
            return;
        }
        if results.iter().any(|r| Arc::ptr_eq(r, &result)) {
            return;
        }
        results.push(result);
    }

    /// Close every tracked result handle
    pub fn close_temporary_results(&mut self) {
        if let Some(results) = self.temporary_results.take() {
            for result in results {
                result.close();
            }
        }
    }

    pub fn temporary_result_count(&self) -> usize {
        self.temporary_results.as_ref().map_or(0, Vec::len)
    }

    // === LOB unlink set ===

    /// Remember that `value` must be unlinked at commit
    pub fn unlink_at_commit(&mut self, value: Value) {
        self.unlink_lob_map
            .get_or_insert_with(HashMap::new)
            .insert(value.to_string(), value);
    }

    /// Stop tracking `value` for unlink
    pub fn unlink_at_commit_stop(&mut self, value: &Value) {
        if let Some(map) = self.unlink_lob_map.as_mut() {
            map.remove(&value.to_string());
        }
    }

    /// Take the pending unlink set
    pub fn take_unlink_lobs(&mut self) -> Vec<Value> {
        self.unlink_lob_map
            .take()
            .map(|map| map.into_values().collect())
            .unwrap_or_default()
    }

    pub fn has_unlink_lobs(&self) -> bool {
        self.unlink_lob_map
            .as_ref()
            .map_or(false, |map| !map.is_empty())
    }

    // === Cursor cache ===

    /// Park an object for the wire layer under its integer id
    pub fn cache_object(&mut self, id: i32, object: CachedObject, expire: Duration) {
        self.cursor_cache
            .get_or_insert_with(|| ExpiringMap::new(expire))
            .put(id, object);
    }

    pub fn cached_object(&self, id: i32) -> Option<CachedObject> {
        self.cursor_cache.as_ref().and_then(|cache| cache.get(&id))
    }

    /// Remove a parked object; mandatory on close
    pub fn remove_cached_object(&mut self, id: i32) -> Option<CachedObject> {
        self.cursor_cache
            .as_ref()
            .and_then(|cache| cache.remove(&id))
    }

    /// Close every cache, releasing parked statements and results
    pub fn close_caches(&mut self) {
        if let Some(cache) = self.cursor_cache.take() {
            for object in cache.close() {
                match object {
                    CachedObject::Statement(statement) => statement.close(),
                    CachedObject::Result(result) => result.close(),
                }
            }
        }
        if let Some(mut cache) = self.query_cache.take() {
            cache.clear();
        }
    }
}
