//! Server-side sessions
//!
//! A session owns the per-connection state: the lazily started transaction,
//! the ordered list of object locks, the single in-flight yieldable command,
//! session variables and temporary objects, and the nested sessions that
//! represent remote participants of a distributed transaction.
//!
//! A session is dispatched by at most one handler at a time; status is an
//! atomic word so other handlers observe transitions, and cross-session
//! operations (conflict resolution, lock transfer) never hold one session's
//! mutex while taking another's.

use crate::command::{TimeoutListener, Yieldable, YieldableCommand};
use crate::connection::ConnectionInfo;
use crate::database::Database;
use crate::lock::DbObjectLock;
use crate::pool::SessionPool;
use crate::replication::ReplicationState;
use crate::resource::SessionResources;
use crate::scheduler::HandlerWake;
use crate::settings::SessionSetting;
use crate::statement::PreparedStatement;
use crate::status::SessionStatus;
use crate::user::User;
use lru::LruCache;
use opal_common::{now_millis, AsyncHandler, AsyncResult, CommitCallback, DbError, Result};
use opal_engine::{Transaction, TransactionListener, TransactionStatus, Value};
use opal_protocol::ReplicationConflictType;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::Duration;

/// Pseudo table id LOB values are linked under when stored in a variable
const LOB_TABLE_ID_SESSION_VARIABLE: i32 = -1;

/// Minimum gap between two throttle pauses
const THROTTLE_DELAY_MILLIS: u64 = 50;

const DEFAULT_SCHEMA: &str = "PUBLIC";

/// Statement-scope and settings state, guarded by one mutex
struct SessionState {
    lock_timeout_millis: u64,
    query_timeout_millis: u64,
    throttle_millis: u64,
    last_throttle: u64,
    schema_name: String,
    schema_search_path: Vec<String>,
    isolation_level: opal_common::IsolationLevel,
    variables: Option<HashMap<String, Value>>,
    auto_commit_at_transaction_end: bool,
    commit_or_rollback_disabled: bool,
    contains_ddl: bool,
    contains_database_statement: bool,
    modification_id: u64,
    next_object_id: i32,
    system_identifier: i32,
    current_command: Option<Arc<dyn PreparedStatement>>,
    current_command_savepoint_id: i32,
    current_command_lock_index: usize,
    current_command_start: u64,
    executing_nested_statement: bool,
    last_identity: Value,
    last_scope_identity: Value,
    value_vector_factory_name: Option<String>,
    expression_compile_threshold: i64,
    olap_operator_factory_name: Option<String>,
    olap_threshold: i64,
}

struct NestedEntry {
    host_and_port: String,
    url: String,
    session: Arc<Session>,
}

/// A server-side session, one per client connection
pub struct Session {
    id: u64,
    database: Arc<Database>,
    user: Arc<User>,
    self_weak: Weak<Session>,

    status: AtomicU8,
    auto_commit: AtomicBool,
    root: AtomicBool,
    closed: AtomicBool,
    cancel_at: AtomicU64,
    session_start: u64,
    transaction_start: AtomicU64,

    state: Mutex<SessionState>,
    resources: Mutex<SessionResources>,
    transaction: Mutex<Option<Arc<Transaction>>>,
    locks: Mutex<Vec<Arc<DbObjectLock>>>,
    yieldable: Mutex<Option<YieldableCommand>>,
    waiting_for: Mutex<Option<Arc<DbObjectLock>>>,
    pub(crate) replication: Mutex<ReplicationState>,
    nested: Mutex<Vec<NestedEntry>>,
    parent: Mutex<Weak<Session>>,
    connection_info: Mutex<Option<ConnectionInfo>>,
    handler: Mutex<Option<Weak<dyn HandlerWake>>>,
    listener: Mutex<Option<Arc<dyn TransactionListener>>>,
    running_thread: Mutex<Option<ThreadId>>,
}

impl Session {
    pub(crate) fn new(database: Arc<Database>, user: Arc<User>, id: u64) -> Arc<Self> {
        let settings = database.settings().clone();
        Arc::new_cyclic(|self_weak| Self {
            id,
            user,
            self_weak: self_weak.clone(),
            status: AtomicU8::new(SessionStatus::TransactionNotStart as u8),
            auto_commit: AtomicBool::new(true),
            root: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            cancel_at: AtomicU64::new(0),
            session_start: now_millis(),
            transaction_start: AtomicU64::new(0),
            state: Mutex::new(SessionState {
                lock_timeout_millis: settings.default_lock_timeout,
                query_timeout_millis: settings.max_query_timeout,
                throttle_millis: 0,
                last_throttle: 0,
                schema_name: DEFAULT_SCHEMA.to_string(),
                schema_search_path: Vec::new(),
                isolation_level: opal_common::IsolationLevel::default(),
                variables: None,
                auto_commit_at_transaction_end: false,
                commit_or_rollback_disabled: false,
                contains_ddl: false,
                contains_database_statement: false,
                modification_id: 0,
                next_object_id: 0,
                system_identifier: 0,
                current_command: None,
                current_command_savepoint_id: 0,
                current_command_lock_index: 0,
                current_command_start: 0,
                executing_nested_statement: false,
                last_identity: Value::Long(0),
                last_scope_identity: Value::Long(0),
                value_vector_factory_name: None,
                expression_compile_threshold: 100,
                olap_operator_factory_name: None,
                olap_threshold: 0,
            }),
            resources: Mutex::new(SessionResources::default()),
            transaction: Mutex::new(None),
            locks: Mutex::new(Vec::new()),
            yieldable: Mutex::new(None),
            waiting_for: Mutex::new(None),
            replication: Mutex::new(ReplicationState::default()),
            nested: Mutex::new(Vec::new()),
            parent: Mutex::new(Weak::new()),
            connection_info: Mutex::new(None),
            handler: Mutex::new(None),
            listener: Mutex::new(None),
            running_thread: Mutex::new(None),
            database,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn user(&self) -> &Arc<User> {
        &self.user
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Weak handle to this session; lives as long as the owning `Arc`
    pub(crate) fn weak(&self) -> Weak<Session> {
        self.self_weak.clone()
    }

    pub fn session_start(&self) -> u64 {
        self.session_start
    }

    /// Wall-clock start of the current transaction, stamped on first read
    pub fn transaction_start(&self) -> u64 {
        let current = self.transaction_start.load(Ordering::Acquire);
        if current != 0 {
            return current;
        }
        let now = now_millis();
        self.transaction_start.store(now, Ordering::Release);
        now
    }

    // === Status ===

    /// Observed status; reports `ExclusiveMode` while another session holds
    /// the database exclusively
    pub fn status(&self) -> SessionStatus {
        if self.is_exclusive_mode() {
            return SessionStatus::ExclusiveMode;
        }
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Set the status, applying the replication retry idempotence rules:
    /// once the append winner or a retried IF-DDL statement has acked, a
    /// second `RetryingReturnResult` is downgraded
    pub fn set_status(&self, status: SessionStatus) {
        let mut status = status;
        if status == SessionStatus::RetryingReturnResult {
            let (append_acked, ack_version) = {
                let repl = self.replication.lock();
                (
                    repl.append_replication_name.is_some()
                        && repl.conflict_type == ReplicationConflictType::Append,
                    repl.ack_version,
                )
            };
            if append_acked {
                return;
            }
            let is_if_ddl = {
                let state = self.state.lock();
                state
                    .current_command
                    .as_ref()
                    .map(|c| c.is_if_ddl())
                    .unwrap_or(false)
            };
            if is_if_ddl && ack_version > 0 {
                status = SessionStatus::Retrying;
            }
        }
        self.raw_set_status(status);
    }

    pub(crate) fn raw_set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Complete the running statement if it was not diverted into a retry
    pub fn complete_statement(&self) {
        let _ = self.status.compare_exchange(
            SessionStatus::StatementRunning as u8,
            SessionStatus::StatementCompleted as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    // === Auto-commit, root, exclusive ===

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit.load(Ordering::Acquire)
    }

    pub fn set_auto_commit(&self, auto_commit: bool) {
        self.auto_commit.store(auto_commit, Ordering::Release);
    }

    /// Whether this session coordinates its distributed transaction
    pub fn is_root(&self) -> bool {
        self.root.load(Ordering::Acquire)
    }

    pub fn set_root(&self, root: bool) {
        self.root.store(root, Ordering::Release);
    }

    /// Whether another session holds the database exclusively
    ///
    /// Re-entry from the thread currently dispatching the exclusive session
    /// short-circuits, so a connection opened from within that session keeps
    /// working.
    pub fn is_exclusive_mode(&self) -> bool {
        let Some(exclusive) = self.database.exclusive_session() else {
            return false;
        };
        if exclusive.id() == self.id {
            return false;
        }
        exclusive.running_thread() != Some(std::thread::current().id())
    }

    pub(crate) fn running_thread(&self) -> Option<ThreadId> {
        *self.running_thread.lock()
    }

    /// Called by the dispatching handler around `run`
    pub fn set_running_thread(&self, thread: Option<ThreadId>) {
        *self.running_thread.lock() = thread;
    }

    pub fn is_local(&self) -> bool {
        self.connection_info
            .lock()
            .as_ref()
            .map(|info| info.is_embedded())
            .unwrap_or(true)
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.connection_info.lock().clone()
    }

    pub fn set_connection_info(&self, info: ConnectionInfo) {
        *self.connection_info.lock() = Some(info);
    }

    pub fn set_network_timeout_millis(&self, millis: i64) {
        if let Some(info) = self.connection_info.lock().as_mut() {
            info.set_network_timeout_millis(millis);
        }
    }

    // === Settings ===

    pub fn lock_timeout_millis(&self) -> u64 {
        self.state.lock().lock_timeout_millis
    }

    pub fn set_lock_timeout_millis(&self, millis: u64) {
        self.state.lock().lock_timeout_millis = millis;
    }

    pub fn query_timeout_millis(&self) -> u64 {
        self.state.lock().query_timeout_millis
    }

    /// Set the query timeout, capped by the database maximum; resets any
    /// armed cancel deadline
    pub fn set_query_timeout_millis(&self, millis: u64) {
        let max = self.database.settings().max_query_timeout;
        let capped = if max != 0 && (millis == 0 || millis > max) {
            max
        } else {
            millis
        };
        self.state.lock().query_timeout_millis = capped;
        self.cancel_at.store(0, Ordering::Release);
    }

    pub fn throttle_millis(&self) -> u64 {
        self.state.lock().throttle_millis
    }

    pub fn set_throttle_millis(&self, millis: u64) {
        self.state.lock().throttle_millis = millis;
    }

    pub fn current_schema(&self) -> String {
        self.state.lock().schema_name.clone()
    }

    pub fn set_current_schema(&self, schema: impl Into<String>) {
        let mut state = self.state.lock();
        state.modification_id += 1;
        state.schema_name = schema.into();
    }

    pub fn schema_search_path(&self) -> Vec<String> {
        self.state.lock().schema_search_path.clone()
    }

    pub fn set_schema_search_path(&self, schemas: Vec<String>) {
        let mut state = self.state.lock();
        state.modification_id += 1;
        state.schema_search_path = schemas;
    }

    pub fn isolation_level(&self) -> opal_common::IsolationLevel {
        self.state.lock().isolation_level
    }

    pub fn set_isolation_level(&self, level: opal_common::IsolationLevel) {
        self.state.lock().isolation_level = level;
    }

    /// Apply a session setting by name (§ session settings table)
    pub fn set_setting(&self, name: &str, value: &str) -> Result<()> {
        let setting: SessionSetting = name.parse()?;
        match setting {
            SessionSetting::LockTimeout => {
                self.set_lock_timeout_millis(parse_millis(name, value)?)
            }
            SessionSetting::QueryTimeout => {
                self.set_query_timeout_millis(parse_millis(name, value)?)
            }
            SessionSetting::Schema => self.set_current_schema(value),
            SessionSetting::SchemaSearchPath => self.set_schema_search_path(
                value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
            SessionSetting::Throttle => self.set_throttle_millis(parse_millis(name, value)?),
            SessionSetting::TransactionIsolationLevel => {
                self.set_isolation_level(value.parse()?)
            }
            SessionSetting::ValueVectorFactoryName => {
                self.state.lock().value_vector_factory_name = Some(value.to_string());
            }
            SessionSetting::ExpressionCompileThreshold => {
                self.state.lock().expression_compile_threshold =
                    value.parse().map_err(|_| DbError::invalid_value(name, value))?;
            }
            SessionSetting::OlapOperatorFactoryName => {
                self.state.lock().olap_operator_factory_name = Some(value.to_string());
            }
            SessionSetting::OlapThreshold => {
                self.state.lock().olap_threshold =
                    value.parse().map_err(|_| DbError::invalid_value(name, value))?;
            }
        }
        Ok(())
    }

    /// Current settings in reporting order
    pub fn get_settings(&self) -> Vec<(String, String)> {
        let state = self.state.lock();
        SessionSetting::all()
            .iter()
            .map(|setting| {
                let value = match setting {
                    SessionSetting::LockTimeout => state.lock_timeout_millis.to_string(),
                    SessionSetting::QueryTimeout => state.query_timeout_millis.to_string(),
                    SessionSetting::Schema => state.schema_name.clone(),
                    SessionSetting::SchemaSearchPath => state.schema_search_path.join(","),
                    SessionSetting::Throttle => state.throttle_millis.to_string(),
                    SessionSetting::TransactionIsolationLevel => {
                        state.isolation_level.to_string()
                    }
                    SessionSetting::ValueVectorFactoryName => state
                        .value_vector_factory_name
                        .clone()
                        .unwrap_or_else(|| "null".to_string()),
                    SessionSetting::ExpressionCompileThreshold => {
                        state.expression_compile_threshold.to_string()
                    }
                    SessionSetting::OlapOperatorFactoryName => state
                        .olap_operator_factory_name
                        .clone()
                        .unwrap_or_else(|| "null".to_string()),
                    SessionSetting::OlapThreshold => state.olap_threshold.to_string(),
                };
                (setting.name().to_string(), value)
            })
            .collect()
    }

    // === Variables ===

    /// Set a session variable; NULL removes. A replaced LOB value is
    /// unlinked and closed exactly once.
    pub fn set_variable(&self, name: &str, value: Value) {
        let old = {
            let mut state = self.state.lock();
            state.modification_id += 1;
            let variables = state.variables.get_or_insert_with(HashMap::new);
            if value.is_null() {
                variables.remove(name)
            } else {
                value.link(LOB_TABLE_ID_SESSION_VARIABLE);
                variables.insert(name.to_string(), value)
            }
        };
        if let Some(old) = old {
            old.unlink();
            old.close();
        }
    }

    /// Get a session variable; NULL if absent
    pub fn get_variable(&self, name: &str) -> Value {
        self.state
            .lock()
            .variables
            .as_ref()
            .and_then(|variables| variables.get(name).cloned())
            .unwrap_or(Value::Null)
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.state
            .lock()
            .variables
            .as_ref()
            .map(|variables| variables.keys().cloned().collect())
            .unwrap_or_default()
    }

    // === Identity counters ===

    pub fn set_last_identity(&self, value: Value) {
        let mut state = self.state.lock();
        state.last_identity = value.clone();
        state.last_scope_identity = value;
    }

    pub fn last_identity(&self) -> Value {
        self.state.lock().last_identity.clone()
    }

    pub fn set_last_scope_identity(&self, value: Value) {
        self.state.lock().last_scope_identity = value;
    }

    pub fn last_scope_identity(&self) -> Value {
        self.state.lock().last_scope_identity.clone()
    }

    /// Record the synthetic key of the last written row
    pub fn set_last_row_key(&self, key: i64) {
        self.set_last_identity(Value::Long(key));
    }

    /// Next statement/object id within this session
    pub fn next_object_id(&self) -> i32 {
        let mut state = self.state.lock();
        state.next_object_id += 1;
        state.next_object_id
    }

    /// A generated identifier not occurring in the given SQL text
    pub fn next_system_identifier(&self, sql: &str) -> String {
        let mut state = self.state.lock();
        loop {
            let identifier = format!("_{}", state.system_identifier);
            state.system_identifier += 1;
            if !sql.contains(&identifier) {
                return identifier;
            }
        }
    }

    pub fn modification_id(&self) -> u64 {
        self.state.lock().modification_id
    }

    // === Resources ===

    /// The session resource registry (temp objects, caches, unlink set)
    pub fn resources(&self) -> &Mutex<SessionResources> {
        &self.resources
    }

    pub fn add_procedure(&self, procedure: crate::resource::Procedure) {
        self.resources.lock().add_procedure(procedure);
    }

    pub fn get_procedure(&self, name: &str) -> Option<crate::resource::Procedure> {
        self.resources.lock().find_procedure(name).cloned()
    }

    pub fn remove_procedure(&self, name: &str) {
        self.resources.lock().remove_procedure(name);
    }

    /// Park an object for the wire layer under its integer id; expiry comes
    /// from the database settings, removal on close stays mandatory
    pub fn add_cached_object(&self, id: i32, object: crate::resource::CachedObject) {
        let expire = Duration::from_millis(self.database.settings().cache_expire_millis);
        self.resources.lock().cache_object(id, object, expire);
    }

    pub fn cached_object(&self, id: i32) -> Option<crate::resource::CachedObject> {
        self.resources.lock().cached_object(id)
    }

    pub fn remove_cached_object(&self, id: i32) -> Option<crate::resource::CachedObject> {
        self.resources.lock().remove_cached_object(id)
    }

    /// Remember a linked LOB to unlink after the commit log flush
    pub fn unlink_at_commit(&self, value: Value) -> Result<()> {
        if !value.is_linked() {
            return Err(DbError::Internal(
                "unlink_at_commit on a value that was never linked".to_string(),
            ));
        }
        self.resources.lock().unlink_at_commit(value);
        Ok(())
    }

    pub fn unlink_at_commit_stop(&self, value: &Value) {
        self.resources.lock().unlink_at_commit_stop(value);
    }

    // === Prepare ===

    /// Parse and prepare a SQL statement, consulting the query cache
    ///
    /// The cache is cleared and repopulated whenever the database catalog
    /// version moved past the snapshot the cache was built against.
    pub fn prepare(&self, sql: &str, fetch_size: i32) -> Result<Arc<dyn PreparedStatement>> {
        if self.is_closed() {
            return Err(DbError::ConnectionBroken("session closed".to_string()));
        }
        let cache_size = self.database.settings().query_cache_size;
        if cache_size > 0 {
            let mut resources = self.resources.lock();
            if resources.query_cache.is_none() {
                resources.query_cache = Some(LruCache::new(
                    NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::new(32).unwrap()),
                ));
                resources.query_cache_meta_id = self.database.modification_meta_id();
            } else {
                let meta_id = self.database.modification_meta_id();
                if meta_id != resources.query_cache_meta_id {
                    if let Some(cache) = resources.query_cache.as_mut() {
                        cache.clear();
                    }
                    resources.query_cache_meta_id = meta_id;
                } else if let Some(statement) = resources
                    .query_cache
                    .as_mut()
                    .and_then(|cache| cache.get(sql).cloned())
                {
                    if statement.can_reuse() {
                        statement.reuse();
                        return Ok(statement);
                    }
                }
            }
        }
        let this = match self.self_weak.upgrade() {
            Some(this) => this,
            None => {
                return Err(DbError::ConnectionBroken("session released".to_string()));
            }
        };
        let statement = self.database.create_parser(&this).parse(sql)?.prepare()?;
        if cache_size > 0 && statement.is_cacheable() {
            if let Some(cache) = self.resources.lock().query_cache.as_mut() {
                cache.put(sql.to_string(), statement.clone());
            }
        }
        statement.set_local(self.is_local());
        if fetch_size != -1 {
            statement.set_fetch_size(fetch_size);
        }
        Ok(statement)
    }

    // === Transaction ===

    /// The current transaction, started lazily
    pub fn get_transaction(&self) -> Arc<Transaction> {
        let mut guard = self.transaction.lock();
        if let Some(transaction) = guard.as_ref() {
            return transaction.clone();
        }
        let isolation = self.state.lock().isolation_level;
        let transaction = self
            .database
            .transaction_engine()
            .begin_transaction(self.is_auto_commit(), isolation);
        transaction.set_session_id(self.id);
        transaction.set_replication_name(self.replication_name());
        *guard = Some(transaction.clone());
        drop(guard);
        self.raw_set_status(SessionStatus::TransactionNotCommit);
        transaction
    }

    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.lock().clone()
    }

    /// Begin an explicit transaction: auto-commit turns back on at its end
    pub fn begin(&self) {
        self.state.lock().auto_commit_at_transaction_end = true;
        self.set_auto_commit(false);
    }

    /// Guard nested statements: commit/rollback raise while locks are held
    pub fn set_commit_or_rollback_disabled(&self, disabled: bool) -> bool {
        let mut state = self.state.lock();
        std::mem::replace(&mut state.commit_or_rollback_disabled, disabled)
    }

    fn check_commit_rollback(&self) -> Result<()> {
        if self.state.lock().commit_or_rollback_disabled && !self.locks.lock().is_empty() {
            return Err(DbError::CommitRollbackNotAllowed);
        }
        Ok(())
    }

    // === Savepoints ===

    pub fn add_savepoint(&self, name: &str) {
        self.get_transaction().add_savepoint(name);
    }

    pub fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        if let Some(transaction) = self.transaction() {
            self.check_commit_rollback()?;
            transaction.rollback_to_savepoint_name(name)?;
        }
        Ok(())
    }

    pub fn rollback_to(&self, savepoint_id: i32) -> Result<()> {
        if let Some(transaction) = self.transaction() {
            self.check_commit_rollback()?;
            transaction.rollback_to_savepoint(savepoint_id);
        }
        Ok(())
    }

    // === Commit / rollback ===

    pub fn commit(&self) -> Result<()> {
        self.commit_with(None)
    }

    /// Commit the current transaction
    ///
    /// A root session of a distributed transaction builds the global name
    /// `<local-tx-name>(,<peer-host:port>)*` and runs the two-phase protocol:
    /// every participant logs a commit-ready record, the coordinator logs
    /// the global decision, and only then do participants finalize.
    pub fn commit_with(&self, global_name: Option<String>) -> Result<()> {
        let Some(transaction) = self.transaction() else {
            return Ok(());
        };
        self.check_commit_rollback()?;
        self.transaction_start.store(0, Ordering::Release);
        self.raw_set_status(SessionStatus::TransactionCommitting);

        let participants = self.participants();
        let mut global_name = global_name;
        if global_name.is_none()
            && self.is_root()
            && !participants.is_empty()
            && !self.is_auto_commit()
        {
            global_name = Some(self.build_global_transaction_name(&transaction));
        }
        // a writing manual commit invalidates cached data snapshots
        if !self.is_auto_commit() && transaction.savepoint_id() > 0 {
            self.database.next_modification_data_id();
        }

        match global_name {
            None => {
                transaction.commit()?;
                *self.transaction.lock() = None;
                self.commit_final();
            }
            Some(global) => {
                tracing::debug!(session = self.id, global = %global, "distributed commit");
                for (peer, participant) in &participants {
                    if let Err(error) = participant.prepare_commit(&global) {
                        tracing::warn!(
                            session = self.id,
                            peer = %peer,
                            error = %error,
                            "participant failed to prepare; rolling back all"
                        );
                        for (_, other) in &participants {
                            let _ = other.rollback();
                        }
                        self.rollback()?;
                        return Err(error);
                    }
                }
                transaction.prepare_commit(&global)?;
                self.database.transaction_engine().record_commit_decision(&global);
                transaction.commit_distributed();
                *self.transaction.lock() = None;
                for (_, participant) in &participants {
                    participant.finish_distributed_commit();
                }
                self.commit_final();
            }
        }
        Ok(())
    }

    /// Participant-side phase 1: log the commit-ready record
    pub fn prepare_commit(&self, global_name: &str) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::ConnectionBroken("session closed".to_string()));
        }
        if let Some(transaction) = self.transaction() {
            self.raw_set_status(SessionStatus::TransactionCommitting);
            transaction.prepare_commit(global_name)?;
        }
        Ok(())
    }

    /// Participant-side phase 2: finalize after the coordinator confirmed
    pub fn finish_distributed_commit(&self) {
        if let Some(transaction) = self.transaction.lock().take() {
            transaction.commit_distributed();
        }
        self.commit_final();
    }

    /// Whether the global transaction reached its commit decision
    pub fn validate_transaction(&self, global_name: &str) -> bool {
        self.database
            .transaction_engine()
            .validate_transaction(global_name)
    }

    /// Commit without blocking the handler: `on_done` runs after the log
    /// flush, on the log thread, once local post-commit work finished
    pub fn async_commit(&self, on_done: Option<CommitCallback>) -> Result<()> {
        let transaction = self.transaction();
        match transaction {
            Some(transaction) => {
                self.check_commit_rollback()?;
                transaction.set_status(TransactionStatus::Committing);
                self.raw_set_status(SessionStatus::TransactionCommitting);
                match self.self_weak.upgrade() {
                    Some(session) => transaction.async_commit(Box::new(move || {
                        session.async_commit_complete();
                        if let Some(on_done) = on_done {
                            on_done();
                        }
                    })),
                    None => {
                        if let Some(on_done) = on_done {
                            on_done();
                        }
                    }
                }
                Ok(())
            }
            None => {
                // a COMMIT statement already committed; just run the task
                if let Some(on_done) = on_done {
                    on_done();
                }
                Ok(())
            }
        }
    }

    fn async_commit_complete(&self) {
        self.transaction_start.store(0, Ordering::Release);
        *self.transaction.lock() = None;
        self.commit_final();
    }

    /// Post-commit phase: temp-table policy, LOB unlink after the log
    /// flush, lock release, nested-session release
    pub fn commit_final(&self) {
        let (had_ddl, restore_auto_commit) = {
            let mut state = self.state.lock();
            let had_ddl = state.contains_ddl;
            state.contains_ddl = false;
            state.contains_database_statement = false;
            let restore = state.auto_commit_at_transaction_end;
            state.auto_commit_at_transaction_end = false;
            (had_ddl, restore)
        };
        if !self.is_root() {
            // participants drop back to auto-commit once released
            self.set_auto_commit(true);
        }
        if !had_ddl {
            // do not clean temp tables when the last statement was create/drop
            self.resources
                .lock()
                .clean_temp_tables(self.database.transaction_engine(), false);
        }
        if restore_auto_commit {
            self.set_auto_commit(true);
        }
        let lobs = self.resources.lock().take_unlink_lobs();
        if !lobs.is_empty() {
            // the commit record must be durable before the LOBs go away
            self.database.transaction_engine().flush_log_sync();
            for value in lobs {
                value.unlink();
                value.close();
            }
        }
        if had_ddl {
            self.database.checkpoint_catalog();
        }
        self.unlock_all(true, None);
        self.clean_replication_state();
        self.release_nested_sessions();
        *self.yieldable.lock() = None;
        *self.transaction.lock() = None;
        self.raw_set_status(SessionStatus::TransactionNotStart);
    }

    /// Fully roll back the current transaction
    pub fn rollback(&self) -> Result<()> {
        self.check_commit_rollback()?;
        self.transaction_start.store(0, Ordering::Release);
        if let Some(transaction) = self.transaction.lock().take() {
            transaction.rollback();
        }
        let (had_database_statement, had_ddl, restore_auto_commit) = {
            let mut state = self.state.lock();
            let flags = (
                state.contains_database_statement,
                state.contains_ddl,
                state.auto_commit_at_transaction_end,
            );
            state.contains_database_statement = false;
            state.contains_ddl = false;
            state.auto_commit_at_transaction_end = false;
            flags
        };
        if !self.is_root() {
            self.set_auto_commit(true);
        }
        self.resources
            .lock()
            .clean_temp_tables(self.database.transaction_engine(), false);
        self.unlock_all(false, None);
        if restore_auto_commit {
            self.set_auto_commit(true);
        }
        if had_database_statement || had_ddl {
            // catalog changes are undone from the committed snapshot
            self.database.restore_catalog();
        }
        self.clean_replication_state();
        let participants = self.participants();
        for (_, participant) in &participants {
            let _ = participant.rollback();
        }
        self.release_nested_sessions();
        self.raw_set_status(SessionStatus::TransactionNotStart);
        Ok(())
    }

    // === Statement lifecycle ===

    /// Record the statement's starting savepoint, lock index, and cancel
    /// deadline, and move to `StatementRunning`
    pub fn start_current_command(&self, statement: Arc<dyn PreparedStatement>) {
        let transaction = self.get_transaction();
        {
            let mut state = self.state.lock();
            if statement.is_database_statement() {
                state.contains_database_statement = true;
            } else if statement.is_ddl() {
                state.contains_ddl = true;
            }
            if state.query_timeout_millis > 0 {
                let now = now_millis();
                state.current_command_start = now;
                self.cancel_at
                    .store(now + state.query_timeout_millis, Ordering::Release);
            }
            state.current_command_savepoint_id = transaction.savepoint_id();
            state.current_command_lock_index = self.locks.lock().len();
            state.current_command = Some(statement);
        }
        self.raw_set_status(SessionStatus::StatementRunning);
    }

    fn close_current_command(&self) {
        let statement = self.state.lock().current_command.take();
        if let Some(statement) = statement {
            statement.close();
        }
    }

    /// Finish the current statement and deliver its result
    ///
    /// In auto-commit mode the result callback is deferred behind the async
    /// commit; a session in replication retry suppresses the callback and
    /// commits silently when auto-committing.
    pub fn stop_current_command<T: Send + 'static>(
        &self,
        handler: Option<AsyncHandler<T>>,
        result: Option<AsyncResult<T>>,
    ) {
        if self.state.lock().executing_nested_statement {
            return;
        }
        self.resources.lock().close_temporary_results();
        self.close_current_command();
        let raw_status = SessionStatus::from_u8(self.status.load(Ordering::Acquire));
        if raw_status == SessionStatus::Retrying {
            self.raw_set_status(SessionStatus::StatementCompleted);
            if self.is_auto_commit() {
                if result.is_some() {
                    if let Err(error) = self.async_commit(None) {
                        tracing::warn!(session = self.id, error = %error, "retry commit failed");
                    }
                } else if let Err(error) = self.commit() {
                    tracing::warn!(session = self.id, error = %error, "retry commit failed");
                }
            }
        } else if let (Some(handler), Some(result)) = (handler, result) {
            if self.is_auto_commit() && self.replication_name().is_none() {
                let outcome = self.async_commit(Some(Box::new(move || handler(result))));
                if let Err(error) = outcome {
                    tracing::warn!(session = self.id, error = %error, "auto-commit failed");
                }
            } else {
                // manual commit: the result goes back before the commit
                handler(result);
            }
        } else if self.is_auto_commit() && self.replication_name().is_none() {
            if let Err(error) = self.commit() {
                tracing::warn!(session = self.id, error = %error, "auto-commit failed");
            }
        }
        if self.replication_name().is_none() {
            *self.yieldable.lock() = None;
        }
    }

    /// Roll the transaction back to the statement's starting savepoint and
    /// release only the locks this statement acquired
    pub fn rollback_current_command(&self) {
        let (savepoint, lock_index) = {
            let state = self.state.lock();
            (
                state.current_command_savepoint_id,
                state.current_command_lock_index,
            )
        };
        if let Some(transaction) = self.transaction() {
            transaction.rollback_to_savepoint(savepoint);
        }
        let released: Vec<Arc<DbObjectLock>> = {
            let mut locks = self.locks.lock();
            if lock_index < locks.len() {
                locks.split_off(lock_index)
            } else {
                Vec::new()
            }
        };
        for lock in released {
            lock.unlock(self, false, None);
        }
    }

    /// Conflict-resolution variant: the whole lock set transfers to the
    /// winner and this session waits
    pub(crate) fn rollback_current_command_transfer(&self, new_owner: &Session) {
        let savepoint = self.state.lock().current_command_savepoint_id;
        if let Some(transaction) = self.transaction() {
            transaction.rollback_to_savepoint(savepoint);
        }
        self.unlock_all(false, Some(new_owner));
        self.raw_set_status(SessionStatus::Waiting);
    }

    /// Route a failed `run` to the statement's handler after rolling the
    /// statement back
    pub fn handle_command_failure(&self, command: &YieldableCommand, error: DbError) {
        tracing::warn!(session = self.id, error = %error, "statement failed");
        self.rollback_current_command();
        self.raw_set_status(SessionStatus::StatementCompleted);
        *self.yieldable.lock() = None;
        command.on_error(error);
    }

    pub fn current_command(&self) -> Option<Arc<dyn PreparedStatement>> {
        self.state.lock().current_command.clone()
    }

    pub fn current_command_savepoint_id(&self) -> i32 {
        self.state.lock().current_command_savepoint_id
    }

    pub fn current_command_lock_index(&self) -> usize {
        self.state.lock().current_command_lock_index
    }

    pub fn start_nested_statement(&self) {
        self.state.lock().executing_nested_statement = true;
    }

    pub fn end_nested_statement(&self) {
        self.state.lock().executing_nested_statement = false;
    }

    // === Cancellation, timeouts, throttling ===

    /// Arm cancellation: the next `check_canceled` raises
    pub fn cancel(&self) {
        self.cancel_at.store(now_millis(), Ordering::Release);
    }

    /// Cancel the running statement iff its id matches
    pub fn cancel_statement(&self, statement_id: i32) {
        let statement = self.state.lock().current_command.clone();
        if let Some(statement) = statement {
            if statement.id() == statement_id {
                statement.cancel();
            }
        }
    }

    pub fn cancel_at(&self) -> u64 {
        self.cancel_at.load(Ordering::Acquire)
    }

    /// Raise if `cancel` was called or the query timeout elapsed
    pub fn check_canceled(&self) -> Result<()> {
        self.throttle();
        let cancel_at = self.cancel_at.load(Ordering::Acquire);
        if cancel_at == 0 {
            return Ok(());
        }
        if now_millis() >= cancel_at {
            self.cancel_at.store(0, Ordering::Release);
            return Err(DbError::StatementCanceled);
        }
        Ok(())
    }

    /// Pause if the session is throttled
    pub fn throttle(&self) {
        let pause = {
            let mut state = self.state.lock();
            if state.current_command_start == 0 {
                state.current_command_start = now_millis();
            }
            if state.throttle_millis == 0 {
                return;
            }
            let now = now_millis();
            if state.last_throttle + THROTTLE_DELAY_MILLIS > now {
                return;
            }
            state.last_throttle = now + state.throttle_millis;
            state.throttle_millis
        };
        std::thread::sleep(Duration::from_millis(pause));
    }

    // === Locks ===

    /// Track a lock this session now holds (at most once)
    pub fn add_lock(&self, lock: Arc<DbObjectLock>) {
        let mut locks = self.locks.lock();
        if !locks.iter().any(|held| Arc::ptr_eq(held, &lock)) {
            locks.push(lock);
        }
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn locks_snapshot(&self) -> Vec<Arc<DbObjectLock>> {
        self.locks.lock().clone()
    }

    pub(crate) fn unlock_all(&self, succeeded: bool, new_owner: Option<&Session>) {
        let drained: Vec<Arc<DbObjectLock>> = {
            let mut locks = self.locks.lock();
            locks.drain(..).collect()
        };
        for lock in drained {
            lock.unlock(self, succeeded, new_owner);
        }
    }

    /// Enter a lock wait on a catalog object held by `owner`
    pub fn wait_for_lock(&self, lock: &Arc<DbObjectLock>, owner: Option<&Arc<Session>>) {
        let listener = self.transaction_listener();
        let transaction = self.get_transaction();
        transaction.set_waiting(
            format!("{:?} {}", lock.object_type(), lock.object_name()),
            self.lock_timeout_millis(),
        );
        if let Some(owner_transaction) = owner.and_then(|o| o.transaction()) {
            transaction.set_locked_by(owner_transaction.id());
        }
        lock.add_waiting(self, listener);
        *self.waiting_for.lock() = Some(lock.clone());
        self.raw_set_status(SessionStatus::Waiting);
        tracing::debug!(
            session = self.id,
            object = lock.object_name(),
            "waiting for object lock"
        );
    }

    /// Enter a lock wait on a row held by `owner_transaction`
    pub fn wait_for_row(
        &self,
        owner_transaction: &Arc<Transaction>,
        key: i64,
        description: impl Into<String>,
    ) {
        let listener = self.transaction_listener();
        let transaction = self.get_transaction();
        transaction.set_waiting(description, self.lock_timeout_millis());
        transaction.set_locked_by(owner_transaction.id());
        owner_transaction.add_waiting_transaction(key, transaction.id(), listener);
        self.raw_set_status(SessionStatus::Waiting);
    }

    /// Lock-granted wakeup: leave the wait and become dispatchable
    pub fn wake(&self) {
        *self.waiting_for.lock() = None;
        if let Some(transaction) = self.transaction.lock().clone() {
            transaction.clear_waiting();
        }
        let _ = self.status.compare_exchange(
            SessionStatus::Waiting as u8,
            SessionStatus::Retrying as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.notify_handler();
    }

    /// The listener other components use to wake this session
    pub fn transaction_listener(&self) -> Arc<dyn TransactionListener> {
        let mut listener = self.listener.lock();
        if let Some(existing) = listener.as_ref() {
            return existing.clone();
        }
        let created: Arc<dyn TransactionListener> = Arc::new(SessionWaker {
            session: self.self_weak.clone(),
        });
        *listener = Some(created.clone());
        created
    }

    // === Scheduler surface ===

    pub(crate) fn set_handler(&self, handler: Weak<dyn HandlerWake>) {
        *self.handler.lock() = Some(handler);
    }

    pub(crate) fn notify_handler(&self) {
        let handler = self.handler.lock().as_ref().and_then(Weak::upgrade);
        if let Some(handler) = handler {
            handler.wake_up();
        }
    }

    /// Install a new yieldable command; fails while one is in flight
    pub fn submit_yieldable_command(
        &self,
        packet_id: i32,
        yieldable: Box<dyn Yieldable>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(DbError::ConnectionBroken("session closed".to_string()));
        }
        if !self.can_execute_next_command() {
            return Err(DbError::Internal(
                "previous statement has not completed".to_string(),
            ));
        }
        *self.yieldable.lock() = Some(YieldableCommand::new(packet_id, self.id, yieldable));
        self.notify_handler();
        Ok(())
    }

    pub fn set_yieldable_command(&self, command: Option<YieldableCommand>) {
        *self.yieldable.lock() = command;
    }

    pub fn yieldable_command_slot(&self) -> Option<YieldableCommand> {
        self.yieldable.lock().clone()
    }

    /// Whether the wire layer may hand the session its next piece of work
    ///
    /// Under replication the next piece (an async commit, a retry ack) may
    /// proceed while a command is still parked.
    pub fn can_execute_next_command(&self) -> bool {
        let raw = SessionStatus::from_u8(self.status.load(Ordering::Acquire));
        if raw == SessionStatus::Retrying || raw == SessionStatus::RetryingReturnResult {
            return false;
        }
        self.yieldable.lock().is_none() || self.replication_name().is_some()
    }

    /// Dispatch gate: the command, if this session may run now
    ///
    /// A `Waiting` session is not dispatchable, but when `check_timeout` is
    /// set (and the session is not under replication) the transaction's wait
    /// bound is enforced here; on expiry the transaction rolls back and the
    /// error is routed to the command's handler and the listener.
    pub fn yieldable_command(
        &self,
        check_timeout: bool,
        timeout_listener: Option<&dyn TimeoutListener>,
    ) -> Option<YieldableCommand> {
        let command = self.yieldable.lock().clone()?;
        match self.status() {
            SessionStatus::Waiting => {
                if check_timeout && self.replication_name().is_none() {
                    self.check_transaction_timeout(&command, timeout_listener);
                }
                None
            }
            SessionStatus::TransactionCommitting
            | SessionStatus::ExclusiveMode
            | SessionStatus::StatementRunning => None,
            _ => Some(command),
        }
    }

    fn check_transaction_timeout(
        &self,
        command: &YieldableCommand,
        timeout_listener: Option<&dyn TimeoutListener>,
    ) {
        let Some(transaction) = self.transaction() else {
            return;
        };
        if transaction.status() != TransactionStatus::Waiting {
            return;
        }
        if let Err(error) = transaction.check_timeout() {
            tracing::warn!(session = self.id, error = %error, "lock wait timed out");
            if let Some(lock) = self.waiting_for.lock().take() {
                lock.remove_waiting(self.id);
            }
            transaction.rollback();
            *self.transaction.lock() = None;
            self.unlock_all(false, None);
            *self.yieldable.lock() = None;
            self.raw_set_status(SessionStatus::StatementCompleted);
            if let Some(listener) = timeout_listener {
                listener.on_timeout(command, &error);
            }
            command.on_error(error);
        }
    }

    // === Nested sessions ===

    /// The nested session for a peer, pooled and joined to this transaction
    /// exactly once
    pub fn nested_session(&self, host_and_port: &str) -> Result<Arc<Session>> {
        let url = ConnectionInfo::tcp_url(host_and_port, self.database.name());
        {
            let nested = self.nested.lock();
            if let Some(entry) = nested.iter().find(|entry| entry.url == url) {
                return Ok(entry.session.clone());
            }
        }
        let this = self
            .self_weak
            .upgrade()
            .ok_or_else(|| DbError::ConnectionBroken("session released".to_string()))?;
        let session = SessionPool::global().acquire(&this, &url)?;
        self.nested.lock().push(NestedEntry {
            host_and_port: host_and_port.to_string(),
            url,
            session: session.clone(),
        });
        tracing::debug!(session = self.id, peer = host_and_port, "nested session joined");
        Ok(session)
    }

    /// Participant snapshot in join order
    pub fn participants(&self) -> Vec<(String, Arc<Session>)> {
        self.nested
            .lock()
            .iter()
            .map(|entry| (entry.host_and_port.clone(), entry.session.clone()))
            .collect()
    }

    fn build_global_transaction_name(&self, transaction: &Transaction) -> String {
        let mut name = transaction.name().to_string();
        for entry in self.nested.lock().iter() {
            name.push(',');
            name.push_str(&entry.host_and_port);
        }
        name
    }

    fn release_nested_sessions(&self) {
        let entries: Vec<NestedEntry> = {
            let mut nested = self.nested.lock();
            nested.drain(..).collect()
        };
        for entry in entries {
            entry.session.set_parent(None);
            SessionPool::global().release(entry.session);
        }
    }

    pub(crate) fn set_parent(&self, parent: Option<&Arc<Session>>) {
        *self.parent.lock() = match parent {
            Some(parent) => Arc::downgrade(parent),
            None => Weak::new(),
        };
    }

    pub fn parent(&self) -> Option<Arc<Session>> {
        self.parent.lock().upgrade()
    }

    // === Replication accessors (state lives in `replication`) ===

    pub fn replication_name(&self) -> Option<String> {
        self.replication.lock().replication_name.clone()
    }

    pub fn set_replication_name(&self, name: Option<String>) {
        let mut replication = self.replication.lock();
        if name.is_some() {
            replication.last_replication_name = name.clone();
        }
        replication.replication_name = name;
    }

    /// Most recent replication name this session carried; survives cleanup
    /// so the wire layer can correlate the final retry ack
    pub fn last_replication_name(&self) -> Option<String> {
        self.replication.lock().last_replication_name.clone()
    }

    // === Close ===

    /// Close the session; idempotent, errors are swallowed
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(session = self.id, "session closing");
        if let Some(transaction) = self.transaction.lock().take() {
            transaction.rollback();
        }
        self.unlock_all(false, None);
        {
            let mut resources = self.resources.lock();
            resources.close_caches();
            resources.close_temporary_results();
            resources.clean_temp_tables(self.database.transaction_engine(), true);
        }
        self.release_nested_sessions();
        *self.yieldable.lock() = None;
        self.database.remove_session(self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user.name())
            .field("status", &SessionStatus::from_u8(self.status.load(Ordering::Acquire)))
            .finish()
    }
}

fn parse_millis(name: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| DbError::invalid_value(name, value))
}

/// Wakes a session when a lock it waits on is released
struct SessionWaker {
    session: Weak<Session>,
}

impl TransactionListener for SessionWaker {
    fn wake(&self) {
        if let Some(session) = self.session.upgrade() {
            session.wake();
        }
    }
}
