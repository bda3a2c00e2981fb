//! The database: catalog, session registry, shared counters
//!
//! A `Database` owns the table catalog, the registry of live sessions, the
//! per-object lock registry, and the counters driving cache invalidation.
//! The transaction engine and the parser factory are injected at creation.

use crate::connection::ConnectionInfo;
use crate::lock::{DbObjectLock, DbObjectType};
use crate::session::Session;
use crate::settings::DbSettings;
use crate::statement::{SqlParser, SqlParserFactory};
use crate::user::User;
use opal_common::{DbError, Result};
use opal_engine::TransactionEngine;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Column data types the catalog records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Boolean,
    Int,
    Bigint,
    Double,
    Varchar,
}

/// A column definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Commit-time behavior of a temporary table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnCommit {
    PreserveRows,
    DeleteRows,
    Drop,
}

/// A table definition
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    pub columns: Vec<Column>,
    /// Name of the backing engine map
    pub map_name: String,
    pub temporary: bool,
    pub on_commit: OnCommit,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        let name = name.into();
        let map_name = format!("table.{}", name.to_ascii_lowercase());
        Self {
            name,
            columns,
            map_name,
            temporary: false,
            on_commit: OnCommit::PreserveRows,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Default, Clone)]
struct Catalog {
    tables: HashMap<String, Arc<TableInfo>>,
}

/// A database instance
pub struct Database {
    name: String,
    self_weak: Weak<Database>,
    settings: DbSettings,
    engine: Arc<TransactionEngine>,
    parser_factory: Arc<dyn SqlParserFactory>,
    sessions: Mutex<HashMap<u64, Weak<Session>>>,
    next_session_id: AtomicU64,
    catalog: Mutex<Catalog>,
    /// Committed catalog state DDL rollback restores to
    catalog_snapshot: Mutex<Catalog>,
    modification_meta_id: AtomicU64,
    modification_data_id: AtomicU64,
    exclusive_session: Mutex<Weak<Session>>,
    object_locks: Mutex<HashMap<(DbObjectType, String), Arc<DbObjectLock>>>,
}

impl Database {
    pub fn new(
        name: impl Into<String>,
        settings: DbSettings,
        parser_factory: Arc<dyn SqlParserFactory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            name: name.into(),
            self_weak: self_weak.clone(),
            settings,
            engine: TransactionEngine::new(),
            parser_factory,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            catalog: Mutex::new(Catalog::default()),
            catalog_snapshot: Mutex::new(Catalog::default()),
            modification_meta_id: AtomicU64::new(0),
            modification_data_id: AtomicU64::new(0),
            exclusive_session: Mutex::new(Weak::new()),
            object_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &DbSettings {
        &self.settings
    }

    pub fn transaction_engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    // === Sessions ===

    /// Create and register a session for `user`
    pub fn create_session(&self, user: User) -> Arc<Session> {
        let database = self
            .self_weak
            .upgrade()
            .expect("databases are always handled behind Arc");
        let id = self.next_session_id.fetch_add(1, Ordering::AcqRel);
        let session = Session::new(database, Arc::new(user), id);
        self.sessions.lock().insert(id, Arc::downgrade(&session));
        tracing::debug!(db = %self.name, session = id, "session created");
        session
    }

    /// Deregister a closed session
    pub fn remove_session(&self, id: u64) {
        self.sessions.lock().remove(&id);
        let mut exclusive = self.exclusive_session.lock();
        if exclusive.upgrade().map(|s| s.id() == id).unwrap_or(false) {
            *exclusive = Weak::new();
        }
    }

    /// Resolve a live session by id
    pub fn find_session(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Create a parser bound to `session`
    pub fn create_parser(&self, session: &Arc<Session>) -> Box<dyn SqlParser> {
        self.parser_factory.create_parser(session)
    }

    // === Exclusive mode ===

    /// The session holding the database exclusively, if any
    pub fn exclusive_session(&self) -> Option<Arc<Session>> {
        self.exclusive_session.lock().upgrade()
    }

    pub fn set_exclusive_session(&self, session: Option<&Arc<Session>>) {
        *self.exclusive_session.lock() = match session {
            Some(s) => Arc::downgrade(s),
            None => Weak::new(),
        };
    }

    // === Modification counters ===

    /// Catalog version; query caches are invalid once it advances
    pub fn modification_meta_id(&self) -> u64 {
        self.modification_meta_id.load(Ordering::Acquire)
    }

    pub fn next_modification_meta_id(&self) -> u64 {
        self.modification_meta_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Data version, bumped when a manual commit wrote rows
    pub fn modification_data_id(&self) -> u64 {
        self.modification_data_id.load(Ordering::Acquire)
    }

    pub fn next_modification_data_id(&self) -> u64 {
        self.modification_data_id.fetch_add(1, Ordering::AcqRel) + 1
    }

    // === Object locks ===

    /// The lock guarding one catalog object, created on first use
    pub fn object_lock(&self, object_type: DbObjectType, name: &str) -> Arc<DbObjectLock> {
        let key = (object_type, name.to_ascii_lowercase());
        self.object_locks
            .lock()
            .entry(key)
            .or_insert_with(|| DbObjectLock::new(object_type, name))
            .clone()
    }

    // === Catalog ===

    /// Register a table; bumps the catalog version
    pub fn add_table(&self, info: TableInfo) -> Result<Arc<TableInfo>> {
        let key = info.name.to_ascii_lowercase();
        let mut catalog = self.catalog.lock();
        if catalog.tables.contains_key(&key) {
            return Err(DbError::TableOrViewAlreadyExists(info.name));
        }
        let info = Arc::new(info);
        catalog.tables.insert(key, info.clone());
        drop(catalog);
        self.next_modification_meta_id();
        Ok(info)
    }

    /// Replace a table definition (ALTER); bumps the catalog version
    pub fn replace_table(&self, info: TableInfo) -> Arc<TableInfo> {
        let key = info.name.to_ascii_lowercase();
        let info = Arc::new(info);
        self.catalog.lock().tables.insert(key, info.clone());
        self.next_modification_meta_id();
        info
    }

    /// Remove a table; bumps the catalog version
    pub fn remove_table(&self, name: &str) -> Option<Arc<TableInfo>> {
        let removed = self.catalog.lock().tables.remove(&name.to_ascii_lowercase());
        if removed.is_some() {
            self.next_modification_meta_id();
        }
        removed
    }

    pub fn find_table(&self, name: &str) -> Option<Arc<TableInfo>> {
        self.catalog
            .lock()
            .tables
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .catalog
            .lock()
            .tables
            .values()
            .map(|t| t.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Record the committed catalog state as the rollback baseline
    pub fn checkpoint_catalog(&self) {
        *self.catalog_snapshot.lock() = self.catalog.lock().clone();
    }

    /// Restore the catalog to the last committed state (DDL rollback)
    pub fn restore_catalog(&self) {
        *self.catalog.lock() = self.catalog_snapshot.lock().clone();
        self.next_modification_meta_id();
    }
}

/// Process-wide registry of databases, resolved by connection URL
///
/// Explicitly initialized at process start; the nested-session pool uses it
/// to reach peer databases.
#[derive(Default)]
pub struct DatabaseRegistry {
    databases: Mutex<HashMap<String, Arc<Database>>>,
}

static REGISTRY: OnceLock<DatabaseRegistry> = OnceLock::new();

impl DatabaseRegistry {
    /// The process-wide registry
    pub fn global() -> &'static DatabaseRegistry {
        REGISTRY.get_or_init(DatabaseRegistry::default)
    }

    /// Register a database under its name
    pub fn register(&self, database: Arc<Database>) {
        self.databases
            .lock()
            .insert(database.name().to_ascii_lowercase(), database);
    }

    pub fn unregister(&self, name: &str) {
        self.databases.lock().remove(&name.to_ascii_lowercase());
    }

    pub fn find(&self, name: &str) -> Option<Arc<Database>> {
        self.databases
            .lock()
            .get(&name.to_ascii_lowercase())
            .cloned()
    }

    /// Resolve the database a connection URL names
    pub fn resolve(&self, info: &ConnectionInfo) -> Result<Arc<Database>> {
        self.find(info.database_name())
            .ok_or_else(|| DbError::NotFound(format!("database {}", info.database_name())))
    }
}
