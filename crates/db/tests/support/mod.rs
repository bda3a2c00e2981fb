//! Shared fixtures for the session-core integration tests
#![allow(dead_code)]

use opal_common::{DbError, Result};
use opal_db::{
    Database, DatabaseRegistry, DbSettings, ParsedStatement, PreparedStatement, Session,
    SqlParser, SqlParserFactory, Yieldable,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A parser whose statements do nothing but carry flags; lets the tests
/// drive the session surface without a SQL front
pub struct StubParserFactory {
    pub parse_count: Arc<AtomicUsize>,
}

impl StubParserFactory {
    pub fn new() -> Self {
        Self {
            parse_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SqlParserFactory for StubParserFactory {
    fn create_parser(&self, session: &Arc<Session>) -> Box<dyn SqlParser> {
        Box::new(StubParser {
            session: session.clone(),
            parse_count: self.parse_count.clone(),
        })
    }
}

struct StubParser {
    session: Arc<Session>,
    parse_count: Arc<AtomicUsize>,
}

impl SqlParser for StubParser {
    fn parse(&mut self, sql: &str) -> Result<Box<dyn ParsedStatement>> {
        self.parse_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubParsed {
            id: self.session.next_object_id(),
            sql: sql.to_string(),
        }))
    }
}

struct StubParsed {
    id: i32,
    sql: String,
}

impl ParsedStatement for StubParsed {
    fn prepare(self: Box<Self>) -> Result<Arc<dyn PreparedStatement>> {
        Ok(Arc::new(StubStatement {
            id: self.id,
            sql: self.sql,
            if_ddl: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
        }))
    }
}

pub struct StubStatement {
    pub id: i32,
    pub sql: String,
    pub if_ddl: AtomicBool,
    pub in_use: AtomicBool,
    pub canceled: AtomicBool,
}

impl StubStatement {
    pub fn new(id: i32, sql: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            sql: sql.to_string(),
            if_ddl: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
        })
    }
}

impl PreparedStatement for StubStatement {
    fn id(&self) -> i32 {
        self.id
    }
    fn sql(&self) -> &str {
        &self.sql
    }
    fn is_query(&self) -> bool {
        false
    }
    fn is_ddl(&self) -> bool {
        false
    }
    fn is_database_statement(&self) -> bool {
        false
    }
    fn is_if_ddl(&self) -> bool {
        self.if_ddl.load(Ordering::SeqCst)
    }
    fn is_cacheable(&self) -> bool {
        true
    }
    fn can_reuse(&self) -> bool {
        !self.in_use.load(Ordering::SeqCst)
    }
    fn reuse(&self) {
        self.canceled.store(false, Ordering::SeqCst);
    }
    fn set_local(&self, _local: bool) {}
    fn set_fetch_size(&self, _fetch_size: i32) {}
    fn fetch_size(&self) -> i32 {
        -1
    }
    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }
    fn close(&self) {
        self.in_use.store(false, Ordering::SeqCst);
    }
    fn create_yieldable_update(
        &self,
        _session: Arc<Session>,
        _on_result: opal_common::AsyncHandler<i32>,
    ) -> Result<Box<dyn Yieldable>> {
        Err(DbError::Internal("stub statement does not execute".to_string()))
    }
    fn create_yieldable_query(
        &self,
        _session: Arc<Session>,
        _on_result: opal_common::AsyncHandler<Arc<opal_db::LocalResult>>,
    ) -> Result<Box<dyn Yieldable>> {
        Err(DbError::Internal("stub statement does not execute".to_string()))
    }
}

/// A yieldable that records what happened to it
pub struct StubYieldable {
    pub runs: Arc<AtomicUsize>,
    pub errors: Arc<Mutex<Vec<DbError>>>,
}

impl StubYieldable {
    pub fn new() -> (Box<Self>, Arc<AtomicUsize>, Arc<Mutex<Vec<DbError>>>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Self {
                runs: runs.clone(),
                errors: errors.clone(),
            }),
            runs,
            errors,
        )
    }
}

impl Yieldable for StubYieldable {
    fn run(&mut self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn stop(&mut self) {}
    fn back(&mut self) {}
    fn on_error(&mut self, error: DbError) {
        self.errors.lock().push(error);
    }
}

/// Create and register a database with the stub parser
pub fn stub_database(name: &str) -> (Arc<Database>, Arc<AtomicUsize>) {
    let factory = StubParserFactory::new();
    let parse_count = factory.parse_count.clone();
    let database = Database::new(name, DbSettings::default(), Arc::new(factory));
    DatabaseRegistry::global().register(database.clone());
    (database, parse_count)
}
