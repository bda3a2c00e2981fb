//! Prepared statements and the parser factory

use crate::ast::Statement;
use crate::parser::parse_sql;
use crate::yieldable::{YieldableQuery, YieldableUpdate};
use opal_common::{AsyncHandler, Result};
use opal_db::{
    LocalResult, ParsedStatement, PreparedStatement, Session, SqlParser, SqlParserFactory,
    Yieldable,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The parser factory injected into a database at creation
pub struct SqlEngine;

impl SqlParserFactory for SqlEngine {
    fn create_parser(&self, session: &Arc<Session>) -> Box<dyn SqlParser> {
        Box::new(SessionParser {
            session: session.clone(),
        })
    }
}

struct SessionParser {
    session: Arc<Session>,
}

impl SqlParser for SessionParser {
    fn parse(&mut self, sql: &str) -> Result<Box<dyn ParsedStatement>> {
        let ast = parse_sql(sql)?;
        Ok(Box::new(ParsedSql {
            session: self.session.clone(),
            sql: sql.to_string(),
            ast,
        }))
    }
}

struct ParsedSql {
    session: Arc<Session>,
    sql: String,
    ast: Statement,
}

impl ParsedStatement for ParsedSql {
    fn prepare(self: Box<Self>) -> Result<Arc<dyn PreparedStatement>> {
        Ok(Arc::new(SqlStatement {
            inner: Arc::new(StatementInner {
                id: self.session.next_object_id(),
                sql: self.sql,
                ast: self.ast,
                local: AtomicBool::new(true),
                fetch_size: Mutex::new(-1),
                in_use: AtomicBool::new(false),
                canceled: AtomicBool::new(false),
            }),
        }))
    }
}

struct StatementInner {
    id: i32,
    sql: String,
    ast: Statement,
    local: AtomicBool,
    fetch_size: Mutex<i32>,
    in_use: AtomicBool,
    canceled: AtomicBool,
}

/// A prepared statement; clones share identity and execution flags
#[derive(Clone)]
pub struct SqlStatement {
    inner: Arc<StatementInner>,
}

impl SqlStatement {
    pub fn ast(&self) -> &Statement {
        &self.inner.ast
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }
}

impl PreparedStatement for SqlStatement {
    fn id(&self) -> i32 {
        self.inner.id
    }

    fn sql(&self) -> &str {
        &self.inner.sql
    }

    fn is_query(&self) -> bool {
        self.inner.ast.is_query()
    }

    fn is_ddl(&self) -> bool {
        self.inner.ast.is_ddl()
    }

    fn is_database_statement(&self) -> bool {
        false
    }

    fn is_if_ddl(&self) -> bool {
        self.inner.ast.is_if_ddl()
    }

    fn is_cacheable(&self) -> bool {
        self.inner.ast.is_cacheable()
    }

    fn can_reuse(&self) -> bool {
        !self.inner.in_use.load(Ordering::Acquire)
    }

    fn reuse(&self) {
        self.inner.canceled.store(false, Ordering::Release);
    }

    fn set_local(&self, local: bool) {
        self.inner.local.store(local, Ordering::Release);
    }

    fn set_fetch_size(&self, fetch_size: i32) {
        *self.inner.fetch_size.lock() = fetch_size;
    }

    fn fetch_size(&self) -> i32 {
        *self.inner.fetch_size.lock()
    }

    fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::Release);
    }

    fn close(&self) {
        // a closed statement becomes reusable from the query cache
        self.inner.in_use.store(false, Ordering::Release);
    }

    fn create_yieldable_update(
        &self,
        session: Arc<Session>,
        on_result: AsyncHandler<i32>,
    ) -> Result<Box<dyn Yieldable>> {
        self.inner.in_use.store(true, Ordering::Release);
        self.inner.canceled.store(false, Ordering::Release);
        Ok(Box::new(YieldableUpdate::new(
            session,
            self.clone(),
            on_result,
        )))
    }

    fn create_yieldable_query(
        &self,
        session: Arc<Session>,
        on_result: AsyncHandler<Arc<LocalResult>>,
    ) -> Result<Box<dyn Yieldable>> {
        self.inner.in_use.store(true, Ordering::Release);
        self.inner.canceled.store(false, Ordering::Release);
        Ok(Box::new(YieldableQuery::new(
            session,
            self.clone(),
            on_result,
        )))
    }
}
