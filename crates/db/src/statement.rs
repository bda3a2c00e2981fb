//! Parser and prepared-statement collaborator contracts
//!
//! The SQL front is external to the session core; the session consumes it
//! through these traits. `Database::create_parser` goes through the factory
//! injected at database creation.

use crate::command::Yieldable;
use crate::result::LocalResult;
use crate::session::Session;
use opal_common::{AsyncHandler, Result};
use std::sync::Arc;

/// Parses SQL text into statements for one session
pub trait SqlParser: Send {
    fn parse(&mut self, sql: &str) -> Result<Box<dyn ParsedStatement>>;
}

/// A parsed statement, not yet bound to execution resources
pub trait ParsedStatement: Send {
    fn prepare(self: Box<Self>) -> Result<Arc<dyn PreparedStatement>>;
}

/// A prepared statement held by the session (and its caches)
pub trait PreparedStatement: Send + Sync {
    /// Statement id, unique within the session
    fn id(&self) -> i32;

    /// The original SQL text
    fn sql(&self) -> &str;

    /// Whether this statement produces a result set
    fn is_query(&self) -> bool;

    fn is_ddl(&self) -> bool;

    /// Whether this is a database-level statement (create/drop database)
    fn is_database_statement(&self) -> bool;

    /// Whether this is DDL guarded by IF [NOT] EXISTS
    fn is_if_ddl(&self) -> bool;

    /// Whether the query cache may hold this statement
    fn is_cacheable(&self) -> bool;

    /// Whether a cached instance can be handed out again right now
    fn can_reuse(&self) -> bool;

    /// Reset reusable state after a cache hit
    fn reuse(&self);

    fn set_local(&self, local: bool);

    fn set_fetch_size(&self, fetch_size: i32);

    fn fetch_size(&self) -> i32;

    /// Request cancellation of an in-flight execution
    fn cancel(&self);

    /// Close the statement, making it reusable from the cache
    fn close(&self);

    /// Build the yieldable executing this statement as an update
    fn create_yieldable_update(
        &self,
        session: Arc<Session>,
        on_result: AsyncHandler<i32>,
    ) -> Result<Box<dyn Yieldable>>;

    /// Build the yieldable executing this statement as a query
    fn create_yieldable_query(
        &self,
        session: Arc<Session>,
        on_result: AsyncHandler<Arc<LocalResult>>,
    ) -> Result<Box<dyn Yieldable>>;
}

/// Creates parsers bound to a session; injected at database creation
pub trait SqlParserFactory: Send + Sync {
    fn create_parser(&self, session: &Arc<Session>) -> Box<dyn SqlParser>;
}
