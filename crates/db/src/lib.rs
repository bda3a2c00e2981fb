//! Session and transaction coordination core
//!
//! For each client connection this crate owns a session that prepares and
//! executes SQL statements, holds locks on database objects, coordinates
//! distributed commits with peer nodes, and resolves replication write
//! conflicts.
//!
//! ## Architecture
//!
//! - `session`: per-connection state, statement lifecycle, commit protocols
//! - `lock`: catalog object locks with wait queues
//! - `replication`: conflict detection state and retry negotiation
//! - `scheduler`: cooperative handler threads dispatching yieldable commands
//! - `resource`: temp objects, LOB unlink set, query and cursor caches
//! - `database`: catalog, session registry, shared counters
//! - `pool`: nested sessions representing remote transaction participants
//!
//! The SQL front and the storage engine are collaborators: the parser is
//! consumed through the traits in `statement`, storage through
//! `opal-engine`.

pub mod command;
pub mod connection;
pub mod database;
pub mod lock;
pub mod pool;
pub mod replication;
pub mod resource;
pub mod result;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod statement;
pub mod status;
pub mod user;

pub use command::{TimeoutListener, Yieldable, YieldableCommand};
pub use connection::{ConnectionInfo, ConnectionScheme};
pub use database::{Column, DataType, Database, DatabaseRegistry, OnCommit, TableInfo};
pub use lock::{DbObjectLock, DbObjectType};
pub use pool::{LocalSessionFactory, SessionFactory, SessionPool};
pub use replication::LockedRow;
pub use resource::{CachedObject, Procedure, SessionResources, TempConstraint, TempIndex, TempTable};
pub use result::{LocalResult, TemporaryResult};
pub use scheduler::{HandlerWake, SessionHandler, SessionScheduler};
pub use session::Session;
pub use settings::{DbSettings, HandlerFactoryType, SessionSetting};
pub use statement::{ParsedStatement, PreparedStatement, SqlParser, SqlParserFactory};
pub use status::SessionStatus;
pub use user::User;
