//! Minimal SQL front for the Opal session core
//!
//! Implements the parser collaborator contract: `SqlEngine` is the factory
//! injected into a database, producing parsers that turn SQL text into
//! prepared statements whose execution is yieldable. The dialect is the
//! small subset the session core needs end-to-end: table DDL, INSERT,
//! SELECT with a simple predicate, transaction control, savepoints, and
//! session settings.

mod ast;
mod exec;
mod lexer;
mod parser;
mod statement;
mod yieldable;

pub use ast::{ColumnDef, CompareOp, Filter, Literal, SelectItem, Statement};
pub use exec::{execute_query, execute_query_stmt, execute_update, execute_update_stmt};
pub use parser::parse_sql;
pub use statement::{SqlEngine, SqlStatement};
