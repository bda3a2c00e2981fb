//! Statement syntax trees

use opal_db::{DataType, OnCommit};

/// A literal value in SQL text
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

/// A column definition in CREATE/ALTER TABLE
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
}

/// One item of a SELECT projection
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Column(String),
}

/// Comparison operators in WHERE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A single-column predicate
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: CompareOp,
    pub value: Literal,
}

/// A parsed statement
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        if_not_exists: bool,
        temporary: bool,
        name: String,
        columns: Vec<ColumnDef>,
        on_commit: OnCommit,
    },
    DropTable {
        if_exists: bool,
        name: String,
    },
    AlterTableAddColumn {
        table: String,
        column: ColumnDef,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<Literal>>,
    },
    Select {
        table: String,
        items: Vec<SelectItem>,
        filter: Option<Filter>,
    },
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    RollbackToSavepoint(String),
    Set {
        name: String,
        value: String,
    },
}

impl Statement {
    pub fn is_query(&self) -> bool {
        matches!(self, Statement::Select { .. })
    }

    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            Statement::CreateTable { .. }
                | Statement::DropTable { .. }
                | Statement::AlterTableAddColumn { .. }
        )
    }

    pub fn is_if_ddl(&self) -> bool {
        matches!(
            self,
            Statement::CreateTable {
                if_not_exists: true,
                ..
            } | Statement::DropTable {
                if_exists: true,
                ..
            }
        )
    }

    pub fn is_cacheable(&self) -> bool {
        matches!(self, Statement::Select { .. } | Statement::Insert { .. })
    }
}
