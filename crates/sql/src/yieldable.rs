//! Yieldable statement execution
//!
//! Each `run` is one work quantum: it either finishes the statement and
//! hands the result to `stop_current_command`, or records why the session
//! cannot progress (lock wait) and returns so the handler moves on. Errors
//! propagate to the dispatching handler, which rolls the statement back and
//! routes them to the registered async handler.

use crate::ast::{CompareOp, Filter, Literal, SelectItem, Statement};
use crate::statement::SqlStatement;
use opal_common::{AsyncHandler, DbError, Result};
use opal_db::{
    Column, DataType, DbObjectLock, DbObjectType, LocalResult, OnCommit as TableOnCommit,
    PreparedStatement, Session, SessionStatus, TableInfo, TempTable, Yieldable,
};
use opal_engine::{PutOutcome, Row, TransactionMap, Value};
use std::sync::Arc;

enum StepOutcome {
    Done(i32),
    /// The session moved to `Waiting`; re-run after wakeup
    Yield,
}

/// Yieldable executing an update statement
pub struct YieldableUpdate {
    session: Arc<Session>,
    statement: SqlStatement,
    handler: Option<AsyncHandler<i32>>,
    started: bool,
    stopped: bool,
}

impl YieldableUpdate {
    pub(crate) fn new(
        session: Arc<Session>,
        statement: SqlStatement,
        handler: AsyncHandler<i32>,
    ) -> Self {
        Self {
            session,
            statement,
            handler: Some(handler),
            started: false,
            stopped: false,
        }
    }
}

impl Yieldable for YieldableUpdate {
    fn run(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        begin_quantum(&self.session, &self.statement, &mut self.started);
        self.session.check_canceled()?;
        if self.statement.is_canceled() {
            return Err(DbError::StatementCanceled);
        }
        match apply_update(&self.session, self.statement.ast())? {
            StepOutcome::Done(count) => {
                self.session.complete_statement();
                let handler = self.handler.take();
                self.session.stop_current_command(handler, Some(Ok(count)));
                Ok(())
            }
            StepOutcome::Yield => Ok(()),
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.handler = None;
    }

    fn back(&mut self) {
        // the statement re-executes from its savepoint on the next run
    }

    fn on_error(&mut self, error: DbError) {
        if let Some(handler) = self.handler.take() {
            handler(Err(error));
        }
    }
}

/// Yieldable executing a query statement
pub struct YieldableQuery {
    session: Arc<Session>,
    statement: SqlStatement,
    handler: Option<AsyncHandler<Arc<LocalResult>>>,
    started: bool,
    stopped: bool,
}

impl YieldableQuery {
    pub(crate) fn new(
        session: Arc<Session>,
        statement: SqlStatement,
        handler: AsyncHandler<Arc<LocalResult>>,
    ) -> Self {
        Self {
            session,
            statement,
            handler: Some(handler),
            started: false,
            stopped: false,
        }
    }
}

impl Yieldable for YieldableQuery {
    fn run(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        begin_quantum(&self.session, &self.statement, &mut self.started);
        self.session.check_canceled()?;
        if self.statement.is_canceled() {
            return Err(DbError::StatementCanceled);
        }
        match self.statement.ast() {
            Statement::Select {
                table,
                items,
                filter,
            } => {
                let result = execute_select(&self.session, table, items, filter.as_ref())?;
                self.session.complete_statement();
                let handler = self.handler.take();
                self.session.stop_current_command(handler, Some(Ok(result)));
                Ok(())
            }
            other => Err(DbError::Internal(format!(
                "not a query: {:?}",
                other
            ))),
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.handler = None;
    }

    fn back(&mut self) {}

    fn on_error(&mut self, error: DbError) {
        if let Some(handler) = self.handler.take() {
            handler(Err(error));
        }
    }
}

fn begin_quantum(session: &Arc<Session>, statement: &SqlStatement, started: &mut bool) {
    if !*started {
        let handle: Arc<dyn PreparedStatement> = Arc::new(statement.clone());
        session.start_current_command(handle);
        *started = true;
    } else {
        // re-dispatched after a wait
        session.set_status(SessionStatus::StatementRunning);
    }
}

// === Update execution ===

fn apply_update(session: &Arc<Session>, ast: &Statement) -> Result<StepOutcome> {
    match ast {
        Statement::CreateTable {
            if_not_exists,
            temporary,
            name,
            columns,
            on_commit,
        } => create_table(session, *if_not_exists, *temporary, name, columns, *on_commit),
        Statement::DropTable { if_exists, name } => drop_table(session, *if_exists, name),
        Statement::AlterTableAddColumn { table, column } => {
            alter_table_add_column(session, table, column)
        }
        Statement::Insert {
            table,
            columns,
            rows,
        } => insert(session, table, columns, rows),
        Statement::Begin => {
            session.begin();
            Ok(StepOutcome::Done(0))
        }
        Statement::Commit => {
            session.commit()?;
            Ok(StepOutcome::Done(0))
        }
        Statement::Rollback => {
            session.rollback()?;
            Ok(StepOutcome::Done(0))
        }
        Statement::Savepoint(name) => {
            session.add_savepoint(name);
            Ok(StepOutcome::Done(0))
        }
        Statement::RollbackToSavepoint(name) => {
            session.rollback_to_savepoint(name)?;
            Ok(StepOutcome::Done(0))
        }
        Statement::Set { name, value } => {
            session.set_setting(name, value)?;
            Ok(StepOutcome::Done(0))
        }
        Statement::Select { .. } => Err(DbError::Internal(
            "query executed through the update path".to_string(),
        )),
    }
}

fn create_table(
    session: &Arc<Session>,
    if_not_exists: bool,
    temporary: bool,
    name: &str,
    columns: &[crate::ast::ColumnDef],
    on_commit: TableOnCommit,
) -> Result<StepOutcome> {
    let lock = session.database().object_lock(DbObjectType::Table, name);
    if !acquire_object_lock(session, &lock) {
        return Ok(StepOutcome::Yield);
    }
    let exists = if temporary {
        session.resources().lock().find_temp_table(name).is_some()
    } else {
        session.database().find_table(name).is_some()
    };
    if exists {
        if if_not_exists {
            return Ok(StepOutcome::Done(0));
        }
        return Err(DbError::TableOrViewAlreadyExists(name.to_string()));
    }
    let mut info = TableInfo::new(
        name,
        columns
            .iter()
            .map(|c| Column::new(c.name.clone(), c.data_type))
            .collect(),
    );
    info.temporary = temporary;
    info.on_commit = on_commit;
    if temporary {
        // session-scoped: the map name carries the session id
        info.map_name = format!("temp.{}.{}", session.id(), name.to_ascii_lowercase());
        let map = session
            .database()
            .transaction_engine()
            .get_map(&info.map_name);
        session.resources().lock().add_temp_table(TempTable {
            info: Arc::new(info),
            map,
        })?;
    } else {
        let map_name = info.map_name.clone();
        session.database().add_table(info)?;
        session.database().transaction_engine().get_map(&map_name);
    }
    tracing::debug!(session = session.id(), table = name, temporary, "table created");
    Ok(StepOutcome::Done(0))
}

fn drop_table(session: &Arc<Session>, if_exists: bool, name: &str) -> Result<StepOutcome> {
    let lock = session.database().object_lock(DbObjectType::Table, name);
    if !acquire_object_lock(session, &lock) {
        return Ok(StepOutcome::Yield);
    }
    if let Some(table) = session.resources().lock().remove_temp_table(name) {
        session
            .database()
            .transaction_engine()
            .drop_map(table.map.name());
        return Ok(StepOutcome::Done(0));
    }
    match session.database().remove_table(name) {
        Some(info) => {
            session
                .database()
                .transaction_engine()
                .drop_map(&info.map_name);
            Ok(StepOutcome::Done(0))
        }
        None if if_exists => Ok(StepOutcome::Done(0)),
        None => Err(DbError::NotFound(format!("table {}", name))),
    }
}

fn alter_table_add_column(
    session: &Arc<Session>,
    table: &str,
    column: &crate::ast::ColumnDef,
) -> Result<StepOutcome> {
    let lock = session.database().object_lock(DbObjectType::Table, table);
    if !acquire_object_lock(session, &lock) {
        return Ok(StepOutcome::Yield);
    }
    let (info, is_temp) = match session.resources().lock().find_temp_table(table) {
        Some(temp) => (temp.info.clone(), true),
        None => match session.database().find_table(table) {
            Some(info) => (info, false),
            None => return Err(DbError::NotFound(format!("table {}", table))),
        },
    };
    if info.column_index(&column.name).is_some() {
        return Err(DbError::invalid_value("column", column.name.clone()));
    }
    let mut updated = (*info).clone();
    updated
        .columns
        .push(Column::new(column.name.clone(), column.data_type));
    if is_temp {
        let map = session
            .database()
            .transaction_engine()
            .get_map(&updated.map_name);
        let mut resources = session.resources().lock();
        resources.remove_temp_table(table);
        resources.add_temp_table(TempTable {
            info: Arc::new(updated),
            map,
        })?;
        // temp DDL must still invalidate cached plans
        session.database().next_modification_meta_id();
    } else {
        session.database().replace_table(updated);
    }
    Ok(StepOutcome::Done(0))
}

fn insert(
    session: &Arc<Session>,
    table: &str,
    columns: &[String],
    literal_rows: &[Vec<Literal>],
) -> Result<StepOutcome> {
    let (info, map) = resolve_table(session, table)?;
    let transaction = session.get_transaction();

    // map the statement's column list onto the table's column order
    let mut positions = Vec::with_capacity(info.columns.len());
    for (index, column) in info.columns.iter().enumerate() {
        let source = if columns.is_empty() {
            Some(index)
        } else {
            columns
                .iter()
                .position(|name| name.eq_ignore_ascii_case(&column.name))
        };
        positions.push(source);
    }

    // a resolved append conflict pins this session's key range
    let index = map.append_index();
    let start = session
        .replication_name()
        .and_then(|name| index.assigned_start_key(&name))
        .unwrap_or_else(|| index.allocate(literal_rows.len() as i64));

    let mut last_key = start;
    for (offset, literals) in literal_rows.iter().enumerate() {
        let key = start + offset as i64;
        let mut values = Vec::with_capacity(info.columns.len());
        for (column, source) in info.columns.iter().zip(&positions) {
            let value = match source {
                Some(position) => match literals.get(*position) {
                    Some(literal) => literal_to_value(literal, column.data_type)?,
                    None => Value::Null,
                },
                None => Value::Null,
            };
            values.push(value);
        }
        match map.put(&transaction, key, Row::new(key, values))? {
            PutOutcome::Ok => {
                last_key = key;
            }
            PutOutcome::Blocked { owner } => {
                // undo this statement's partial work, then wait on the holder
                session.rollback_current_command();
                let engine = session.database().transaction_engine();
                match engine.find_transaction(owner) {
                    Some(owner_transaction) => {
                        session.wait_for_row(
                            &owner_transaction,
                            key,
                            format!("row {} of {}", key, info.name),
                        );
                    }
                    None => {
                        // the holder finished in between; retry immediately
                        session.set_status(SessionStatus::Retrying);
                    }
                }
                return Ok(StepOutcome::Yield);
            }
        }
    }
    session.set_last_row_key(last_key);
    Ok(StepOutcome::Done(literal_rows.len() as i32))
}

// === Query execution ===

fn execute_select(
    session: &Arc<Session>,
    table: &str,
    items: &[SelectItem],
    filter: Option<&Filter>,
) -> Result<Arc<LocalResult>> {
    let (info, map) = resolve_table(session, table)?;

    let mut column_names = Vec::new();
    let mut column_indexes = Vec::new();
    for item in items {
        match item {
            SelectItem::Wildcard => {
                for (index, column) in info.columns.iter().enumerate() {
                    column_names.push(column.name.clone());
                    column_indexes.push(index);
                }
            }
            SelectItem::Column(name) => {
                let index = info
                    .column_index(name)
                    .ok_or_else(|| DbError::NotFound(format!("column {}", name)))?;
                column_names.push(info.columns[index].name.clone());
                column_indexes.push(index);
            }
        }
    }

    let filter_index = match filter {
        Some(filter) => Some(
            info.column_index(&filter.column)
                .ok_or_else(|| DbError::NotFound(format!("column {}", filter.column)))?,
        ),
        None => None,
    };

    let mut rows = Vec::new();
    for row in map.scan() {
        if let (Some(filter), Some(index)) = (filter, filter_index) {
            let cell = row.values.get(index).cloned().unwrap_or(Value::Null);
            if !matches_filter(&cell, filter) {
                continue;
            }
        }
        let projected: Vec<Value> = column_indexes
            .iter()
            .map(|&index| row.values.get(index).cloned().unwrap_or(Value::Null))
            .collect();
        rows.push(projected);
    }
    Ok(Arc::new(LocalResult::new(column_names, rows)))
}

fn matches_filter(value: &Value, filter: &Filter) -> bool {
    let ordering = compare(value, &filter.value);
    match filter.op {
        CompareOp::Eq => ordering == Some(std::cmp::Ordering::Equal),
        CompareOp::Ne => ordering.is_some() && ordering != Some(std::cmp::Ordering::Equal),
        CompareOp::Lt => ordering == Some(std::cmp::Ordering::Less),
        CompareOp::Le => matches!(
            ordering,
            Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
        ),
        CompareOp::Gt => ordering == Some(std::cmp::Ordering::Greater),
        CompareOp::Ge => matches!(
            ordering,
            Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
        ),
    }
}

fn compare(value: &Value, literal: &Literal) -> Option<std::cmp::Ordering> {
    match (value, literal) {
        (Value::Null, _) | (_, Literal::Null) => None,
        (Value::Text(a), Literal::Text(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Boolean(a), Literal::Bool(b)) => Some(a.cmp(b)),
        (value, Literal::Integer(b)) => value.as_long().map(|a| a.cmp(b)).or_else(|| {
            if let Value::Double(a) = value {
                a.partial_cmp(&(*b as f64))
            } else {
                None
            }
        }),
        (Value::Double(a), Literal::Float(b)) => a.partial_cmp(b),
        (value, Literal::Float(b)) => value.as_long().and_then(|a| (a as f64).partial_cmp(b)),
        _ => None,
    }
}

// === Shared helpers ===

fn resolve_table(session: &Arc<Session>, name: &str) -> Result<(Arc<TableInfo>, Arc<TransactionMap>)> {
    if let Some(temp) = session.resources().lock().find_temp_table(name) {
        return Ok((temp.info.clone(), temp.map.clone()));
    }
    let info = session
        .database()
        .find_table(name)
        .ok_or_else(|| DbError::NotFound(format!("table {}", name)))?;
    let map = session
        .database()
        .transaction_engine()
        .get_map(&info.map_name);
    Ok((info, map))
}

fn acquire_object_lock(session: &Arc<Session>, lock: &Arc<DbObjectLock>) -> bool {
    if lock.try_lock(session) {
        return true;
    }
    let owner = lock.owner();
    session.wait_for_lock(lock, owner.as_ref());
    false
}

fn literal_to_value(literal: &Literal, data_type: DataType) -> Result<Value> {
    let value = match (literal, data_type) {
        (Literal::Null, _) => Value::Null,
        (Literal::Integer(v), DataType::Int) => {
            let narrowed = i32::try_from(*v)
                .map_err(|_| DbError::invalid_value("INT", v.to_string()))?;
            Value::Int(narrowed)
        }
        (Literal::Integer(v), DataType::Bigint) => Value::Long(*v),
        (Literal::Integer(v), DataType::Double) => Value::Double(*v as f64),
        (Literal::Float(v), DataType::Double) => Value::Double(*v),
        (Literal::Text(v), DataType::Varchar) => Value::Text(v.clone()),
        (Literal::Bool(v), DataType::Boolean) => Value::Boolean(*v),
        (literal, data_type) => {
            return Err(DbError::invalid_value(
                "literal",
                format!("{:?} for {:?}", literal, data_type),
            ))
        }
    };
    Ok(value)
}
