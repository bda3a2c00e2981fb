//! End-to-end statement scenarios through the session core

use opal_common::DbError;
use opal_db::{Database, DatabaseRegistry, DbSettings, SessionStatus, User};
use opal_engine::Value;
use opal_sql::{execute_query, execute_update, SqlEngine};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn open_database(name: &str) -> Arc<Database> {
    let database = Database::new(name, DbSettings::default(), Arc::new(SqlEngine));
    DatabaseRegistry::global().register(database.clone());
    database
}

#[test]
fn test_auto_commit_insert_select() {
    let db = open_database("sql_s1");
    let session = db.create_session(User::new("u"));

    let count = execute_update(&session, "CREATE TABLE t(f1 INT, f2 BIGINT)").unwrap();
    assert_eq!(count, 0);

    let count = execute_update(&session, "INSERT INTO t(f1,f2) VALUES(1,2)").unwrap();
    assert_eq!(count, 1);
    assert_eq!(
        session.status(),
        SessionStatus::TransactionNotStart,
        "auto-commit returns the session to idle"
    );

    let result = execute_query(&session, "SELECT f1,f2 FROM t").unwrap();
    assert_eq!(result.columns(), &["F1".to_string(), "F2".to_string()]);
    assert_eq!(result.rows(), &[vec![Value::Int(1), Value::Long(2)]]);
}

#[test]
fn test_savepoint_partial_rollback() {
    let db = open_database("sql_s2");
    let session = db.create_session(User::new("u"));

    execute_update(&session, "CREATE TABLE t(f1 INT, f2 BIGINT)").unwrap();
    execute_update(&session, "BEGIN").unwrap();
    execute_update(&session, "INSERT INTO t(f1,f2) VALUES(1,1)").unwrap();
    execute_update(&session, "SAVEPOINT a").unwrap();
    execute_update(&session, "INSERT INTO t(f1,f2) VALUES(2,2)").unwrap();
    execute_update(&session, "ROLLBACK TO SAVEPOINT a").unwrap();
    execute_update(&session, "COMMIT").unwrap();

    let result = execute_query(&session, "SELECT f1,f2 FROM t").unwrap();
    assert_eq!(result.rows(), &[vec![Value::Int(1), Value::Long(1)]]);
}

#[test]
fn test_lock_timeout_scenario() {
    let db = open_database("sql_s3");
    let a = db.create_session(User::new("a"));
    let b = db.create_session(User::new("b"));

    execute_update(&a, "CREATE TABLE t(f1 INT)").unwrap();

    // A takes and holds the object lock inside an open transaction
    execute_update(&a, "BEGIN").unwrap();
    execute_update(&a, "ALTER TABLE t ADD c1 INT").unwrap();
    assert_eq!(a.lock_count(), 1);

    execute_update(&b, "SET LOCK_TIMEOUT = 50").unwrap();
    let started = Instant::now();
    let error = execute_update(&b, "ALTER TABLE t ADD c2 INT").unwrap_err();
    assert!(matches!(error, DbError::LockTimeout(_)), "got {:?}", error);
    assert!(
        started.elapsed() >= Duration::from_millis(50),
        "the waiter waited out its lock timeout"
    );
    assert_eq!(b.lock_count(), 0);
    assert_eq!(a.lock_count(), 1, "the holder keeps its lock");

    execute_update(&a, "COMMIT").unwrap();
}

#[test]
fn test_lock_wait_resolves_when_holder_commits() {
    let db = open_database("sql_s3b");
    let a = db.create_session(User::new("a"));
    let b = db.create_session(User::new("b"));

    execute_update(&a, "CREATE TABLE t(f1 INT)").unwrap();
    execute_update(&a, "BEGIN").unwrap();
    execute_update(&a, "ALTER TABLE t ADD c1 INT").unwrap();

    execute_update(&b, "SET LOCK_TIMEOUT = 5000").unwrap();
    let b2 = b.clone();
    let waiter = std::thread::spawn(move || execute_update(&b2, "ALTER TABLE t ADD c2 INT"));

    // give the waiter time to queue, then release the lock
    std::thread::sleep(Duration::from_millis(50));
    execute_update(&a, "COMMIT").unwrap();

    let outcome = waiter.join().unwrap();
    assert_eq!(outcome.unwrap(), 0);
    let table = db.find_table("t").unwrap();
    assert_eq!(table.columns.len(), 3);
}

#[test]
fn test_query_cache_invalidation_on_schema_change() {
    let db = open_database("sql_s5");
    let session = db.create_session(User::new("u"));
    execute_update(&session, "CREATE TABLE t(f1 INT)").unwrap();

    let first = session.prepare("SELECT * FROM t", -1).unwrap();
    let second = session.prepare("SELECT * FROM t", -1).unwrap();
    assert!(
        Arc::ptr_eq(&first, &second),
        "repeated prepare hits the cache"
    );

    execute_update(&session, "ALTER TABLE t ADD c INT").unwrap();
    let third = session.prepare("SELECT * FROM t", -1).unwrap();
    assert!(
        !Arc::ptr_eq(&first, &third),
        "a schema change forces a fresh parse"
    );
    // and the fresh plan sees the new column
    let result = opal_sql::execute_query_stmt(&session, &third).unwrap();
    assert_eq!(result.columns().len(), 2);
}

#[test]
fn test_cancel_during_execution() {
    let db = open_database("sql_s6");
    let session = db.create_session(User::new("u"));
    execute_update(&session, "CREATE TABLE t(f1 INT)").unwrap();

    session.cancel();
    let error = execute_query(&session, "SELECT f1 FROM t").unwrap_err();
    assert!(matches!(error, DbError::StatementCanceled));
    assert_eq!(session.status(), SessionStatus::StatementCompleted);

    // the session stays usable
    let result = execute_query(&session, "SELECT f1 FROM t").unwrap();
    assert_eq!(result.row_count(), 0);
}

#[test]
fn test_query_timeout_cancels_statement() {
    let db = open_database("sql_timeout");
    let session = db.create_session(User::new("u"));
    execute_update(&session, "CREATE TABLE t(f1 INT)").unwrap();
    execute_update(&session, "SET THROTTLE = 40").unwrap();
    execute_update(&session, "SET QUERY_TIMEOUT = 1").unwrap();

    // leave the throttle suppression window so the next statement pauses,
    // pushing execution past the 1ms deadline
    std::thread::sleep(Duration::from_millis(60));
    let error = execute_query(&session, "SELECT f1 FROM t").unwrap_err();
    assert!(matches!(error, DbError::StatementCanceled), "got {:?}", error);
}

#[test]
fn test_rollback_undoes_ddl_and_rows() {
    let db = open_database("sql_rollback_ddl");
    let session = db.create_session(User::new("u"));
    execute_update(&session, "CREATE TABLE t(f1 INT)").unwrap();

    execute_update(&session, "BEGIN").unwrap();
    execute_update(&session, "INSERT INTO t(f1) VALUES(1)").unwrap();
    execute_update(&session, "CREATE TABLE u(g1 INT)").unwrap();
    assert!(db.find_table("u").is_some());
    execute_update(&session, "ROLLBACK").unwrap();

    assert!(db.find_table("u").is_none(), "DDL rolled back via catalog snapshot");
    let result = execute_query(&session, "SELECT f1 FROM t").unwrap();
    assert_eq!(result.row_count(), 0, "row insert rolled back");
}

#[test]
fn test_temp_table_on_commit_policies() {
    let db = open_database("sql_temp");
    let session = db.create_session(User::new("u"));

    execute_update(
        &session,
        "CREATE LOCAL TEMPORARY TABLE s(v INT) ON COMMIT DELETE ROWS",
    )
    .unwrap();
    execute_update(&session, "BEGIN").unwrap();
    execute_update(&session, "INSERT INTO s(v) VALUES(1)").unwrap();
    execute_update(&session, "COMMIT").unwrap();

    let result = execute_query(&session, "SELECT v FROM s").unwrap();
    assert_eq!(result.row_count(), 0, "ON COMMIT DELETE ROWS truncates");

    // duplicate temp table name fails with the dedicated error
    let error = execute_update(&session, "CREATE TEMPORARY TABLE s(v INT)").unwrap_err();
    assert!(matches!(error, DbError::TableOrViewAlreadyExists(_)));

    // a session-scoped table disappears with the session
    session.close();
    let other = db.create_session(User::new("u"));
    assert!(execute_query(&other, "SELECT v FROM s").is_err());
}

#[test]
fn test_if_ddl_is_idempotent() {
    let db = open_database("sql_ifddl");
    let session = db.create_session(User::new("u"));

    execute_update(&session, "CREATE TABLE IF NOT EXISTS t(f1 INT)").unwrap();
    execute_update(&session, "CREATE TABLE IF NOT EXISTS t(f1 INT)").unwrap();
    let error = execute_update(&session, "CREATE TABLE t(f1 INT)").unwrap_err();
    assert!(matches!(error, DbError::TableOrViewAlreadyExists(_)));

    execute_update(&session, "DROP TABLE IF EXISTS t").unwrap();
    execute_update(&session, "DROP TABLE IF EXISTS t").unwrap();
    assert!(matches!(
        execute_update(&session, "DROP TABLE t"),
        Err(DbError::NotFound(_))
    ));
}

#[test]
fn test_select_with_filter() {
    let db = open_database("sql_filter");
    let session = db.create_session(User::new("u"));
    execute_update(&session, "CREATE TABLE t(f1 INT, name VARCHAR(10))").unwrap();
    execute_update(
        &session,
        "INSERT INTO t(f1,name) VALUES(1,'a'),(2,'b'),(3,'c')",
    )
    .unwrap();

    let result = execute_query(&session, "SELECT name FROM t WHERE f1 >= 2").unwrap();
    assert_eq!(
        result.rows(),
        &[
            vec![Value::Text("b".to_string())],
            vec![Value::Text("c".to_string())]
        ]
    );

    let result = execute_query(&session, "SELECT f1 FROM t WHERE name = 'a'").unwrap();
    assert_eq!(result.rows(), &[vec![Value::Int(1)]]);
}

#[test]
fn test_last_identity_tracks_insert_keys() {
    let db = open_database("sql_identity");
    let session = db.create_session(User::new("u"));
    execute_update(&session, "CREATE TABLE t(f1 INT)").unwrap();
    execute_update(&session, "INSERT INTO t(f1) VALUES(1),(2),(3)").unwrap();

    match session.last_identity() {
        Value::Long(key) => assert!(key >= 3),
        other => panic!("unexpected identity {:?}", other),
    }
}

#[test]
fn test_scheduler_dispatches_on_handler_threads() {
    use opal_db::{HandlerFactoryType, SessionScheduler};
    use parking_lot::Mutex;

    let db = open_database("sql_sched");
    let scheduler = SessionScheduler::new(2, HandlerFactoryType::RoundRobin);
    scheduler.start();

    let session = db.create_session(User::new("u"));
    scheduler.register(session.clone());

    // submit without pumping: a handler thread must pick the command up
    let statement = session.prepare("CREATE TABLE t(f1 INT)", -1).unwrap();
    let slot = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    let yieldable = statement
        .create_yieldable_update(
            session.clone(),
            Box::new(move |result| {
                *sink.lock() = Some(result);
            }),
        )
        .unwrap();
    session.submit_yieldable_command(statement.id(), yieldable).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(result) = slot.lock().take() {
            assert_eq!(result.unwrap(), 0);
            break;
        }
        assert!(Instant::now() < deadline, "handler never dispatched the command");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(db.find_table("t").is_some());
    scheduler.stop();
}

#[test]
fn test_multi_statement_submission_guard() {
    let db = open_database("sql_guard");
    let session = db.create_session(User::new("u"));
    execute_update(&session, "CREATE TABLE t(f1 INT)").unwrap();

    let statement = session.prepare("INSERT INTO t(f1) VALUES(1)", -1).unwrap();
    let yieldable = statement
        .create_yieldable_update(session.clone(), Box::new(|_| {}))
        .unwrap();
    session.submit_yieldable_command(1, yieldable).unwrap();

    // a second command cannot be submitted while one is parked
    let second = statement
        .create_yieldable_update(session.clone(), Box::new(|_| {}))
        .unwrap();
    assert!(session.submit_yieldable_command(2, second).is_err());

    // drain the parked command
    let command = session.yieldable_command(false, None).unwrap();
    command.run().unwrap();
}
