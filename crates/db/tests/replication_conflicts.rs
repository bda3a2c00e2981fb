//! Replication conflict negotiation across sessions

mod support;

use opal_db::{DbObjectType, SessionStatus, User};
use opal_engine::{Row, Value};
use opal_protocol::{ReplicationAck, ReplicationConflictType};
use support::{stub_database, StubStatement};

#[test]
fn test_row_lock_conflict_winner_is_first_retry_name() {
    let (db, _) = stub_database("repl_row");
    let winner = db.create_session(User::new("w"));
    let loser = db.create_session(User::new("l"));
    winner.set_replication_name(Some("rw".to_string()));
    loser.set_replication_name(Some("rl".to_string()));

    let map = db.transaction_engine().get_map("table.r");
    let loser_txn = loser.get_transaction();
    let savepoint = loser_txn.savepoint_id();
    map.put(&loser_txn, 5, Row::new(5, vec![Value::Int(5)]))
        .unwrap();
    loser.set_current_locked_row(5, savepoint);

    let winner_txn = winner.get_transaction();
    winner.set_replication_conflict_type(ReplicationConflictType::RowLock);
    winner.set_locked_exclusively_by(Some(loser.clone()));

    winner
        .handle_replica_conflict(vec!["rl".to_string()])
        .unwrap();

    // the winner retries; its own name went first in the list
    assert_eq!(winner.status(), SessionStatus::Retrying);
    assert_eq!(
        loser_txn.retry_replication_names(),
        vec!["rw".to_string(), "rl".to_string()]
    );
    assert_eq!(loser_txn.retry_savepoint_id(), savepoint);

    // the loser was rolled back to its locked-row savepoint and requeued
    assert_eq!(loser.status(), SessionStatus::Waiting);
    assert!(map.get(5).is_none(), "the loser's write was undone");
    assert!(
        map.try_lock_row(&winner_txn, 5),
        "the row lock transferred away from the loser"
    );
}

#[test]
fn test_db_object_lock_conflict_transfers_ownership() {
    let (db, _) = stub_database("repl_obj");
    let winner = db.create_session(User::new("w"));
    let loser = db.create_session(User::new("l"));
    winner.set_replication_name(Some("rw".to_string()));
    loser.set_replication_name(Some("rl".to_string()));

    let lock = db.object_lock(DbObjectType::Table, "t");
    let loser_txn = loser.get_transaction();
    let statement = StubStatement::new(1, "CREATE TABLE t(x INT)");
    loser.start_current_command(statement);
    assert!(lock.try_lock(&loser));

    let _winner_txn = winner.get_transaction();
    winner.set_replication_conflict_type(ReplicationConflictType::DbObjectLock);
    winner.set_locked_exclusively_by(Some(loser.clone()));

    winner
        .handle_replica_conflict(vec!["rl".to_string()])
        .unwrap();

    assert_eq!(winner.status(), SessionStatus::Retrying);
    assert_eq!(loser.status(), SessionStatus::Waiting);
    assert_eq!(
        lock.owner().map(|s| s.id()),
        Some(winner.id()),
        "object lock ownership transferred to the winner"
    );
    assert_eq!(winner.lock_count(), 1, "the winner's lock list tracks the transfer");
    assert_eq!(loser.lock_count(), 0);
    // the quirk: the loser's transaction carries the retry list as-is
    assert_eq!(loser_txn.retry_replication_names(), vec!["rl".to_string()]);
}

#[test]
fn test_append_conflict_assigns_deterministic_ranges() {
    let (db, _) = stub_database("repl_append");
    let r1 = db.create_session(User::new("r1"));
    let r2 = db.create_session(User::new("r2"));
    r1.set_replication_name(Some("r1".to_string()));
    r2.set_replication_name(Some("r2".to_string()));

    let map = db.transaction_engine().get_map("table.a");
    let index = map.append_index();
    assert!(index.lock_append(r1.id()));

    r1.set_replication_conflict_type(ReplicationConflictType::Append);
    r1.set_append_map(Some(map.clone()));
    r1.set_locked_exclusively_by(Some(r2.clone()));

    // K1=100,C1=3 and K2=103,C2=2 as the replicas first claimed them
    r1.handle_replica_conflict(vec!["100,3:r1".to_string(), "103,2:r2".to_string()])
        .unwrap();

    assert_eq!(index.max_key(), 105);
    assert_eq!(index.assigned_start_key("r1"), Some(100));
    assert_eq!(index.assigned_start_key("r2"), Some(103));
    assert_eq!(index.append_lock_holder(), None, "append locks released");
    assert_eq!(r1.status(), SessionStatus::Retrying);
    assert_eq!(r2.status(), SessionStatus::RetryingReturnResult);
}

#[test]
fn test_append_winner_suppresses_second_return_result() {
    let (db, _) = stub_database("repl_append_idem");
    let session = db.create_session(User::new("r"));
    session.set_replication_name(Some("r1".to_string()));

    let map = db.transaction_engine().get_map("table.b");
    session.set_replication_conflict_type(ReplicationConflictType::Append);
    session.set_append_map(Some(map));
    session
        .handle_replica_conflict(vec!["1,2:r1".to_string()])
        .unwrap();
    assert_eq!(session.status(), SessionStatus::Retrying);

    // once the append winner is marked, a second transition is a no-op
    session.set_status(SessionStatus::RetryingReturnResult);
    assert_eq!(session.status(), SessionStatus::Retrying);
}

#[test]
fn test_if_ddl_retry_downgrades_after_first_ack() {
    let (db, _) = stub_database("repl_ifddl");
    let session = db.create_session(User::new("r"));
    session.set_replication_name(Some("r1".to_string()));

    let statement = StubStatement::new(3, "CREATE TABLE IF NOT EXISTS t(x INT)");
    statement
        .if_ddl
        .store(true, std::sync::atomic::Ordering::SeqCst);
    session.start_current_command(statement);

    // no ack yet: the transition goes through
    session.set_status(SessionStatus::RetryingReturnResult);
    assert_eq!(session.status(), SessionStatus::RetryingReturnResult);

    let _ack = session.create_replication_update_ack(0, false);
    session.set_status(SessionStatus::RetryingReturnResult);
    assert_eq!(
        session.status(),
        SessionStatus::Retrying,
        "a second return-result for IF-DDL is downgraded"
    );
    session.rollback().unwrap();
}

#[test]
fn test_ack_reports_conflict_and_versions() {
    let (db, _) = stub_database("repl_ack");
    let session = db.create_session(User::new("w"));
    let holder = db.create_session(User::new("h"));
    session.set_replication_name(Some("rw".to_string()));
    holder.set_replication_name(Some("rh".to_string()));

    session.set_replication_conflict_type(ReplicationConflictType::RowLock);
    session.set_locked_exclusively_by(Some(holder));

    let first = session.create_replication_update_ack(1, false);
    let payload = first.payload();
    assert_eq!(payload.conflict_type, ReplicationConflictType::RowLock);
    assert_eq!(
        payload.uncommitted_replication_name,
        Some("rh".to_string())
    );
    assert_eq!(payload.first, -1);
    assert_eq!(payload.ack_version, 1);
    assert!(matches!(first, ReplicationAck::Update(_)));

    // versions count up per ack for the same statement
    let second = session.create_replication_update_ack(1, false);
    assert_eq!(second.payload().ack_version, 2);
}

#[test]
fn test_ack_append_payload_carries_start_key_and_count() {
    let (db, _) = stub_database("repl_ack_append");
    let session = db.create_session(User::new("w"));
    session.set_replication_name(Some("rw".to_string()));
    session.set_replication_conflict_type(ReplicationConflictType::Append);
    session.set_start_key(40);
    session.set_append_count(5);

    let ack = session.create_replication_update_ack(0, false);
    let payload = ack.payload();
    assert_eq!(payload.first, 40);
    assert_eq!(payload.update_count, 5);
    assert_eq!(payload.conflict_type, ReplicationConflictType::Append);
}

#[test]
fn test_distributed_participant_uses_dtransaction_ack() {
    let (db, _) = stub_database("repl_ack_dt");
    let session = db.create_session(User::new("p"));
    session.set_replication_name(Some("rp".to_string()));
    session.set_root(false);
    session.set_auto_commit(false);

    let plain = session.create_replication_update_ack(1, false);
    assert!(plain.is_distributed());

    let prepared = session.create_replication_update_ack(1, true);
    assert!(matches!(
        prepared,
        ReplicationAck::DTransactionPreparedUpdate { phase: 1, .. }
    ));
}

#[test]
fn test_no_conflict_cleans_up_and_idles() {
    let (db, _) = stub_database("repl_none");
    let session = db.create_session(User::new("r"));
    session.set_replication_name(Some("r1".to_string()));
    session.set_auto_commit(false);

    session.handle_replica_conflict(Vec::new()).unwrap();
    assert_eq!(session.replication_name(), None);
    assert_eq!(session.status(), SessionStatus::StatementCompleted);
    assert_eq!(
        session.last_replication_name(),
        Some("r1".to_string()),
        "the last name survives cleanup for ack correlation"
    );
}
