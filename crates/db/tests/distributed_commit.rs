//! Distributed two-phase commit through nested sessions

mod support;

use opal_common::DbError;
use opal_db::{SessionPool, SessionStatus, User};
use opal_engine::{Row, Value};
use support::stub_database;

#[test]
fn test_distributed_commit_commits_all_participants() {
    let (db, _) = stub_database("dist_commit");
    let root = db.create_session(User::new("u"));
    root.begin();

    let map = db.transaction_engine().get_map("table.d1");
    let root_txn = root.get_transaction();
    map.put(&root_txn, 1, Row::new(1, vec![Value::Int(1)]))
        .unwrap();

    let peer = root.nested_session("127.0.0.2:9210").unwrap();
    assert!(!peer.is_root());
    assert_eq!(peer.parent().map(|p| p.id()), Some(root.id()));

    // the peer applies its share of the transaction
    peer.begin();
    let peer_txn = peer.get_transaction();
    map.put(&peer_txn, 2, Row::new(2, vec![Value::Int(2)]))
        .unwrap();

    // joining the same peer again reuses the session
    let again = root.nested_session("127.0.0.2:9210").unwrap();
    assert_eq!(again.id(), peer.id());
    assert_eq!(root.participants().len(), 1);

    let global = format!("{},{}", root_txn.name(), "127.0.0.2:9210");
    root.commit().unwrap();

    assert!(root.validate_transaction(&global), "the decision record exists");
    assert!(db.transaction_engine().is_prepared(&global));
    assert_eq!(map.get(1).unwrap().values, vec![Value::Int(1)]);
    assert_eq!(map.get(2).unwrap().values, vec![Value::Int(2)]);
    assert_eq!(root.status(), SessionStatus::TransactionNotStart);
    assert!(root.participants().is_empty(), "nested sessions released");

    // the released peer went back to the pool
    let url = opal_db::ConnectionInfo::tcp_url("127.0.0.2:9210", db.name());
    assert_eq!(SessionPool::global().idle_count(&url), 1);
}

#[test]
fn test_distributed_commit_rolls_back_all_on_participant_failure() {
    let (db, _) = stub_database("dist_abort");
    let root = db.create_session(User::new("u"));
    root.begin();

    let map = db.transaction_engine().get_map("table.d2");
    let root_txn = root.get_transaction();
    map.put(&root_txn, 10, Row::new(10, vec![Value::Int(10)]))
        .unwrap();

    let peer = root.nested_session("127.0.0.3:9210").unwrap();
    peer.begin();
    let peer_txn = peer.get_transaction();
    map.put(&peer_txn, 11, Row::new(11, vec![Value::Int(11)]))
        .unwrap();

    let global = format!("{},{}", root_txn.name(), "127.0.0.3:9210");

    // a participant that cannot prepare forces a global rollback
    peer.close();
    let error = root.commit().unwrap_err();
    assert!(matches!(error, DbError::ConnectionBroken(_)));

    assert!(!root.validate_transaction(&global));
    assert!(map.get(10).is_none(), "root write rolled back");
    assert!(map.get(11).is_none(), "peer write rolled back");
    assert_eq!(root.status(), SessionStatus::TransactionNotStart);
    assert!(root.transaction().is_none());
}

#[test]
fn test_local_commit_skips_two_phase() {
    let (db, _) = stub_database("dist_local");
    let session = db.create_session(User::new("u"));
    session.begin();

    let map = db.transaction_engine().get_map("table.d3");
    let txn = session.get_transaction();
    let name = txn.name().to_string();
    map.put(&txn, 1, Row::new(1, vec![Value::Int(1)])).unwrap();
    session.commit().unwrap();

    assert!(map.get(1).is_some());
    assert!(
        !db.transaction_engine().is_prepared(&name),
        "no commit-ready record for a local commit"
    );
}

#[test]
fn test_participant_prepare_then_coordinator_confirm() {
    let (db, _) = stub_database("dist_phases");
    let root = db.create_session(User::new("u"));
    root.begin();
    let root_txn = root.get_transaction();

    let peer = root.nested_session("127.0.0.4:9210").unwrap();
    peer.begin();
    let peer_txn = peer.get_transaction();
    let map = db.transaction_engine().get_map("table.d4");
    map.put(&peer_txn, 7, Row::new(7, vec![Value::Int(7)]))
        .unwrap();

    // drive the phases by hand the way the wire layer would
    let global = format!("{},{}", root_txn.name(), "127.0.0.4:9210");
    peer.prepare_commit(&global).unwrap();
    assert!(db.transaction_engine().is_prepared(&global));
    assert!(
        !db.transaction_engine().validate_transaction(&global),
        "prepared is not decided"
    );
    assert_eq!(peer_txn.global_name(), Some(global.clone()));

    db.transaction_engine().record_commit_decision(&global);
    peer.finish_distributed_commit();
    assert!(map.get(7).is_some());
    assert_eq!(peer.status(), SessionStatus::TransactionNotStart);

    root.rollback().unwrap();
}

#[test]
fn test_async_commit_runs_callback_after_flush() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    let (db, _) = stub_database("dist_async");
    let session = db.create_session(User::new("u"));
    let map = db.transaction_engine().get_map("table.d5");
    let txn = session.get_transaction();
    map.put(&txn, 1, Row::new(1, vec![Value::Int(1)])).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    session
        .async_commit(Some(Box::new(move || {
            flag.store(true, Ordering::SeqCst);
        })))
        .unwrap();

    for _ in 0..200 {
        if done.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(done.load(Ordering::SeqCst));
    assert_eq!(session.status(), SessionStatus::TransactionNotStart);
    assert!(session.transaction().is_none());
    assert!(map.get(1).is_some());
}
