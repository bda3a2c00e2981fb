//! Embedded usage: open a database, run a few statements, print the rows.
//!
//! ```sh
//! cargo run -p opal-sql --example embedded
//! ```

use opal_db::{Database, DatabaseRegistry, DbSettings, User};
use opal_sql::{execute_query, execute_update, SqlEngine};
use std::sync::Arc;

fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let database = Database::new("demo", DbSettings::default(), Arc::new(SqlEngine));
    DatabaseRegistry::global().register(database.clone());

    let session = database.create_session(User::new("demo"));
    execute_update(&session, "CREATE TABLE t(f1 INT, f2 BIGINT)").unwrap();
    execute_update(&session, "INSERT INTO t(f1,f2) VALUES(1,2),(3,4)").unwrap();

    let result = execute_query(&session, "SELECT f1, f2 FROM t WHERE f1 >= 1").unwrap();
    println!("{}", result.columns().join(" | "));
    while let Some(row) = result.next_row() {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join(" | "));
    }

    session.close();
}
