//! End-to-end facade behavior over the embedded backend.

use std::sync::Arc;
use tempfile::TempDir;
use tenantdb::tenant::StaticDirectory;
use tenantdb::{Database, DbConfig, DbError, DriverKind, QueryParam};

fn facade(dir: &TempDir, file: &str) -> Database {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tenantdb=debug")
        .with_test_writer()
        .try_init();
    let path = dir.path().join(file).to_string_lossy().into_owned();
    Database::new(
        DbConfig::new(DriverKind::Sqlite, path),
        Arc::new(StaticDirectory::new([])),
    )
}

#[tokio::test]
async fn test_query_result_shapes_through_facade() {
    let dir = TempDir::new().unwrap();
    let db = facade(&dir, "shapes.db");

    db.query(
        "CREATE TABLE orders (id INTEGER PRIMARY KEY AUTOINCREMENT, sku TEXT, qty INTEGER)",
        &[],
    )
    .await
    .unwrap();

    let insert = db
        .query(
            "INSERT INTO orders (sku, qty) VALUES (?, ?)",
            &[QueryParam::from("A-100"), QueryParam::Int(3)],
        )
        .await
        .unwrap();
    assert_eq!(insert.row_count, 1);
    assert_eq!(insert.insert_id, Some(1));
    assert!(insert.rows.is_empty());

    let select = db
        .query("SELECT sku, qty FROM orders WHERE qty > ?", &[QueryParam::Int(0)])
        .await
        .unwrap();
    assert_eq!(select.row_count, select.rows.len() as u64);
    assert!(select.insert_id.is_none());

    let update = db
        .query("UPDATE orders SET qty = qty + 1", &[])
        .await
        .unwrap();
    assert_eq!(update.row_count, 1);
    assert!(update.rows.is_empty());
    assert!(update.insert_id.is_none());
}

#[tokio::test]
async fn test_transaction_commits_on_success() {
    let dir = TempDir::new().unwrap();
    let db = facade(&dir, "txn_ok.db");

    db.query("CREATE TABLE ledger (amount INTEGER)", &[])
        .await
        .unwrap();

    let total: i64 = db
        .with_transaction(|txn| {
            Box::pin(async move {
                txn.query("INSERT INTO ledger (amount) VALUES (10)", &[])
                    .await?;
                txn.query("INSERT INTO ledger (amount) VALUES (32)", &[])
                    .await?;
                let sum = txn
                    .query("SELECT SUM(amount) AS total FROM ledger", &[])
                    .await?;
                Ok(sum.rows[0]
                    .get("total")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0))
            })
        })
        .await
        .unwrap();
    assert_eq!(total, 42);

    let after = db.query("SELECT amount FROM ledger", &[]).await.unwrap();
    assert_eq!(after.row_count, 2);
}

#[tokio::test]
async fn test_transaction_rolls_back_and_original_error_wins() {
    let dir = TempDir::new().unwrap();
    let db = facade(&dir, "txn_err.db");

    db.query("CREATE TABLE ledger (amount INTEGER)", &[])
        .await
        .unwrap();

    let err = db
        .with_transaction::<(), _>(|txn| {
            Box::pin(async move {
                txn.query("INSERT INTO ledger (amount) VALUES (10)", &[])
                    .await?;
                Err(DbError::invalid_query("business rule violated"))
            })
        })
        .await
        .unwrap_err();

    // the work's own error comes back, not a rollback artifact
    match err {
        DbError::InvalidQuery { reason } => assert_eq!(reason, "business rule violated"),
        other => panic!("unexpected error: {other}"),
    }

    let after = db.query("SELECT amount FROM ledger", &[]).await.unwrap();
    assert_eq!(after.row_count, 0);
}

#[tokio::test]
async fn test_original_error_wins_when_rollback_also_fails() {
    let dir = TempDir::new().unwrap();
    let db = facade(&dir, "txn_rollback_err.db");

    db.query("CREATE TABLE ledger (amount INTEGER)", &[])
        .await
        .unwrap();

    let err = db
        .with_transaction::<(), _>(|txn| {
            Box::pin(async move {
                txn.query("INSERT INTO ledger (amount) VALUES (10)", &[])
                    .await?;
                // end the transaction out from under the orchestrator, so the
                // rollback it issues next has nothing to roll back and fails
                txn.query("COMMIT", &[]).await?;
                Err(DbError::invalid_query("business rule violated"))
            })
        })
        .await
        .unwrap_err();

    // the work's error reaches the caller, not the rollback failure
    match err {
        DbError::InvalidQuery { reason } => assert_eq!(reason, "business rule violated"),
        other => panic!("unexpected error: {other}"),
    }

    // the lease was still released and the facade stays usable
    let rows = db.query("SELECT amount FROM ledger", &[]).await.unwrap();
    assert_eq!(rows.row_count, 1);
    assert!(db.health_check().await);
}

#[tokio::test]
async fn test_failing_statement_inside_transaction_rolls_back() {
    let dir = TempDir::new().unwrap();
    let db = facade(&dir, "txn_stmt_err.db");

    db.query("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();
    db.query("INSERT INTO t (id) VALUES (1)", &[]).await.unwrap();

    let err = db
        .with_transaction::<(), _>(|txn| {
            Box::pin(async move {
                txn.query("INSERT INTO t (id) VALUES (2)", &[]).await?;
                // duplicate primary key fails mid-transaction
                txn.query("INSERT INTO t (id) VALUES (1)", &[]).await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), tenantdb::ErrorCode::UniqueViolation);

    let after = db.query("SELECT id FROM t", &[]).await.unwrap();
    assert_eq!(after.row_count, 1);
}

#[tokio::test]
async fn test_facade_stays_usable_after_errors() {
    let dir = TempDir::new().unwrap();
    let db = facade(&dir, "reuse.db");

    db.query("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
        .await
        .unwrap();
    assert!(db.query("SELECT nope FROM missing", &[]).await.is_err());
    assert!(db.query("", &[]).await.is_err());

    // every lease was returned, so new work proceeds normally
    let ok = db.query("SELECT id FROM t", &[]).await.unwrap();
    assert_eq!(ok.row_count, 0);
    assert!(db.health_check().await);
}

#[tokio::test]
async fn test_health_check_false_on_unreachable_server() {
    let mut config = DbConfig::new(DriverKind::MySql, "master");
    config.host = "127.0.0.1".to_string();
    config.port = 9; // discard port, nothing listens
    config.acquire_timeout_ms = 500;

    let db = Database::new(config, Arc::new(StaticDirectory::new([])));
    assert!(!db.health_check().await);
}

#[tokio::test]
async fn test_concurrent_queries_share_one_facade() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(facade(&dir, "concurrent.db"));

    db.query("CREATE TABLE hits (n INTEGER)", &[]).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let db = Arc::clone(&db);
        handles.push(tokio::spawn(async move {
            db.query("INSERT INTO hits (n) VALUES (?)", &[QueryParam::Int(i)])
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let rows = db.query("SELECT n FROM hits", &[]).await.unwrap();
    assert_eq!(rows.row_count, 8);
}
