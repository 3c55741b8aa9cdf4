//! SQLite adapter.
//!
//! The embedded engine has no server and no pool: every lease opens a fresh
//! connection against the requested file (`create_if_missing`). The first
//! lease against a given file runs a bootstrap hook that creates the
//! migration bookkeeping table; later leases of the same file skip it.

use crate::config::{DbConfig, DriverKind};
use crate::db::adapter::{DbClient, DriverAdapter, ensure_sql};
use crate::db::normalize::{normalize, statement_timeout};
use crate::db::params::{QueryParam, bind_sqlite_param};
use crate::db::types::{QueryResult, RowToJson, StatementKind};
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use sqlx::ConnectOptions;
use sqlx::Connection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

const BOOTSTRAP_DDL: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (\
     name TEXT PRIMARY KEY, applied_at TEXT NOT NULL)";

pub struct SqliteAdapter {
    config: DbConfig,
    /// Files that have already been bootstrapped this process.
    bootstrapped: Mutex<HashSet<String>>,
}

impl SqliteAdapter {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            bootstrapped: Mutex::new(HashSet::new()),
        }
    }

    fn resolve_path<'a>(&'a self, database: &'a str) -> DbResult<&'a str> {
        let path = if database.is_empty() {
            self.config.database.as_str()
        } else {
            database
        };
        if path.is_empty() {
            Err(DbError::connection("SQLite target is missing a file path"))
        } else {
            Ok(path)
        }
    }

    async fn open(&self, path: &str) -> DbResult<SqliteConnection> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let mut conn = options
            .connect()
            .await
            .map_err(|e| normalize(DriverKind::Sqlite, e))?;

        let mut bootstrapped = self.bootstrapped.lock().await;
        if !bootstrapped.contains(path) {
            debug!(file = path, "bootstrapping migration bookkeeping table");
            sqlx::query(BOOTSTRAP_DDL)
                .execute(&mut conn)
                .await
                .map_err(|e| normalize(DriverKind::Sqlite, e))?;
            bootstrapped.insert(path.to_string());
        }
        Ok(conn)
    }
}

#[async_trait]
impl DriverAdapter for SqliteAdapter {
    fn kind(&self) -> DriverKind {
        DriverKind::Sqlite
    }

    /// No pool for the embedded engine.
    async fn init_pool(&self) -> DbResult<()> {
        Ok(())
    }

    async fn close_pool(&self) {}

    async fn connection(&self, database: &str) -> DbResult<DbClient> {
        let path = self.resolve_path(database)?;
        let conn = self.open(path).await?;
        Ok(DbClient::Sqlite(Some(Box::new(conn))))
    }

    async fn query(
        &self,
        client: &mut DbClient,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        let sql = ensure_sql(sql)?;
        let conn = client.as_sqlite()?;
        let statement = StatementKind::classify(sql);
        let limit = self.config.query_timeout();
        let started = Instant::now();

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_sqlite_param(query, param);
        }

        if statement.is_read() {
            let rows = timeout(limit, query.fetch_all(&mut *conn))
                .await
                .map_err(|_| statement_timeout(limit))?
                .map_err(|e| normalize(DriverKind::Sqlite, e))?;
            let elapsed = started.elapsed().as_millis() as u64;
            let rows = rows.iter().map(RowToJson::to_json_map).collect();
            Ok(QueryResult::read(rows, elapsed))
        } else {
            let done = timeout(limit, query.execute(&mut *conn))
                .await
                .map_err(|_| statement_timeout(limit))?
                .map_err(|e| normalize(DriverKind::Sqlite, e))?;
            let elapsed = started.elapsed().as_millis() as u64;
            let affected = done.rows_affected();
            // last_insert_rowid echoes stale ids after non-insert statements,
            // so it is only reported on the insert path
            let insert_id = match statement {
                StatementKind::Insert if affected == 1 && done.last_insert_rowid() > 0 => {
                    Some(done.last_insert_rowid() as u64)
                }
                _ => None,
            };
            Ok(QueryResult::write(affected, insert_id, elapsed))
        }
    }

    async fn begin(&self, client: &mut DbClient) -> DbResult<()> {
        let conn = client.as_sqlite()?;
        sqlx::query("BEGIN TRANSACTION")
            .execute(&mut *conn)
            .await
            .map_err(|e| normalize(DriverKind::Sqlite, e))?;
        Ok(())
    }

    async fn commit(&self, client: &mut DbClient) -> DbResult<()> {
        let conn = client.as_sqlite()?;
        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(|e| normalize(DriverKind::Sqlite, e))?;
        Ok(())
    }

    async fn rollback(&self, client: &mut DbClient) -> DbResult<()> {
        let conn = client.as_sqlite()?;
        sqlx::query("ROLLBACK")
            .execute(&mut *conn)
            .await
            .map_err(|e| normalize(DriverKind::Sqlite, e))?;
        Ok(())
    }

    async fn disconnect(&self, client: &mut DbClient) {
        match client {
            DbClient::Sqlite(slot) => match slot.take() {
                Some(conn) => {
                    if let Err(e) = conn.close().await {
                        warn!(error = %e, "failed to close SQLite connection");
                    }
                }
                None => warn!(driver = "SQLite", "connection released twice"),
            },
            other => warn!(driver = %other.kind(), "wrong client handed to the SQLite adapter"),
        }
    }
}
