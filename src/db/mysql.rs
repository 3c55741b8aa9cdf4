//! MySQL adapter.
//!
//! Tenants are separate databases on one server. The adapter keeps a single
//! pool against the master database and issues `USE` on every lease, so a
//! pooled connection recycled from another tenant's request is always pointed
//! back at the right database before the caller sees it.

use crate::config::{DbConfig, DriverKind};
use crate::db::adapter::{DbClient, DriverAdapter, ensure_identifier, ensure_sql};
use crate::db::normalize::{normalize, statement_timeout};
use crate::db::params::{QueryParam, bind_mysql_param};
use crate::db::pool_registry::PoolRegistry;
use crate::db::types::{QueryResult, RowToJson, StatementKind};
use crate::error::DbResult;
use async_trait::async_trait;
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use sqlx::pool::PoolConnection;
use std::time::Instant;
use tokio::time::timeout;
use tracing::warn;

pub struct MySqlAdapter {
    config: DbConfig,
    pools: PoolRegistry<MySqlPool>,
}

impl MySqlAdapter {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            pools: PoolRegistry::new(),
        }
    }

    fn connect_options(&self) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .database(&self.config.database)
            .charset(&self.config.charset)
            .ssl_mode(if self.config.ssl {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Preferred
            });
        if !self.config.user.is_empty() {
            options = options.username(&self.config.user);
        }
        if !self.config.password.is_empty() {
            options = options.password(&self.config.password);
        }
        options
    }

    async fn pool(&self) -> DbResult<MySqlPool> {
        let key = self.config.pool_key();
        self.pools
            .get_or_create(&key, || async {
                MySqlPoolOptions::new()
                    .max_connections(self.config.connection_limit)
                    .acquire_timeout(self.config.acquire_timeout())
                    .idle_timeout(self.config.idle_timeout())
                    .connect_with(self.connect_options())
                    .await
                    .map_err(|e| normalize(self.kind(), e))
            })
            .await
    }

    /// Lease a connection pointed at `database` (the default when empty).
    async fn lease(&self, database: &str) -> DbResult<PoolConnection<sqlx::MySql>> {
        let target = if database.is_empty() {
            self.config.database.as_str()
        } else {
            database
        };
        let target = ensure_identifier(target)?;

        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(|e| normalize(self.kind(), e))?;
        sqlx::query(&format!("USE `{target}`"))
            .execute(&mut *conn)
            .await
            .map_err(|e| normalize(self.kind(), e))?;
        Ok(conn)
    }

    fn release(&self, client: &mut DbClient) {
        match client {
            DbClient::MySql(slot) => {
                if slot.take().is_none() {
                    warn!(driver = "MySQL", "connection released twice");
                }
            }
            other => warn!(driver = %other.kind(), "wrong client handed to the MySQL adapter"),
        }
    }
}

/// Execute one statement on a MySQL-family client. Shared with the MariaDB
/// adapter, which differs only in transaction keywords and error codes.
pub(crate) async fn run_statement(
    kind: DriverKind,
    limit: std::time::Duration,
    client: &mut DbClient,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<QueryResult> {
    let sql = ensure_sql(sql)?;
    let conn = client.as_mysql()?;
    let statement = StatementKind::classify(sql);
    let started = Instant::now();

    let mut query = sqlx::query(sql);
    for param in params {
        query = bind_mysql_param(query, param);
    }

    if statement.is_read() {
        let rows = timeout(limit, query.fetch_all(&mut **conn))
            .await
            .map_err(|_| statement_timeout(limit))?
            .map_err(|e| normalize(kind, e))?;
        let elapsed = started.elapsed().as_millis() as u64;
        let rows = rows.iter().map(RowToJson::to_json_map).collect();
        Ok(QueryResult::read(rows, elapsed))
    } else {
        let done = timeout(limit, query.execute(&mut **conn))
            .await
            .map_err(|_| statement_timeout(limit))?
            .map_err(|e| normalize(kind, e))?;
        let elapsed = started.elapsed().as_millis() as u64;
        let affected = done.rows_affected();
        // last_insert_id is only meaningful for a single-row insert into an
        // auto-increment key; the server reports 0 otherwise
        let insert_id = match statement {
            StatementKind::Insert if affected == 1 && done.last_insert_id() > 0 => {
                Some(done.last_insert_id())
            }
            _ => None,
        };
        Ok(QueryResult::write(affected, insert_id, elapsed))
    }
}

/// Run a bare transaction keyword on a MySQL-family client.
pub(crate) async fn exec_keyword(
    kind: DriverKind,
    client: &mut DbClient,
    keyword: &str,
) -> DbResult<()> {
    let conn = client.as_mysql()?;
    sqlx::query(keyword)
        .execute(&mut **conn)
        .await
        .map_err(|e| normalize(kind, e))?;
    Ok(())
}

#[async_trait]
impl DriverAdapter for MySqlAdapter {
    fn kind(&self) -> DriverKind {
        DriverKind::MySql
    }

    async fn init_pool(&self) -> DbResult<()> {
        self.pool().await.map(|_| ())
    }

    async fn close_pool(&self) {
        for pool in self.pools.drain().await {
            pool.close().await;
        }
    }

    async fn connection(&self, database: &str) -> DbResult<DbClient> {
        Ok(DbClient::MySql(Some(self.lease(database).await?)))
    }

    async fn query(
        &self,
        client: &mut DbClient,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        run_statement(self.kind(), self.config.query_timeout(), client, sql, params).await
    }

    async fn begin(&self, client: &mut DbClient) -> DbResult<()> {
        exec_keyword(self.kind(), client, "START TRANSACTION").await
    }

    async fn commit(&self, client: &mut DbClient) -> DbResult<()> {
        exec_keyword(self.kind(), client, "COMMIT").await
    }

    async fn rollback(&self, client: &mut DbClient) -> DbResult<()> {
        exec_keyword(self.kind(), client, "ROLLBACK").await
    }

    async fn disconnect(&self, client: &mut DbClient) {
        self.release(client);
    }
}
