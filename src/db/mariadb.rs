//! MariaDB adapter.
//!
//! MariaDB speaks the MySQL wire protocol, so connections ride sqlx's MySQL
//! driver. It stays a distinct adapter because its dialect diverges where
//! this layer cares: `BEGIN` as the transaction keyword and its own error
//! numbers (1969 for a statement timeout) in the normalizer.

use crate::config::{DbConfig, DriverKind};
use crate::db::adapter::{DbClient, DriverAdapter, ensure_identifier};
use crate::db::mysql::{exec_keyword, run_statement};
use crate::db::normalize::normalize;
use crate::db::params::QueryParam;
use crate::db::pool_registry::PoolRegistry;
use crate::db::types::QueryResult;
use crate::error::DbResult;
use async_trait::async_trait;
use sqlx::MySqlPool;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use tracing::warn;

pub struct MariaDbAdapter {
    config: DbConfig,
    pools: PoolRegistry<MySqlPool>,
}

impl MariaDbAdapter {
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
}

#[async_trait]
impl DriverAdapter for MariaDbAdapter {
    fn kind(&self) -> DriverKind {
        DriverKind::MariaDb
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
        Ok(DbClient::MariaDb(Some(conn)))
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
        exec_keyword(self.kind(), client, "BEGIN").await
    }

    async fn commit(&self, client: &mut DbClient) -> DbResult<()> {
        exec_keyword(self.kind(), client, "COMMIT").await
    }

    async fn rollback(&self, client: &mut DbClient) -> DbResult<()> {
        exec_keyword(self.kind(), client, "ROLLBACK").await
    }

    async fn disconnect(&self, client: &mut DbClient) {
        match client {
            DbClient::MariaDb(slot) => {
                if slot.take().is_none() {
                    warn!(driver = "MariaDB", "connection released twice");
                }
            }
            other => warn!(driver = %other.kind(), "wrong client handed to the MariaDB adapter"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_reports_mariadb_not_mysql() {
        let client = DbClient::MariaDb(None);
        assert_eq!(client.kind(), DriverKind::MariaDb);
    }

    #[tokio::test]
    async fn test_double_release_warns_not_panics() {
        let adapter = MariaDbAdapter::new(DbConfig::new(DriverKind::MariaDb, "master"));
        let mut client = DbClient::MariaDb(None);
        adapter.disconnect(&mut client).await;
        adapter.disconnect(&mut client).await;
        assert!(client.is_released());
    }

    #[tokio::test]
    async fn test_invalid_database_name_rejected_before_any_pool() {
        let adapter = MariaDbAdapter::new(DbConfig::new(DriverKind::MariaDb, "master"));
        let err = adapter.connection("erp`; DROP").await.unwrap_err();
        assert!(err.to_string().contains("invalid database name"));
    }
}
