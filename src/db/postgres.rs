//! PostgreSQL adapter.
//!
//! Tenants live in schemas of one physical database, so a lease always points
//! the session's `search_path` at the requested schema (or back at `public`
//! for the default) before the client is handed out. Pooled connections carry
//! session state between leases; setting the path on every lease keeps a
//! previous tenant's schema from leaking into the next.

use crate::config::{DbConfig, DriverKind};
use crate::db::adapter::{DbClient, DriverAdapter, ensure_identifier, ensure_sql};
use crate::db::normalize::{normalize, statement_timeout};
use crate::db::params::{QueryParam, bind_postgres_param, expand_placeholders};
use crate::db::pool_registry::PoolRegistry;
use crate::db::types::{QueryResult, RowToJson, StatementKind};
use crate::error::DbResult;
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use std::time::Instant;
use tokio::time::timeout;
use tracing::warn;

pub struct PostgresAdapter {
    config: DbConfig,
    pools: PoolRegistry<PgPool>,
}

impl PostgresAdapter {
    pub fn new(config: DbConfig) -> Self {
        Self {
            config,
            pools: PoolRegistry::new(),
        }
    }

    fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .database(&self.config.database)
            .ssl_mode(if self.config.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });
        if !self.config.user.is_empty() {
            options = options.username(&self.config.user);
        }
        if !self.config.password.is_empty() {
            options = options.password(&self.config.password);
        }
        options
    }

    async fn pool(&self) -> DbResult<PgPool> {
        let key = self.config.pool_key();
        self.pools
            .get_or_create(&key, || async {
                PgPoolOptions::new()
                    .max_connections(self.config.connection_limit)
                    .acquire_timeout(self.config.acquire_timeout())
                    .idle_timeout(self.config.idle_timeout())
                    .connect_with(self.connect_options())
                    .await
                    .map_err(|e| normalize(DriverKind::Postgres, e))
            })
            .await
    }
}

#[async_trait]
impl DriverAdapter for PostgresAdapter {
    fn kind(&self) -> DriverKind {
        DriverKind::Postgres
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
        let schema = if database.is_empty() {
            "public"
        } else {
            ensure_identifier(database)?
        };
        let pool = self.pool().await?;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| normalize(DriverKind::Postgres, e))?;
        sqlx::query(&format!("SET search_path TO \"{schema}\""))
            .execute(&mut *conn)
            .await
            .map_err(|e| normalize(DriverKind::Postgres, e))?;

        Ok(DbClient::Postgres(Some(conn)))
    }

    async fn query(
        &self,
        client: &mut DbClient,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        let sql = ensure_sql(sql)?;
        let conn = client.as_postgres()?;
        let statement = StatementKind::classify(sql);
        let expanded = expand_placeholders(sql);
        let limit = self.config.query_timeout();
        let started = Instant::now();

        let mut query = sqlx::query(&expanded);
        for param in params {
            query = bind_postgres_param(query, param);
        }

        if statement.is_read() {
            let rows = timeout(limit, query.fetch_all(&mut **conn))
                .await
                .map_err(|_| statement_timeout(limit))?
                .map_err(|e| normalize(DriverKind::Postgres, e))?;
            let elapsed = started.elapsed().as_millis() as u64;
            let rows = rows.iter().map(RowToJson::to_json_map).collect();
            Ok(QueryResult::read(rows, elapsed))
        } else {
            let done = timeout(limit, query.execute(&mut **conn))
                .await
                .map_err(|_| statement_timeout(limit))?
                .map_err(|e| normalize(DriverKind::Postgres, e))?;
            let elapsed = started.elapsed().as_millis() as u64;
            // Postgres reports generated keys only through RETURNING.
            Ok(QueryResult::write(done.rows_affected(), None, elapsed))
        }
    }

    async fn begin(&self, client: &mut DbClient) -> DbResult<()> {
        let conn = client.as_postgres()?;
        sqlx::query("BEGIN")
            .execute(&mut **conn)
            .await
            .map_err(|e| normalize(DriverKind::Postgres, e))?;
        Ok(())
    }

    async fn commit(&self, client: &mut DbClient) -> DbResult<()> {
        let conn = client.as_postgres()?;
        sqlx::query("COMMIT")
            .execute(&mut **conn)
            .await
            .map_err(|e| normalize(DriverKind::Postgres, e))?;
        Ok(())
    }

    async fn rollback(&self, client: &mut DbClient) -> DbResult<()> {
        let conn = client.as_postgres()?;
        sqlx::query("ROLLBACK")
            .execute(&mut **conn)
            .await
            .map_err(|e| normalize(DriverKind::Postgres, e))?;
        Ok(())
    }

    async fn disconnect(&self, client: &mut DbClient) {
        match client {
            DbClient::Postgres(slot) => {
                if slot.take().is_none() {
                    warn!(driver = "PostgreSQL", "connection released twice");
                }
            }
            other => warn!(driver = %other.kind(), "wrong client handed to the PostgreSQL adapter"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> PostgresAdapter {
        PostgresAdapter::new(DbConfig::new(DriverKind::Postgres, "master"))
    }

    #[tokio::test]
    async fn test_blank_sql_rejected_without_connection() {
        let adapter = adapter();
        let mut client = DbClient::Postgres(None);
        let err = adapter.query(&mut client, "   ", &[]).await.unwrap_err();
        assert!(matches!(err, crate::error::DbError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn test_invalid_schema_name_rejected_before_any_pool() {
        let adapter = adapter();
        let err = adapter.connection("tenant; --").await.unwrap_err();
        assert!(err.to_string().contains("invalid database name"));
    }

    #[tokio::test]
    async fn test_double_release_warns_not_panics() {
        let adapter = adapter();
        let mut client = DbClient::Postgres(None);
        adapter.disconnect(&mut client).await;
        adapter.disconnect(&mut client).await;
        assert!(client.is_released());
    }
}
