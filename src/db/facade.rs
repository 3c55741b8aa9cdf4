//! Query facade and transaction orchestration.
//!
//! [`Database`] is the single entry point the application talks to: it
//! resolves the active tenant, leases a connection from the right adapter,
//! runs the work, and guarantees the lease is returned exactly once on every
//! path. Structured events are emitted around every query, transaction, and
//! health probe under the `tenantdb::query`, `tenantdb::transaction`, and
//! `tenantdb::health` targets with `phase` set to `start`, `success`, or
//! `error`.

use crate::config::{DbConfig, DriverKind};
use crate::db::adapter::{AdapterRegistry, DbClient, DriverAdapter, ensure_sql};
use crate::db::mariadb::MariaDbAdapter;
use crate::db::mysql::MySqlAdapter;
use crate::db::params::QueryParam;
use crate::db::postgres::PostgresAdapter;
use crate::db::sqlite::SqliteAdapter;
use crate::db::types::QueryResult;
use crate::error::DbResult;
use crate::tenant::context::current_tenant;
use crate::tenant::resolver::{CatalogDirectory, TenantDirectory, TenantRouter};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Tenant-aware database access facade.
pub struct Database {
    registry: AdapterRegistry,
    driver: DriverKind,
    master: DbConfig,
    router: Arc<TenantRouter>,
}

impl Database {
    /// Build a facade over `config` with an explicit tenant directory.
    pub fn new(config: DbConfig, directory: Arc<dyn TenantDirectory>) -> Self {
        let adapter = build_adapter(&config);
        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        Self {
            registry,
            driver: config.driver,
            master: config,
            router: Arc::new(TenantRouter::new(directory)),
        }
    }

    /// Build a facade whose tenant directory is the master catalog's
    /// `tenants` table, read through the same adapter.
    pub fn with_catalog_directory(config: DbConfig) -> Self {
        let adapter = build_adapter(&config);
        let directory = Arc::new(CatalogDirectory::new(
            Arc::clone(&adapter),
            config.database.clone(),
        ));
        let mut registry = AdapterRegistry::new();
        registry.register(adapter);
        Self {
            registry,
            driver: config.driver,
            master: config,
            router: Arc::new(TenantRouter::new(directory)),
        }
    }

    pub fn driver(&self) -> DriverKind {
        self.driver
    }

    /// Router handle for cache invalidation when a tenant moves.
    pub fn router(&self) -> &TenantRouter {
        &self.router
    }

    /// Eagerly create the pool for the master database.
    pub async fn init(&self) -> DbResult<()> {
        self.adapter()?.init_pool().await
    }

    /// Close every pool. Safe to call more than once.
    pub async fn close(&self) -> DbResult<()> {
        self.adapter()?.close_pool().await;
        Ok(())
    }

    fn adapter(&self) -> DbResult<Arc<dyn DriverAdapter>> {
        self.registry.get(self.driver)
    }

    /// Database for the current tenant scope; the master catalog when no
    /// tenant is scoped.
    async fn resolve_database(&self) -> DbResult<String> {
        match current_tenant() {
            Some(tenant) => Ok(self.router.resolve(&tenant).await?.database),
            None => Ok(self.master.database.clone()),
        }
    }

    /// Execute one statement against the current tenant's database.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        // reject malformed calls before resolving or leasing anything
        ensure_sql(sql)?;
        let database = self.resolve_database().await?;
        self.query_on(&database, sql, params).await
    }

    /// Execute one statement against an explicit database, bypassing tenant
    /// routing. Used by the catalog directory and the migration runner.
    pub async fn query_on(
        &self,
        database: &str,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult> {
        ensure_sql(sql)?;
        let adapter = self.adapter()?;
        let tenant = current_tenant().unwrap_or_default();
        debug!(
            target: "tenantdb::query",
            phase = "start",
            tenant = %tenant,
            database = %database,
            driver = %self.driver,
        );

        let mut client = adapter.connection(database).await?;
        let result = adapter.query(&mut client, sql, params).await;
        adapter.disconnect(&mut client).await;

        match &result {
            Ok(r) => debug!(
                target: "tenantdb::query",
                phase = "success",
                tenant = %tenant,
                database = %database,
                rows = r.row_count,
                elapsed_ms = r.elapsed_ms,
            ),
            Err(e) => warn!(
                target: "tenantdb::query",
                phase = "error",
                tenant = %tenant,
                database = %database,
                code = %e.code(),
                error = %e,
            ),
        }
        result
    }

    /// Run `work` inside a transaction on the current tenant's database.
    ///
    /// Commit on success; rollback when `work` errors, with the original
    /// error propagating even if the rollback itself fails. No automatic
    /// retry: transient failures surface to the caller as retryable codes.
    pub async fn with_transaction<T, F>(&self, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxnClient) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let database = self.resolve_database().await?;
        self.with_transaction_on(&database, work).await
    }

    /// Transaction against an explicit database; the migration runner's path.
    pub async fn with_transaction_on<T, F>(&self, database: &str, work: F) -> DbResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut TxnClient) -> BoxFuture<'c, DbResult<T>> + Send,
    {
        let adapter = self.adapter()?;
        let tenant = current_tenant().unwrap_or_default();
        let started = Instant::now();
        debug!(
            target: "tenantdb::transaction",
            phase = "start",
            tenant = %tenant,
            database = %database,
        );

        let client = adapter.connection(database).await?;
        let mut txn = TxnClient {
            adapter: Arc::clone(&adapter),
            client,
        };

        let result = match adapter.begin(&mut txn.client).await {
            Ok(()) => match work(&mut txn).await {
                Ok(value) => adapter.commit(&mut txn.client).await.map(|()| value),
                Err(original) => {
                    if let Err(rollback_err) = adapter.rollback(&mut txn.client).await {
                        // the caller's error stays primary
                        warn!(
                            target: "tenantdb::transaction",
                            tenant = %tenant,
                            database = %database,
                            error = %rollback_err,
                            "rollback failed after transaction error",
                        );
                    }
                    Err(original)
                }
            },
            Err(begin_err) => Err(begin_err),
        };
        adapter.disconnect(&mut txn.client).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(
                target: "tenantdb::transaction",
                phase = "success",
                tenant = %tenant,
                database = %database,
                elapsed_ms,
            ),
            Err(e) => warn!(
                target: "tenantdb::transaction",
                phase = "error",
                tenant = %tenant,
                database = %database,
                code = %e.code(),
                error = %e,
                elapsed_ms,
            ),
        }
        result
    }

    /// Liveness probe against the master database. Never errors: any failure
    /// is logged and reported as `false`.
    pub async fn health_check(&self) -> bool {
        debug!(target: "tenantdb::health", phase = "start", driver = %self.driver);
        match self.query_on(&self.master.database, "SELECT 1", &[]).await {
            Ok(_) => {
                debug!(target: "tenantdb::health", phase = "success");
                true
            }
            Err(e) => {
                warn!(target: "tenantdb::health", phase = "error", code = %e.code(), error = %e);
                false
            }
        }
    }
}

fn build_adapter(config: &DbConfig) -> Arc<dyn DriverAdapter> {
    match config.driver {
        DriverKind::Postgres => Arc::new(PostgresAdapter::new(config.clone())),
        DriverKind::MySql => Arc::new(MySqlAdapter::new(config.clone())),
        DriverKind::MariaDb => Arc::new(MariaDbAdapter::new(config.clone())),
        DriverKind::Sqlite => Arc::new(SqliteAdapter::new(config.clone())),
    }
}

/// The one connection a transaction runs on.
///
/// Statements issued through it execute sequentially on the leased client, so
/// everything between `begin` and `commit`/`rollback` is ordered.
pub struct TxnClient {
    adapter: Arc<dyn DriverAdapter>,
    client: DbClient,
}

impl TxnClient {
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.adapter.query(&mut self.client, sql, params).await
    }
}
