//! Uniform driver contract and the process-wide adapter registry.
//!
//! Every backend implements [`DriverAdapter`] against the same leased-client
//! handle, so the facade never branches on the backend. A [`DbClient`] is
//! exclusively owned by one task: it is never `Clone`, every operation takes
//! `&mut`, and release flips it into an observable released state so a double
//! release warns instead of corrupting a live lease.

use crate::config::DriverKind;
use crate::db::params::QueryParam;
use crate::db::types::QueryResult;
use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;
use sqlx::{MySql, Postgres};
use std::collections::HashMap;
use std::sync::Arc;

/// A leased connection, tagged with the backend it came from.
///
/// The inner `Option` is the lease state: `Some` while held, `None` after
/// release. MariaDB rides the MySQL wire protocol so both variants carry the
/// same connection type, but they stay distinct so the client reports the
/// backend it was actually leased from.
pub enum DbClient {
    Postgres(Option<PoolConnection<Postgres>>),
    MySql(Option<PoolConnection<MySql>>),
    MariaDb(Option<PoolConnection<MySql>>),
    Sqlite(Option<Box<SqliteConnection>>),
}

impl DbClient {
    pub fn kind(&self) -> DriverKind {
        match self {
            Self::Postgres(_) => DriverKind::Postgres,
            Self::MySql(_) => DriverKind::MySql,
            Self::MariaDb(_) => DriverKind::MariaDb,
            Self::Sqlite(_) => DriverKind::Sqlite,
        }
    }

    /// Whether this client has already been returned.
    pub fn is_released(&self) -> bool {
        match self {
            Self::Postgres(conn) => conn.is_none(),
            Self::MySql(conn) | Self::MariaDb(conn) => conn.is_none(),
            Self::Sqlite(conn) => conn.is_none(),
        }
    }

    pub(crate) fn as_postgres(&mut self) -> DbResult<&mut PoolConnection<Postgres>> {
        match self {
            Self::Postgres(Some(conn)) => Ok(conn),
            Self::Postgres(None) => Err(released()),
            other => Err(mismatch("PostgreSQL", other.kind())),
        }
    }

    pub(crate) fn as_mysql(&mut self) -> DbResult<&mut PoolConnection<MySql>> {
        match self {
            Self::MySql(Some(conn)) | Self::MariaDb(Some(conn)) => Ok(conn),
            Self::MySql(None) | Self::MariaDb(None) => Err(released()),
            other => Err(mismatch("MySQL", other.kind())),
        }
    }

    pub(crate) fn as_sqlite(&mut self) -> DbResult<&mut SqliteConnection> {
        match self {
            Self::Sqlite(Some(conn)) => Ok(conn),
            Self::Sqlite(None) => Err(released()),
            other => Err(mismatch("SQLite", other.kind())),
        }
    }
}

impl std::fmt::Debug for DbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbClient")
            .field("driver", &self.kind())
            .field("released", &self.is_released())
            .finish()
    }
}

fn released() -> DbError {
    DbError::connection("connection has already been released")
}

fn mismatch(expected: &str, actual: DriverKind) -> DbError {
    DbError::connection(format!(
        "expected a {expected} connection, got {actual}"
    ))
}

/// Reject blank SQL before any connection is leased.
pub(crate) fn ensure_sql(sql: &str) -> DbResult<&str> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        Err(DbError::invalid_query("SQL statement is empty"))
    } else {
        Ok(trimmed)
    }
}

/// Validate a database/schema name before it is spliced into a switch
/// statement. Identifiers cannot be bound as parameters, so the character set
/// is restricted instead.
pub(crate) fn ensure_identifier(name: &str) -> DbResult<&str> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if ok {
        Ok(name)
    } else {
        Err(DbError::connection(format!(
            "invalid database name: {name:?}"
        )))
    }
}

/// Uniform contract every backend adapter implements.
///
/// Transaction demarcation issues the backend's literal keywords rather than
/// the driver's transaction object so the statements run on the same leased
/// client that executes the work in between.
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// Ensure the pool for the default database exists. Idempotent per
    /// `(driver, host, port, database)` tuple; a no-op for the embedded
    /// engine, which has no pool.
    async fn init_pool(&self) -> DbResult<()>;

    /// Close all pools owned by this adapter. Safe to call with none open.
    async fn close_pool(&self);

    /// Lease a connection. A non-empty `database` differing from the default
    /// switches catalog/schema before the client is handed out, so callers
    /// always receive a connection already pointed at the right database.
    async fn connection(&self, database: &str) -> DbResult<DbClient>;

    /// Execute one statement with positional parameters.
    async fn query(
        &self,
        client: &mut DbClient,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<QueryResult>;

    async fn begin(&self, client: &mut DbClient) -> DbResult<()>;
    async fn commit(&self, client: &mut DbClient) -> DbResult<()>;
    async fn rollback(&self, client: &mut DbClient) -> DbResult<()>;

    /// Return the connection (pooled backends drop the lease; the embedded
    /// engine closes the handle). Never fails from the caller's view; a
    /// double release logs a warning.
    async fn disconnect(&self, client: &mut DbClient);
}

/// Process-wide map from backend family to its adapter.
///
/// Built once at startup, then only read. Shared behind `Arc` so the facade
/// and the tenant directory see the same instances.
pub struct AdapterRegistry {
    adapters: HashMap<DriverKind, Arc<dyn DriverAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn DriverAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: DriverKind) -> DbResult<Arc<dyn DriverAdapter>> {
        self.adapters.get(&kind).cloned().ok_or_else(|| {
            DbError::connection(format!("no adapter registered for {kind}"))
        })
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
