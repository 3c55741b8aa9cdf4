//! Tenant-to-database resolution.
//!
//! A [`TenantDirectory`] answers "which database serves this tenant"; the
//! [`TenantRouter`] sits in front of it with a process-lifetime cache so the
//! master catalog is not consulted on every request. Tenants move or get
//! deactivated rarely; the router exposes explicit invalidation for when an
//! operator does either.

use crate::db::adapter::DriverAdapter;
use crate::error::{DbError, DbResult};
use crate::tenant::TenantId;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Where a tenant's data lives.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct TenantTarget {
    pub tenant: TenantId,
    /// Database name (or schema, or file path) on the configured server.
    pub database: String,
}

/// Source of truth for tenant placement.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    /// Look up a tenant. `Ok(None)` means the tenant does not exist; errors
    /// are reserved for the lookup itself failing.
    async fn lookup(&self, tenant: &str) -> DbResult<Option<TenantTarget>>;
}

/// Fixed, config-driven directory.
pub struct StaticDirectory {
    entries: HashMap<TenantId, TenantTarget>,
}

impl StaticDirectory {
    pub fn new(targets: impl IntoIterator<Item = TenantTarget>) -> Self {
        Self {
            entries: targets
                .into_iter()
                .map(|t| (t.tenant.clone(), t))
                .collect(),
        }
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn lookup(&self, tenant: &str) -> DbResult<Option<TenantTarget>> {
        Ok(self.entries.get(tenant).cloned())
    }
}

/// Directory backed by the master catalog's `tenants` table.
///
/// This is one of the two callers (the other is the migration runner) that
/// addresses a database explicitly instead of going through tenant routing —
/// routing a catalog lookup through itself would recurse.
pub struct CatalogDirectory {
    adapter: Arc<dyn DriverAdapter>,
    /// Master catalog database name.
    catalog: String,
}

impl CatalogDirectory {
    pub fn new(adapter: Arc<dyn DriverAdapter>, catalog: impl Into<String>) -> Self {
        Self {
            adapter,
            catalog: catalog.into(),
        }
    }
}

#[async_trait]
impl TenantDirectory for CatalogDirectory {
    async fn lookup(&self, tenant: &str) -> DbResult<Option<TenantTarget>> {
        let mut client = self.adapter.connection(&self.catalog).await?;
        let result = self
            .adapter
            .query(
                &mut client,
                "SELECT db_name FROM tenants WHERE id = ? AND active = 1",
                &[tenant.into()],
            )
            .await;
        self.adapter.disconnect(&mut client).await;

        let result = result?;
        let Some(row) = result.rows.first() else {
            return Ok(None);
        };
        match row.get("db_name") {
            Some(JsonValue::String(database)) => Ok(Some(TenantTarget {
                tenant: tenant.to_string(),
                database: database.clone(),
            })),
            _ => Err(DbError::connection(format!(
                "catalog row for tenant {tenant} has no db_name"
            ))),
        }
    }
}

/// Caching front for a [`TenantDirectory`].
pub struct TenantRouter {
    directory: Arc<dyn TenantDirectory>,
    cache: RwLock<HashMap<TenantId, TenantTarget>>,
}

impl TenantRouter {
    pub fn new(directory: Arc<dyn TenantDirectory>) -> Self {
        Self {
            directory,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve a tenant to its target, caching hits for the process lifetime.
    /// Unknown tenants fail with [`DbError::TenantNotFound`] and are not
    /// cached, so a tenant created later resolves without an invalidation.
    pub async fn resolve(&self, tenant: &str) -> DbResult<TenantTarget> {
        {
            let cache = self.cache.read().await;
            if let Some(target) = cache.get(tenant) {
                return Ok(target.clone());
            }
        }

        let target = self
            .directory
            .lookup(tenant)
            .await?
            .ok_or_else(|| DbError::tenant_not_found(tenant))?;

        debug!(tenant, database = %target.database, "resolved tenant");
        let mut cache = self.cache.write().await;
        cache.insert(tenant.to_string(), target.clone());
        Ok(target)
    }

    /// Drop one tenant's cached resolution.
    pub async fn invalidate(&self, tenant: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(tenant);
    }

    /// Drop every cached resolution.
    pub async fn invalidate_all(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn target(tenant: &str, database: &str) -> TenantTarget {
        TenantTarget {
            tenant: tenant.to_string(),
            database: database.to_string(),
        }
    }

    struct CountingDirectory {
        inner: StaticDirectory,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl TenantDirectory for CountingDirectory {
        async fn lookup(&self, tenant: &str) -> DbResult<Option<TenantTarget>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup(tenant).await
        }
    }

    #[tokio::test]
    async fn test_static_directory_lookup() {
        let directory = StaticDirectory::new([target("acme", "tenant_acme")]);
        let hit = directory.lookup("acme").await.unwrap();
        assert_eq!(hit, Some(target("acme", "tenant_acme")));
        assert_eq!(directory.lookup("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_router_caches_resolutions() {
        let directory = Arc::new(CountingDirectory {
            inner: StaticDirectory::new([target("acme", "tenant_acme")]),
            lookups: AtomicUsize::new(0),
        });
        let router = TenantRouter::new(Arc::clone(&directory) as Arc<dyn TenantDirectory>);

        for _ in 0..3 {
            let resolved = router.resolve("acme").await.unwrap();
            assert_eq!(resolved.database, "tenant_acme");
        }
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(router.cached_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_tenant_fails_and_is_not_cached() {
        let directory = Arc::new(CountingDirectory {
            inner: StaticDirectory::new([]),
            lookups: AtomicUsize::new(0),
        });
        let router = TenantRouter::new(Arc::clone(&directory) as Arc<dyn TenantDirectory>);

        let err = router.resolve("ghost").await.unwrap_err();
        assert!(matches!(err, DbError::TenantNotFound { .. }));
        assert_eq!(router.cached_count().await, 0);

        // a second attempt consults the directory again
        let _ = router.resolve("ghost").await;
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidation_forces_a_fresh_lookup() {
        let directory = Arc::new(CountingDirectory {
            inner: StaticDirectory::new([target("acme", "tenant_acme")]),
            lookups: AtomicUsize::new(0),
        });
        let router = TenantRouter::new(Arc::clone(&directory) as Arc<dyn TenantDirectory>);

        router.resolve("acme").await.unwrap();
        router.invalidate("acme").await;
        router.resolve("acme").await.unwrap();
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);

        router.invalidate_all().await;
        assert_eq!(router.cached_count().await, 0);
    }
}
