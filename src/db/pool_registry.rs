//! Single-creation pool registry.
//!
//! A pool is created at most once per distinct [`PoolKey`]; re-requesting the
//! same key reuses the existing pool. Creation is single-flight: two
//! concurrent first callers for the same key collapse onto one pool via a
//! per-key `OnceCell`, with a double-checked read/write lock guarding the
//! cell map itself. Locks are never held across an await.

use crate::config::PoolKey;
use crate::error::DbResult;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

pub struct PoolRegistry<P> {
    pools: RwLock<HashMap<PoolKey, Arc<OnceCell<P>>>>,
}

impl<P: Clone> PoolRegistry<P> {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Get the pool for `key`, creating it with `init` exactly once.
    ///
    /// A failed `init` leaves the cell empty, so a later call retries.
    pub async fn get_or_create<F, Fut>(&self, key: &PoolKey, init: F) -> DbResult<P>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<P>>,
    {
        let cell = {
            let pools = self.pools.read().await;
            if let Some(cell) = pools.get(key) {
                Arc::clone(cell)
            } else {
                drop(pools);
                let mut pools = self.pools.write().await;
                // Re-check after acquiring the write lock
                if let Some(cell) = pools.get(key) {
                    Arc::clone(cell)
                } else {
                    let cell = Arc::new(OnceCell::new());
                    pools.insert(key.clone(), Arc::clone(&cell));
                    cell
                }
            }
        };

        let pool = cell
            .get_or_try_init(|| async {
                debug!(pool = %key, "Creating connection pool");
                init().await
            })
            .await?;
        Ok(pool.clone())
    }

    /// Number of initialized pools.
    pub async fn len(&self) -> usize {
        let pools = self.pools.read().await;
        pools.values().filter(|cell| cell.get().is_some()).count()
    }

    /// Remove and return every initialized pool for shutdown.
    /// Safe to call when no pool exists.
    pub async fn drain(&self) -> Vec<P> {
        let mut pools = self.pools.write().await;
        pools
            .drain()
            .filter_map(|(_, cell)| cell.get().cloned())
            .collect()
    }
}

impl<P: Clone> Default for PoolRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
