//! Request-scoped tenant context.
//!
//! The active tenant rides a `tokio::task_local!`, never a process-global:
//! each request handler wraps its work in [`with_tenant`], concurrent tasks
//! cannot observe each other's tenant, and nested scopes restore the outer
//! tenant on exit. Code that runs outside any scope sees `None` and the
//! facade falls back to the master catalog.

use crate::tenant::TenantId;

tokio::task_local! {
    static CURRENT_TENANT: TenantId;
}

/// Run `fut` with `tenant` as the active tenant for the duration.
pub async fn with_tenant<F>(tenant: impl Into<TenantId>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_TENANT.scope(tenant.into(), fut).await
}

/// The tenant scoped onto the current task, if any.
pub fn current_tenant() -> Option<TenantId> {
    CURRENT_TENANT.try_with(|tenant| tenant.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unscoped_task_has_no_tenant() {
        assert_eq!(current_tenant(), None);
    }

    #[tokio::test]
    async fn test_scope_sets_and_restores() {
        assert_eq!(current_tenant(), None);
        with_tenant("acme", async {
            assert_eq!(current_tenant().as_deref(), Some("acme"));
        })
        .await;
        assert_eq!(current_tenant(), None);
    }

    #[tokio::test]
    async fn test_nested_scope_restores_outer() {
        with_tenant("outer", async {
            with_tenant("inner", async {
                assert_eq!(current_tenant().as_deref(), Some("inner"));
            })
            .await;
            assert_eq!(current_tenant().as_deref(), Some("outer"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_concurrent_tasks_do_not_cross_contaminate() {
        let a = tokio::spawn(with_tenant("tenant_a", async {
            for _ in 0..50 {
                assert_eq!(current_tenant().as_deref(), Some("tenant_a"));
                tokio::task::yield_now().await;
            }
        }));
        let b = tokio::spawn(with_tenant("tenant_b", async {
            for _ in 0..50 {
                assert_eq!(current_tenant().as_deref(), Some("tenant_b"));
                tokio::task::yield_now().await;
            }
        }));
        a.await.unwrap();
        b.await.unwrap();
    }
}
