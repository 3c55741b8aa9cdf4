//! Tenant context and routing.

pub mod context;
pub mod resolver;

/// Opaque tenant identifier as it appears in the master catalog.
pub type TenantId = String;

pub use context::{current_tenant, with_tenant};
pub use resolver::{CatalogDirectory, StaticDirectory, TenantDirectory, TenantRouter, TenantTarget};
