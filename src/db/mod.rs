//! Database access: adapters, pooling, normalization, and the facade.

pub mod adapter;
pub mod facade;
pub mod mariadb;
pub mod mysql;
pub mod normalize;
pub mod params;
pub mod pool_registry;
pub mod postgres;
pub mod sqlite;
pub mod types;

pub use adapter::{AdapterRegistry, DbClient, DriverAdapter};
pub use facade::{Database, TxnClient};
pub use normalize::normalize;
pub use params::QueryParam;
pub use types::{JsonRow, QueryResult, RowToJson, StatementKind};
