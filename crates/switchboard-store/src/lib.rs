pub mod database;
pub mod error;
pub mod schema;
pub mod tenants;

pub use database::Database;
pub use error::StoreError;
pub use tenants::{TenantRepo, TenantRow, TenantStore};
