//! PostgreSQL implementations of the idpolicy_core port traits.
//!
//! Each adapter is a newtype wrapping `PgPool`. All SQL is runtime-checked
//! (`sqlx::query`, not `sqlx::query!`) to avoid a compile-time database
//! requirement. Transient pool/connection failures are retried a bounded
//! number of times before surfacing as `PolicyError::StorageUnavailable`.

pub mod catalog;
pub mod config;
pub mod reserved;
pub mod retry;
pub mod rows;
pub mod store;

pub use catalog::PgCatalogStore;
pub use config::StorageConfig;
pub use reserved::{NameSource, PgNameSource, PgReservedNames, ReservedNames};
pub use retry::RetryPolicy;
pub use store::{
    PgEnrollmentSource, PgGrantStore, PgMaskStore, PgTermStatusStore, PgUserDirectory,
    PgValidStore,
};
