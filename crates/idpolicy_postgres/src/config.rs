//! Storage configuration, loaded from the environment (with `.env`
//! support via dotenvy).

use std::time::Duration;

use anyhow::anyhow;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use idpolicy_core::ports::Result;
use idpolicy_core::PolicyError;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub retry: RetryPolicy,
}

impl StorageConfig {
    /// Reads `DATABASE_URL` (required), `IDPOLICY_MAX_CONNECTIONS`,
    /// `IDPOLICY_RETRY_ATTEMPTS`, and `IDPOLICY_RETRY_BACKOFF_MS`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| PolicyError::InvalidInput("DATABASE_URL is not set".into()))?;
        let max_connections = parse_var("IDPOLICY_MAX_CONNECTIONS", 5)?;
        let attempts = parse_var("IDPOLICY_RETRY_ATTEMPTS", 3)?;
        let backoff_ms: u64 = parse_var("IDPOLICY_RETRY_BACKOFF_MS", 100)?;
        Ok(Self {
            database_url,
            max_connections,
            retry: RetryPolicy {
                attempts,
                backoff: Duration::from_millis(backoff_ms),
            },
        })
    }

    pub async fn connect(&self) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.database_url)
            .await
            .map_err(|e| PolicyError::Internal(anyhow!(e)))
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            PolicyError::InvalidInput(format!("{name} must be a number, got {raw:?}"))
        }),
        Err(_) => Ok(default),
    }
}
