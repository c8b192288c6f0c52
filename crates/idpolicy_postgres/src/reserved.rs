//! Reserved username registry.
//!
//! A name is reserved when it appears in `reserved_usernames` or collides
//! with a hostname in `hosts`. Machine hostnames double as mail and shell
//! account names, so they can never be issued to users.

use async_trait::async_trait;
use sqlx::PgPool;

use idpolicy_core::ports::Result;
use idpolicy_core::PolicyError;

use crate::retry::{with_retry, RetryPolicy};

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PolicyError::InvalidInput(
            "reserved username must not be empty".into(),
        ));
    }
    Ok(())
}

/// Row-level access behind the reservation policy. The availability
/// decision (hosts union, `Conflict` and `NotFound` mapping) lives in
/// [`ReservedNames`] so it can be exercised without a database.
#[async_trait]
pub trait NameSource: Send + Sync {
    async fn hostname_exists(&self, name: &str) -> Result<bool>;

    async fn reservation_exists(&self, name: &str) -> Result<bool>;

    /// Returns false when the row already existed.
    async fn insert_reservation(&self, name: &str) -> Result<bool>;

    /// Returns false when no row existed.
    async fn delete_reservation(&self, name: &str) -> Result<bool>;
}

/// Reservation policy over any [`NameSource`].
pub struct ReservedNames<S> {
    source: S,
}

pub type PgReservedNames = ReservedNames<PgNameSource>;

impl<S: NameSource> ReservedNames<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    /// Checks both the explicit reservation table and the hosts table.
    pub async fn is_reserved(&self, name: &str) -> Result<bool> {
        Ok(self.source.hostname_exists(name).await?
            || self.source.reservation_exists(name).await?)
    }

    /// `Conflict` when the name is already taken, including names that
    /// collide with a hostname and so never appear in the reservation
    /// table.
    pub async fn insert(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if self.source.hostname_exists(name).await? {
            return Err(PolicyError::Conflict(format!(
                "username {name:?} collides with a hostname"
            )));
        }
        if !self.source.insert_reservation(name).await? {
            return Err(PolicyError::Conflict(format!(
                "username {name:?} is already reserved"
            )));
        }
        Ok(())
    }

    /// `NotFound` when no reservation row exists. Does not touch `hosts` -
    /// hostname reservations are released by decommissioning the host.
    pub async fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if !self.source.delete_reservation(name).await? {
            return Err(PolicyError::NotFound(format!(
                "reserved username {name:?}"
            )));
        }
        Ok(())
    }
}

impl ReservedNames<PgNameSource> {
    /// Production composition over `hosts` and `reserved_usernames`.
    pub fn postgres(pool: PgPool) -> Self {
        Self::new(PgNameSource::new(pool))
    }
}

/// `hosts` and `reserved_usernames` rows in Postgres.
pub struct PgNameSource {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgNameSource {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

#[async_trait]
impl NameSource for PgNameSource {
    async fn hostname_exists(&self, name: &str) -> Result<bool> {
        let (exists,) = with_retry(self.retry, || async {
            sqlx::query_as::<_, (bool,)>(
                "SELECT EXISTS(SELECT hostname FROM hosts WHERE hostname = $1)",
            )
            .bind(name)
            .fetch_one(&self.pool)
            .await
        })
        .await?;
        Ok(exists)
    }

    async fn reservation_exists(&self, name: &str) -> Result<bool> {
        let (exists,) = with_retry(self.retry, || async {
            sqlx::query_as::<_, (bool,)>(
                "SELECT EXISTS(SELECT name FROM reserved_usernames WHERE name = $1)",
            )
            .bind(name)
            .fetch_one(&self.pool)
            .await
        })
        .await?;
        Ok(exists)
    }

    async fn insert_reservation(&self, name: &str) -> Result<bool> {
        let result = with_retry(self.retry, || async {
            sqlx::query(
                r#"
                INSERT INTO reserved_usernames (name)
                VALUES ($1)
                ON CONFLICT (name) DO NOTHING
                "#,
            )
            .bind(name)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_reservation(&self, name: &str) -> Result<bool> {
        let result = with_retry(self.retry, || async {
            sqlx::query("DELETE FROM reserved_usernames WHERE name = $1")
                .bind(name)
                .execute(&self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
