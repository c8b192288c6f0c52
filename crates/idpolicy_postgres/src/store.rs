//! Postgres adapters for the idpolicy_core port traits.
//!
//! Tables:
//!   users_nodes        - the grant ledger
//!   users_term_status  - per-(user, term) acceptance records
//!   users_masks        - administrator masks
//!   users_valids       - the derived valid-set snapshot
//!   users_locked_fields- columns locked while a grant requires them
//!
//! `users_valids` is fully recomputable from the other tables; `replace`
//! rewrites it in one transaction so readers never observe a partial
//! snapshot.

use std::collections::HashSet;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use idpolicy_core::ports::{
    EnrollmentSource, GrantStore, MaskStore, Result, TermStatusStore, UserDirectory,
    ValidSnapshotStore,
};
use idpolicy_core::{
    FieldRef, GrantRecord, NodeId, PolicyError, TermAcceptance, TermId, UserId, ValidEntry,
};

use crate::retry::{with_retry, RetryPolicy};
use crate::rows::{PgGrantRow, PgTermStatusRow, PgValidRow};

// ── PgGrantStore ──────────────────────────────────────────────

pub struct PgGrantStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgGrantStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

#[async_trait]
impl GrantStore for PgGrantStore {
    async fn list_for_user(&self, user: UserId) -> Result<Vec<GrantRecord>> {
        let rows = with_retry(self.retry, || async {
            sqlx::query_as::<_, PgGrantRow>(
                r#"
                SELECT user_id, node_id, accepted, expires_at, granted_at
                FROM users_nodes
                WHERE user_id = $1
                ORDER BY node_id
                "#,
            )
            .bind(user.0)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        Ok(rows.into_iter().map(GrantRecord::from).collect())
    }

    async fn get(&self, user: UserId, node: NodeId) -> Result<Option<GrantRecord>> {
        let row = with_retry(self.retry, || async {
            sqlx::query_as::<_, PgGrantRow>(
                r#"
                SELECT user_id, node_id, accepted, expires_at, granted_at
                FROM users_nodes
                WHERE user_id = $1 AND node_id = $2
                "#,
            )
            .bind(user.0)
            .bind(node.0)
            .fetch_optional(&self.pool)
            .await
        })
        .await?;
        Ok(row.map(GrantRecord::from))
    }

    async fn upsert(&self, grant: &GrantRecord) -> Result<()> {
        with_retry(self.retry, || async {
            sqlx::query(
                r#"
                INSERT INTO users_nodes (user_id, node_id, accepted, expires_at, granted_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id, node_id)
                DO UPDATE SET accepted = $3, expires_at = $4, granted_at = $5
                "#,
            )
            .bind(grant.user.0)
            .bind(grant.node.0)
            .bind(grant.accepted)
            .bind(grant.expires_at)
            .bind(grant.granted_at)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    /// One transaction: the conflicting rows disappear and the new grant
    /// appears together, or the ledger is untouched.
    async fn replace_conflicting(
        &self,
        revoke: &[NodeId],
        insert: &GrantRecord,
    ) -> Result<()> {
        let revoke_ids: Vec<i32> = revoke.iter().map(|n| n.0).collect();
        with_retry(self.retry, || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                "DELETE FROM users_nodes WHERE user_id = $1 AND node_id = ANY($2)",
            )
            .bind(insert.user.0)
            .bind(&revoke_ids)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                r#"
                INSERT INTO users_nodes (user_id, node_id, accepted, expires_at, granted_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id, node_id)
                DO UPDATE SET accepted = $3, expires_at = $4, granted_at = $5
                "#,
            )
            .bind(insert.user.0)
            .bind(insert.node.0)
            .bind(insert.accepted)
            .bind(insert.expires_at)
            .bind(insert.granted_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await
        })
        .await
    }

    async fn delete(&self, user: UserId, node: NodeId) -> Result<bool> {
        let result = with_retry(self.retry, || async {
            sqlx::query("DELETE FROM users_nodes WHERE user_id = $1 AND node_id = $2")
                .bind(user.0)
                .bind(node.0)
                .execute(&self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = with_retry(self.retry, || async {
            sqlx::query(
                "DELETE FROM users_nodes WHERE expires_at IS NOT NULL AND expires_at <= $1",
            )
            .bind(now)
            .execute(&self.pool)
            .await
        })
        .await?;
        let swept = result.rows_affected();
        if swept > 0 {
            tracing::info!(swept, "expired grant rows deleted");
        }
        Ok(swept)
    }
}

// ── PgTermStatusStore ─────────────────────────────────────────

pub struct PgTermStatusStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgTermStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

#[async_trait]
impl TermStatusStore for PgTermStatusStore {
    async fn get(&self, user: UserId, term: TermId) -> Result<Option<TermAcceptance>> {
        let row = with_retry(self.retry, || async {
            sqlx::query_as::<_, PgTermStatusRow>(
                r#"
                SELECT term_id, revision, status
                FROM users_term_status
                WHERE user_id = $1 AND term_id = $2
                "#,
            )
            .bind(user.0)
            .bind(term.0)
            .fetch_optional(&self.pool)
            .await
        })
        .await?;
        row.map(|r| {
            TermAcceptance::try_from(r).map_err(|e| PolicyError::Internal(anyhow!(e)))
        })
        .transpose()
    }

    async fn list_for_user(&self, user: UserId) -> Result<Vec<TermAcceptance>> {
        let rows = with_retry(self.retry, || async {
            sqlx::query_as::<_, PgTermStatusRow>(
                r#"
                SELECT term_id, revision, status
                FROM users_term_status
                WHERE user_id = $1
                ORDER BY term_id
                "#,
            )
            .bind(user.0)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        rows.into_iter()
            .map(|r| {
                TermAcceptance::try_from(r).map_err(|e| PolicyError::Internal(anyhow!(e)))
            })
            .collect()
    }

    async fn set(&self, user: UserId, acceptance: &TermAcceptance) -> Result<()> {
        with_retry(self.retry, || async {
            sqlx::query(
                r#"
                INSERT INTO users_term_status (user_id, term_id, revision, status)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (user_id, term_id)
                DO UPDATE SET revision = $3, status = $4
                "#,
            )
            .bind(user.0)
            .bind(acceptance.term.0)
            .bind(acceptance.revision)
            .bind(acceptance.status.as_ref())
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }
}

// ── PgMaskStore ───────────────────────────────────────────────

pub struct PgMaskStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgMaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

#[async_trait]
impl MaskStore for PgMaskStore {
    async fn list_for_user(&self, user: UserId) -> Result<HashSet<NodeId>> {
        let rows = with_retry(self.retry, || async {
            sqlx::query_as::<_, (i32,)>(
                "SELECT node_id FROM users_masks WHERE user_id = $1",
            )
            .bind(user.0)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        Ok(rows.into_iter().map(|(id,)| NodeId(id)).collect())
    }

    async fn insert(&self, user: UserId, node: NodeId) -> Result<()> {
        with_retry(self.retry, || async {
            sqlx::query(
                r#"
                INSERT INTO users_masks (user_id, node_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(user.0)
            .bind(node.0)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, user: UserId, node: NodeId) -> Result<bool> {
        let result = with_retry(self.retry, || async {
            sqlx::query("DELETE FROM users_masks WHERE user_id = $1 AND node_id = $2")
                .bind(user.0)
                .bind(node.0)
                .execute(&self.pool)
                .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ── PgValidStore ──────────────────────────────────────────────

pub struct PgValidStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgValidStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

#[async_trait]
impl ValidSnapshotStore for PgValidStore {
    async fn read(&self, user: UserId) -> Result<Vec<ValidEntry>> {
        let rows = with_retry(self.retry, || async {
            sqlx::query_as::<_, PgValidRow>(
                r#"
                SELECT node_id, term_ok, term_semi
                FROM users_valids
                WHERE user_id = $1
                ORDER BY node_id
                "#,
            )
            .bind(user.0)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        Ok(rows.into_iter().map(ValidEntry::from).collect())
    }

    /// Delete-and-insert in one transaction. Concurrent readers see either
    /// the previous snapshot or the new one, never a mix.
    async fn replace(&self, user: UserId, entries: &[ValidEntry]) -> Result<()> {
        with_retry(self.retry, || async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM users_valids WHERE user_id = $1")
                .bind(user.0)
                .execute(&mut *tx)
                .await?;
            for entry in entries {
                sqlx::query(
                    r#"
                    INSERT INTO users_valids (user_id, node_id, term_ok, term_semi)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(user.0)
                .bind(entry.node.0)
                .bind(entry.term_ok)
                .bind(entry.term_semi)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await
    }
}

// ── PgUserDirectory ───────────────────────────────────────────

/// Column identifiers come from the administrator-curated node graph, but
/// they are still interpolated into SQL, so they are validated against a
/// strict identifier shape first.
fn valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn field_parts(field: &FieldRef) -> Result<(&'static str, &str)> {
    let (table, column) = match field {
        FieldRef::Users(c) => ("users", c.as_str()),
        FieldRef::Classes(c) => ("classes", c.as_str()),
        FieldRef::UsersClasses(c) => ("users_classes", c.as_str()),
    };
    if !valid_identifier(column) {
        return Err(PolicyError::InvalidInput(format!(
            "invalid column identifier {column:?}"
        )));
    }
    Ok((table, column))
}

pub struct PgUserDirectory {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn has_field(&self, user: UserId, field: &FieldRef) -> Result<bool> {
        let (table, column) = field_parts(field)?;
        let query = match table {
            "users" => format!(
                "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = $1 AND {column} IS NOT NULL)"
            ),
            "users_classes" => format!(
                "SELECT EXISTS(SELECT 1 FROM users_classes WHERE user_id = $1 AND {column} IS NOT NULL)"
            ),
            _ => format!(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM users_classes uc
                    JOIN classes c ON c.class_id = uc.class_id
                    WHERE uc.user_id = $1 AND c.{column} IS NOT NULL
                )
                "#
            ),
        };
        let (exists,) = with_retry(self.retry, || async {
            sqlx::query_as::<_, (bool,)>(&query)
                .bind(user.0)
                .fetch_one(&self.pool)
                .await
        })
        .await?;
        Ok(exists)
    }

    async fn lock_field(&self, user: UserId, field: &FieldRef) -> Result<()> {
        let (table, column) = field_parts(field)?;
        with_retry(self.retry, || async {
            sqlx::query(
                r#"
                INSERT INTO users_locked_fields (user_id, field_table, field_column)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(user.0)
            .bind(table)
            .bind(column)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn unlock_field(&self, user: UserId, field: &FieldRef) -> Result<()> {
        let (table, column) = field_parts(field)?;
        with_retry(self.retry, || async {
            sqlx::query(
                r#"
                DELETE FROM users_locked_fields
                WHERE user_id = $1 AND field_table = $2 AND field_column = $3
                "#,
            )
            .bind(user.0)
            .bind(table)
            .bind(column)
            .execute(&self.pool)
            .await
            .map(|_| ())
        })
        .await
    }

    async fn verified_email_domains(&self, user: UserId) -> Result<Vec<String>> {
        let rows = with_retry(self.retry, || async {
            sqlx::query_as::<_, (String,)>(
                r#"
                SELECT DISTINCT split_part(address, '@', 2)
                FROM user_emails
                WHERE user_id = $1 AND verified_at IS NOT NULL
                "#,
            )
            .bind(user.0)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        Ok(rows.into_iter().map(|(d,)| d).collect())
    }
}

// ── PgEnrollmentSource ────────────────────────────────────────

/// Nodes implied as approved by class enrollment, via the `class_nodes`
/// mapping table. No ledger rows are written for these.
pub struct PgEnrollmentSource {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgEnrollmentSource {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }
}

#[async_trait]
impl EnrollmentSource for PgEnrollmentSource {
    async fn approved_nodes(&self, user: UserId) -> Result<HashSet<NodeId>> {
        let rows = with_retry(self.retry, || async {
            sqlx::query_as::<_, (i32,)>(
                r#"
                SELECT DISTINCT cn.node_id
                FROM users_classes uc
                JOIN class_nodes cn ON cn.class_id = uc.class_id
                WHERE uc.user_id = $1
                "#,
            )
            .bind(user.0)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        Ok(rows.into_iter().map(|(id,)| NodeId(id)).collect())
    }
}
