//! Storage and collaborator port traits.
//! Implemented by idpolicy_postgres - core logic depends only on these
//! traits, so the whole workflow runs against in-memory doubles in tests.
//!
//! Adapters perform their own bounded retries and surface transient
//! failures as `PolicyError::StorageUnavailable`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::closure::ValidEntry;
use crate::error::PolicyError;
use crate::grant::{GrantRecord, UserId};
use crate::node::{FieldRef, NodeId, Translation};
use crate::term::{TermAcceptance, TermId};

pub type Result<T> = std::result::Result<T, PolicyError>;

/// The grant ledger (`users_nodes`).
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn list_for_user(&self, user: UserId) -> Result<Vec<GrantRecord>>;

    async fn get(&self, user: UserId, node: NodeId) -> Result<Option<GrantRecord>>;

    /// Insert or overwrite the (user, node) row.
    async fn upsert(&self, grant: &GrantRecord) -> Result<()>;

    /// Delete the `revoke` rows for `insert.user` and write `insert`, as
    /// one atomic mutation: either the conflicting grants are gone AND
    /// the new grant exists, or the ledger is unchanged. A storage
    /// failure mid-way must never leave the user with neither.
    async fn replace_conflicting(&self, revoke: &[NodeId], insert: &GrantRecord)
        -> Result<()>;

    /// Returns false when no row existed.
    async fn delete(&self, user: UserId, node: NodeId) -> Result<bool>;

    /// Background sweep: drop rows whose expiry has passed. Expiry is
    /// already lazy at closure time; this only reclaims storage.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Per-(user, term) acceptance records (`users_term_status`).
#[async_trait]
pub trait TermStatusStore: Send + Sync {
    async fn get(&self, user: UserId, term: TermId) -> Result<Option<TermAcceptance>>;

    async fn list_for_user(&self, user: UserId) -> Result<Vec<TermAcceptance>>;

    async fn set(&self, user: UserId, acceptance: &TermAcceptance) -> Result<()>;
}

/// Administrator masks (`users_masks`).
#[async_trait]
pub trait MaskStore: Send + Sync {
    async fn list_for_user(&self, user: UserId) -> Result<HashSet<NodeId>>;

    /// Idempotent.
    async fn insert(&self, user: UserId, node: NodeId) -> Result<()>;

    /// Returns false when no mask existed.
    async fn delete(&self, user: UserId, node: NodeId) -> Result<bool>;
}

/// The derived valid-set snapshot (`users_valids`). Fully recomputable;
/// `replace` must be atomic so a reader never observes a partial snapshot.
#[async_trait]
pub trait ValidSnapshotStore: Send + Sync {
    async fn read(&self, user: UserId) -> Result<Vec<ValidEntry>>;

    async fn replace(&self, user: UserId, entries: &[ValidEntry]) -> Result<()>;
}

/// Accessor for the user record and its lockable columns.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Whether the designated column is set (non-null) for this user.
    async fn has_field(&self, user: UserId, field: &FieldRef) -> Result<bool>;

    /// Prevent the user from editing the column while a grant requires it.
    async fn lock_field(&self, user: UserId, field: &FieldRef) -> Result<()>;

    async fn unlock_field(&self, user: UserId, field: &FieldRef) -> Result<()>;

    /// Domains of the user's verified email addresses.
    async fn verified_email_domains(&self, user: UserId) -> Result<Vec<String>>;
}

/// Class-enrollment collaborator: nodes a user's enrollments imply as
/// approved, merged with the grant ledger at closure time.
#[async_trait]
pub trait EnrollmentSource: Send + Sync {
    async fn approved_nodes(&self, user: UserId) -> Result<HashSet<NodeId>>;
}

/// Notification dispatcher. Fire-and-forget: the workflow logs failures
/// and never lets them fail a grant or revoke.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user: UserId, message: &Translation) -> Result<()>;
}
