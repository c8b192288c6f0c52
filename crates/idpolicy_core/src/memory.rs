//! In-memory port implementations.
//!
//! Used by the integration tests and by embedders that want the policy
//! engine without a database (fixtures, simulations). Semantics match the
//! Postgres adapters row-for-row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::closure::ValidEntry;
use crate::grant::{GrantRecord, UserId};
use crate::node::{FieldRef, NodeId, Translation};
use crate::ports::{
    EnrollmentSource, GrantStore, MaskStore, Notifier, Result, TermStatusStore,
    UserDirectory, ValidSnapshotStore,
};
use crate::term::{TermAcceptance, TermId};

#[derive(Debug, Default)]
pub struct MemoryGrantStore {
    rows: RwLock<HashMap<(UserId, NodeId), GrantRecord>>,
}

impl MemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn list_for_user(&self, user: UserId) -> Result<Vec<GrantRecord>> {
        let rows = self.rows.read().await;
        let mut out: Vec<GrantRecord> = rows
            .values()
            .filter(|g| g.user == user)
            .cloned()
            .collect();
        out.sort_by_key(|g| g.node);
        Ok(out)
    }

    async fn get(&self, user: UserId, node: NodeId) -> Result<Option<GrantRecord>> {
        Ok(self.rows.read().await.get(&(user, node)).cloned())
    }

    async fn upsert(&self, grant: &GrantRecord) -> Result<()> {
        self.rows
            .write()
            .await
            .insert((grant.user, grant.node), grant.clone());
        Ok(())
    }

    async fn replace_conflicting(
        &self,
        revoke: &[NodeId],
        insert: &GrantRecord,
    ) -> Result<()> {
        // Single write-lock critical section, so the removal and the
        // insert are observed together or not at all.
        let mut rows = self.rows.write().await;
        for &node in revoke {
            rows.remove(&(insert.user, node));
        }
        rows.insert((insert.user, insert.node), insert.clone());
        Ok(())
    }

    async fn delete(&self, user: UserId, node: NodeId) -> Result<bool> {
        Ok(self.rows.write().await.remove(&(user, node)).is_some())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, g| !g.is_expired(now));
        Ok((before - rows.len()) as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemoryTermStatusStore {
    rows: RwLock<HashMap<(UserId, TermId), TermAcceptance>>,
}

impl MemoryTermStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TermStatusStore for MemoryTermStatusStore {
    async fn get(&self, user: UserId, term: TermId) -> Result<Option<TermAcceptance>> {
        Ok(self.rows.read().await.get(&(user, term)).copied())
    }

    async fn list_for_user(&self, user: UserId) -> Result<Vec<TermAcceptance>> {
        let rows = self.rows.read().await;
        let mut out: Vec<TermAcceptance> = rows
            .iter()
            .filter(|((u, _), _)| *u == user)
            .map(|(_, acc)| *acc)
            .collect();
        out.sort_by_key(|a| a.term);
        Ok(out)
    }

    async fn set(&self, user: UserId, acceptance: &TermAcceptance) -> Result<()> {
        self.rows
            .write()
            .await
            .insert((user, acceptance.term), *acceptance);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMaskStore {
    rows: RwLock<HashSet<(UserId, NodeId)>>,
}

impl MemoryMaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MaskStore for MemoryMaskStore {
    async fn list_for_user(&self, user: UserId) -> Result<HashSet<NodeId>> {
        Ok(self
            .rows
            .read()
            .await
            .iter()
            .filter(|(u, _)| *u == user)
            .map(|(_, n)| *n)
            .collect())
    }

    async fn insert(&self, user: UserId, node: NodeId) -> Result<()> {
        self.rows.write().await.insert((user, node));
        Ok(())
    }

    async fn delete(&self, user: UserId, node: NodeId) -> Result<bool> {
        Ok(self.rows.write().await.remove(&(user, node)))
    }
}

#[derive(Debug, Default)]
pub struct MemoryValidStore {
    rows: RwLock<HashMap<UserId, Vec<ValidEntry>>>,
}

impl MemoryValidStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ValidSnapshotStore for MemoryValidStore {
    async fn read(&self, user: UserId) -> Result<Vec<ValidEntry>> {
        Ok(self.rows.read().await.get(&user).cloned().unwrap_or_default())
    }

    async fn replace(&self, user: UserId, entries: &[ValidEntry]) -> Result<()> {
        self.rows.write().await.insert(user, entries.to_vec());
        Ok(())
    }
}

/// Test double for the user record. Fields are "set" by calling
/// [`MemoryUserDirectory::supply_field`].
#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    present: RwLock<HashSet<(UserId, FieldRef)>>,
    locked: RwLock<HashSet<(UserId, FieldRef)>>,
    domains: RwLock<HashMap<UserId, Vec<String>>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn supply_field(&self, user: UserId, field: FieldRef) {
        self.present.write().await.insert((user, field));
    }

    pub async fn set_verified_domains(&self, user: UserId, domains: Vec<String>) {
        self.domains.write().await.insert(user, domains);
    }

    pub async fn is_locked(&self, user: UserId, field: &FieldRef) -> bool {
        self.locked.read().await.contains(&(user, field.clone()))
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn has_field(&self, user: UserId, field: &FieldRef) -> Result<bool> {
        Ok(self
            .present
            .read()
            .await
            .contains(&(user, field.clone())))
    }

    async fn lock_field(&self, user: UserId, field: &FieldRef) -> Result<()> {
        self.locked.write().await.insert((user, field.clone()));
        Ok(())
    }

    async fn unlock_field(&self, user: UserId, field: &FieldRef) -> Result<()> {
        self.locked.write().await.remove(&(user, field.clone()));
        Ok(())
    }

    async fn verified_email_domains(&self, user: UserId) -> Result<Vec<String>> {
        Ok(self
            .domains
            .read()
            .await
            .get(&user)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct MemoryEnrollmentSource {
    rows: RwLock<HashMap<UserId, HashSet<NodeId>>>,
}

impl MemoryEnrollmentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_approved(&self, user: UserId, nodes: HashSet<NodeId>) {
        self.rows.write().await.insert(user, nodes);
    }
}

#[async_trait]
impl EnrollmentSource for MemoryEnrollmentSource {
    async fn approved_nodes(&self, user: UserId) -> Result<HashSet<NodeId>> {
        Ok(self
            .rows
            .read()
            .await
            .get(&user)
            .cloned()
            .unwrap_or_default())
    }
}

/// Records every dispatched message so tests can assert on notifications.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: RwLock<Vec<(UserId, Translation)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<(UserId, Translation)> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user: UserId, message: &Translation) -> Result<()> {
        self.sent.write().await.push((user, message.clone()));
        Ok(())
    }
}

/// Always fails. Exercises the fire-and-forget contract: a broken
/// dispatcher must never fail a grant or revoke.
#[derive(Debug, Default)]
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _user: UserId, _message: &Translation) -> Result<()> {
        Err(crate::error::PolicyError::Internal(anyhow::anyhow!(
            "notification channel down"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grant::GrantRecord;
    use chrono::Duration;

    #[tokio::test]
    async fn grant_store_round_trip() {
        let store = MemoryGrantStore::new();
        let now = Utc::now();
        let g = GrantRecord::approved(UserId(1), NodeId(2), None, now);
        store.upsert(&g).await.unwrap();
        assert_eq!(store.get(UserId(1), NodeId(2)).await.unwrap(), Some(g));
        assert!(store.delete(UserId(1), NodeId(2)).await.unwrap());
        assert!(!store.delete(UserId(1), NodeId(2)).await.unwrap());
    }

    #[tokio::test]
    async fn replace_conflicting_swaps_rows_together() {
        let store = MemoryGrantStore::new();
        let now = Utc::now();
        store
            .upsert(&GrantRecord::approved(UserId(1), NodeId(5), None, now))
            .await
            .unwrap();
        store
            .upsert(&GrantRecord::approved(UserId(1), NodeId(6), None, now))
            .await
            .unwrap();
        let incoming = GrantRecord::approved(UserId(1), NodeId(7), None, now);
        store
            .replace_conflicting(&[NodeId(5), NodeId(6)], &incoming)
            .await
            .unwrap();
        assert_eq!(store.get(UserId(1), NodeId(5)).await.unwrap(), None);
        assert_eq!(store.get(UserId(1), NodeId(6)).await.unwrap(), None);
        assert_eq!(
            store.get(UserId(1), NodeId(7)).await.unwrap(),
            Some(incoming)
        );
    }

    #[tokio::test]
    async fn expired_sweep_only_removes_past_expiry() {
        let store = MemoryGrantStore::new();
        let now = Utc::now();
        store
            .upsert(&GrantRecord::approved(
                UserId(1),
                NodeId(1),
                Some(now - Duration::hours(1)),
                now - Duration::days(1),
            ))
            .await
            .unwrap();
        store
            .upsert(&GrantRecord::approved(UserId(1), NodeId(2), None, now))
            .await
            .unwrap();
        assert_eq!(store.delete_expired(now).await.unwrap(), 1);
        assert_eq!(store.list_for_user(UserId(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mask_store_is_idempotent() {
        let store = MemoryMaskStore::new();
        store.insert(UserId(1), NodeId(5)).await.unwrap();
        store.insert(UserId(1), NodeId(5)).await.unwrap();
        assert_eq!(
            store.list_for_user(UserId(1)).await.unwrap(),
            HashSet::from([NodeId(5)])
        );
        assert!(store.delete(UserId(1), NodeId(5)).await.unwrap());
        assert!(!store.delete(UserId(1), NodeId(5)).await.unwrap());
    }

    #[tokio::test]
    async fn valid_store_replaces_wholesale() {
        let store = MemoryValidStore::new();
        let first = vec![ValidEntry {
            node: NodeId(1),
            term_ok: true,
            term_semi: true,
        }];
        store.replace(UserId(1), &first).await.unwrap();
        let second = vec![ValidEntry {
            node: NodeId(2),
            term_ok: false,
            term_semi: true,
        }];
        store.replace(UserId(1), &second).await.unwrap();
        assert_eq!(store.read(UserId(1)).await.unwrap(), second);
    }

    #[tokio::test]
    async fn user_directory_lock_cycle() {
        let dir = MemoryUserDirectory::new();
        let field = FieldRef::Users("bs_number".into());
        assert!(!dir.has_field(UserId(1), &field).await.unwrap());
        dir.supply_field(UserId(1), field.clone()).await;
        assert!(dir.has_field(UserId(1), &field).await.unwrap());
        dir.lock_field(UserId(1), &field).await.unwrap();
        assert!(dir.is_locked(UserId(1), &field).await);
        dir.unlock_field(UserId(1), &field).await.unwrap();
        assert!(!dir.is_locked(UserId(1), &field).await);
    }
}
