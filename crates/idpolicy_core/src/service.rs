//! PolicyService - the grant/revoke workflow around the closure engine.
//!
//! Takes port traits via `Arc<dyn PortTrait>` so the same logic runs
//! against Postgres or the in-memory doubles. Every method takes the
//! target user explicitly; there is no implicit identity anywhere.
//!
//! Closure runs for the same user are serialized through a per-user
//! async lock: the snapshot replace must reflect the most recent input
//! state, never an interleaving of two runs. Runs for different users
//! share nothing and proceed concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::closure::{ClosureEngine, ClosureInput, ClosureResult};
use crate::error::PolicyError;
use crate::grant::{GrantRecord, UserId};
use crate::graph::NodeGraph;
use crate::node::{FieldRef, Node, NodeId, Translation};
use crate::ports::{
    EnrollmentSource, GrantStore, MaskStore, Notifier, Result, TermStatusStore,
    UserDirectory, ValidSnapshotStore,
};
use crate::term::{AcceptanceStatus, TermCatalog, TermId};

/// The port bundle the service is constructed over.
#[derive(Clone)]
pub struct PolicyPorts {
    pub grants: Arc<dyn GrantStore>,
    pub term_status: Arc<dyn TermStatusStore>,
    pub masks: Arc<dyn MaskStore>,
    pub valids: Arc<dyn ValidSnapshotStore>,
    pub users: Arc<dyn UserDirectory>,
    pub enrollments: Arc<dyn EnrollmentSource>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct PolicyService {
    graph: Arc<NodeGraph>,
    terms: Arc<TermCatalog>,
    ports: PolicyPorts,
    user_locks: StdMutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

impl PolicyService {
    pub fn new(graph: Arc<NodeGraph>, terms: Arc<TermCatalog>, ports: PolicyPorts) -> Self {
        Self {
            graph,
            terms,
            ports,
            user_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn terms(&self) -> &TermCatalog {
        &self.terms
    }

    // ── Grant workflow ─────────────────────────────────────────

    /// Administrator/system grant: absent → approved, or requested →
    /// approved when a pending request exists. Conflicting approved nodes
    /// are auto-revoked as part of this operation.
    pub async fn grant(
        &self,
        user: UserId,
        node: NodeId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<GrantRecord> {
        let _guard = self.user_lock(user).await;
        let record = self.approve_locked(user, node, expires_at).await?;
        self.refresh_locked(user).await?;
        let target = self.graph.get(node)?;
        self.notify_quiet(user, target.on_granted.as_ref()).await;
        tracing::info!(%user, %node, "node granted");
        Ok(record)
    }

    /// User request: absent → requested. Same preconditions as a grant,
    /// but the row carries accepted=false and never contributes to the
    /// approved set, so no closure run is needed.
    pub async fn request_grant(&self, user: UserId, node: NodeId) -> Result<GrantRecord> {
        let _guard = self.user_lock(user).await;
        let target = self.graph.get(node)?;
        self.check_preconditions(user, target).await?;
        if let Some(existing) = self.ports.grants.get(user, node).await? {
            if existing.accepted {
                return Err(PolicyError::InvalidTransition(format!(
                    "node {node} is already granted to user {user}"
                )));
            }
        }
        let record = GrantRecord::requested(user, node, Utc::now());
        self.ports.grants.upsert(&record).await?;
        tracing::info!(%user, %node, "grant requested");
        Ok(record)
    }

    /// Administrator action: requested → approved. Fails with `NotFound`
    /// if no pending request exists.
    pub async fn approve_request(
        &self,
        user: UserId,
        node: NodeId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<GrantRecord> {
        let _guard = self.user_lock(user).await;
        match self.ports.grants.get(user, node).await? {
            None => {
                return Err(PolicyError::NotFound(format!(
                    "grant request for node {node} by user {user}"
                )))
            }
            Some(existing) if existing.accepted => {
                return Err(PolicyError::InvalidTransition(format!(
                    "node {node} is already granted to user {user}"
                )))
            }
            Some(_) => {}
        }
        let record = self.approve_locked(user, node, expires_at).await?;
        self.refresh_locked(user).await?;
        let target = self.graph.get(node)?;
        self.notify_quiet(user, target.on_granted.as_ref()).await;
        tracing::info!(%user, %node, "grant request approved");
        Ok(record)
    }

    /// Revoke an existing grant. Nodes that were merely associated by
    /// implication are not cascaded - the next closure run simply no
    /// longer derives them.
    pub async fn revoke(&self, user: UserId, node: NodeId) -> Result<()> {
        let _guard = self.user_lock(user).await;
        self.revoke_locked(user, node).await?;
        self.refresh_locked(user).await?;
        let target = self.graph.get(node)?;
        self.notify_quiet(user, target.on_revoked.as_ref()).await;
        tracing::info!(%user, %node, "node revoked");
        Ok(())
    }

    // ── Masking ────────────────────────────────────────────────

    /// Suppress the node from the user's valid set regardless of
    /// association.
    pub async fn mask(&self, user: UserId, node: NodeId) -> Result<()> {
        let _guard = self.user_lock(user).await;
        self.graph.get(node)?;
        self.ports.masks.insert(user, node).await?;
        self.refresh_locked(user).await?;
        tracing::info!(%user, %node, "node masked");
        Ok(())
    }

    pub async fn unmask(&self, user: UserId, node: NodeId) -> Result<()> {
        let _guard = self.user_lock(user).await;
        self.graph.get(node)?;
        if !self.ports.masks.delete(user, node).await? {
            return Err(PolicyError::NotFound(format!(
                "mask on node {node} for user {user}"
            )));
        }
        self.refresh_locked(user).await?;
        tracing::info!(%user, %node, "node unmasked");
        Ok(())
    }

    // ── Term acceptance ────────────────────────────────────────

    /// Record the user's decision on a specific term revision.
    ///
    /// `StaleRevision` when the submitted revision is not current.
    /// Setting `ok`/`no` on a term no held node requires is rejected as
    /// `InvalidTransition` - a soft validation against stray acceptances,
    /// not a structural rule.
    pub async fn set_term_status(
        &self,
        user: UserId,
        term: TermId,
        revision: i32,
        status: AcceptanceStatus,
    ) -> Result<()> {
        let _guard = self.user_lock(user).await;
        let definition = self.terms.get(term)?;
        if revision != definition.current_revision {
            return Err(PolicyError::StaleRevision {
                submitted: revision,
                current: definition.current_revision,
            });
        }
        if status != AcceptanceStatus::Pending {
            let associated = self.compute_locked(user).await?.associated;
            let required = associated
                .iter()
                .filter_map(|id| self.graph.get(*id).ok())
                .any(|n| n.required_terms.contains(&term));
            if !required {
                return Err(PolicyError::InvalidTransition(format!(
                    "term {term} is not required by any node user {user} holds"
                )));
            }
        }
        self.ports
            .term_status
            .set(
                user,
                &crate::term::TermAcceptance {
                    term,
                    revision,
                    status,
                },
            )
            .await?;
        self.refresh_locked(user).await?;
        tracing::info!(%user, %term, status = status.as_ref(), "term status recorded");
        Ok(())
    }

    // ── Closure refresh ────────────────────────────────────────

    /// Run the closure engine for one user and replace the persisted
    /// valid-set snapshot. Triggered by every mutation above; also public
    /// for system-initiated recomputation (graph edits, enrollment sync).
    pub async fn refresh(&self, user: UserId) -> Result<ClosureResult> {
        let _guard = self.user_lock(user).await;
        self.refresh_locked(user).await
    }

    /// Gather inputs and run the engine, without touching the snapshot.
    async fn compute_locked(&self, user: UserId) -> Result<ClosureResult> {
        let now = Utc::now();

        let mut approved: HashSet<NodeId> = self
            .ports
            .grants
            .list_for_user(user)
            .await?
            .into_iter()
            .filter(|g| g.is_approved(now))
            .map(|g| g.node)
            .collect();
        approved.extend(self.ports.enrollments.approved_nodes(user).await?);

        let recorded = self.ports.term_status.list_for_user(user).await?;
        let statuses = self.terms.effective_statuses(&recorded);
        let masked = self.ports.masks.list_for_user(user).await?;

        Ok(ClosureEngine::new(&self.graph).compute(ClosureInput {
            approved: &approved,
            term_status: &statuses,
            masked: &masked,
        }))
    }

    async fn refresh_locked(&self, user: UserId) -> Result<ClosureResult> {
        let result = self.compute_locked(user).await?;

        let before = self.ports.valids.read(user).await?;
        self.ports.valids.replace(user, &result.valid).await?;
        tracing::debug!(
            %user,
            associated = result.associated.len(),
            valid = result.valid.len(),
            "closure refreshed"
        );

        let old: HashSet<NodeId> = before.iter().map(|v| v.node).collect();
        let new: HashSet<NodeId> = result.valid.iter().map(|v| v.node).collect();
        for &added in new.difference(&old) {
            if let Ok(node) = self.graph.get(added) {
                self.notify_quiet(user, node.valid_added.as_ref()).await;
            }
        }
        for &removed in old.difference(&new) {
            if let Ok(node) = self.graph.get(removed) {
                self.notify_quiet(user, node.valid_removed.as_ref()).await;
            }
        }

        Ok(result)
    }

    // ── Internals ──────────────────────────────────────────────

    /// Preconditions, conflict auto-revoke, field locking, ledger write.
    /// Caller holds the user lock and runs the closure refresh.
    ///
    /// The conflicting-grant deletions and the new grant go through one
    /// atomic ledger operation: a storage failure leaves the user with
    /// their old grants intact, never with neither old nor new.
    async fn approve_locked(
        &self,
        user: UserId,
        node: NodeId,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<GrantRecord> {
        let target = self.graph.get(node)?;
        self.check_preconditions(user, target).await?;
        let conflicting = self.conflicting_grants(user, target).await?;
        for field in &target.required_fields {
            self.ports.users.lock_field(user, field).await?;
        }
        let record = GrantRecord::approved(user, node, expires_at, Utc::now());
        self.ports
            .grants
            .replace_conflicting(&conflicting, &record)
            .await?;
        for &revoked_id in &conflicting {
            tracing::info!(
                %user,
                conflicting = %revoked_id,
                incoming = %target.id,
                "conflicting node auto-revoked"
            );
            let revoked = self.graph.get(revoked_id)?;
            self.unlock_unneeded_fields(user, revoked).await?;
            self.notify_quiet(user, revoked.on_revoked.as_ref()).await;
        }
        Ok(record)
    }

    /// Approved grants that conflict with the incoming node.
    async fn conflicting_grants(&self, user: UserId, incoming: &Node) -> Result<Vec<NodeId>> {
        let now = Utc::now();
        Ok(self
            .ports
            .grants
            .list_for_user(user)
            .await?
            .into_iter()
            .filter(|g| g.is_approved(now) && incoming.in_conflict_with(g.node))
            .map(|g| g.node)
            .collect())
    }

    async fn check_preconditions(&self, user: UserId, node: &Node) -> Result<()> {
        let mut missing = Vec::new();
        for field in &node.required_fields {
            if !self.ports.users.has_field(user, field).await? {
                missing.push(field.clone());
            }
        }
        if !missing.is_empty() {
            return Err(PolicyError::MissingRequiredFields(missing));
        }

        if !node.required_verified_email.is_empty() {
            let verified = self.ports.users.verified_email_domains(user).await?;
            let unmet: Vec<String> = node
                .required_verified_email
                .iter()
                .filter(|domain| !verified.iter().any(|v| v == *domain))
                .cloned()
                .collect();
            if !unmet.is_empty() {
                return Err(PolicyError::MissingVerifiedEmail(unmet));
            }
        }
        Ok(())
    }

    /// Ledger deletion + field unlock. No closure run - callers refresh
    /// once after all mutations of the operation.
    async fn revoke_locked(&self, user: UserId, node: NodeId) -> Result<()> {
        let target = self.graph.get(node)?;
        if !self.ports.grants.delete(user, node).await? {
            return Err(PolicyError::NotFound(format!(
                "grant of node {node} to user {user}"
            )));
        }
        self.unlock_unneeded_fields(user, target).await
    }

    /// Unlock the revoked node's fields, except columns some remaining
    /// approved grant still requires.
    async fn unlock_unneeded_fields(&self, user: UserId, revoked: &Node) -> Result<()> {
        let remaining = self.ports.grants.list_for_user(user).await?;
        let mut still_required: HashSet<FieldRef> = HashSet::new();
        for grant in remaining.iter().filter(|g| g.accepted) {
            if let Ok(node) = self.graph.get(grant.node) {
                still_required.extend(node.required_fields.iter().cloned());
            }
        }
        for field in &revoked.required_fields {
            if !still_required.contains(field) {
                self.ports.users.unlock_field(user, field).await?;
            }
        }
        Ok(())
    }

    async fn notify_quiet(&self, user: UserId, message: Option<&Translation>) {
        let Some(message) = message else { return };
        if let Err(e) = self.ports.notifier.notify(user, message).await {
            tracing::warn!(%user, error = %e, "notification dispatch failed");
        }
    }

    async fn user_lock(&self, user: UserId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.user_locks.lock().expect("user lock registry poisoned");
            // A held or awaited lock is kept alive by its guard/future, so
            // strong_count == 1 means idle; drop those instead of letting
            // the registry grow with every user ever touched.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(locks.entry(user).or_default())
        };
        lock.lock_owned().await
    }
}
