//! Grant ledger records and the per-(user, node) state machine.
//!
//! absent → requested(accepted=false) → approved(accepted=true)
//!        → { expired | revoked → absent }
//!
//! Expiry is evaluated lazily at closure time: a past-expiry grant simply
//! stops counting as approved, with no deletion pass required. A
//! background sweep may still delete stale rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::node::NodeId;

/// Stable integer identifier for a user of the identity service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct UserId(pub i32);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of the grant ledger (`users_nodes`).
///
/// `accepted = true` means administrator/system-granted; `accepted = false`
/// is a user request that has not been granted yet and never contributes
/// to the approved set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantRecord {
    pub user: UserId,
    pub node: NodeId,
    pub accepted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_at: DateTime<Utc>,
}

impl GrantRecord {
    pub fn requested(user: UserId, node: NodeId, now: DateTime<Utc>) -> Self {
        Self {
            user,
            node,
            accepted: false,
            expires_at: None,
            granted_at: now,
        }
    }

    pub fn approved(
        user: UserId,
        node: NodeId,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            user,
            node,
            accepted: true,
            expires_at,
            granted_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if t <= now)
    }

    /// Whether this grant contributes to the user's approved set.
    pub fn is_approved(&self, now: DateTime<Utc>) -> bool {
        self.accepted && !self.is_expired(now)
    }

    pub fn state(&self, now: DateTime<Utc>) -> GrantState {
        if !self.accepted {
            GrantState::Requested
        } else if self.is_expired(now) {
            GrantState::Expired
        } else {
            GrantState::Approved
        }
    }
}

/// Observable state of a ledger row at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantState {
    Requested,
    Approved,
    Expired,
}
