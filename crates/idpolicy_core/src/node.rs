//! Node definitions - the grantable privileges and their structural fields.
//!
//! A node's identity (`NodeId`, `name`) is stable once issued; the id is what
//! gets persisted, the name is what URIs and third-party apps key on.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::term::TermId;

/// Stable integer identifier for a node. Never reused once issued.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub i32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Localized text for descriptions and notification messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    pub ko: String,
    pub en: String,
}

impl Translation {
    pub fn new(ko: impl Into<String>, en: impl Into<String>) -> Self {
        Self {
            ko: ko.into(),
            en: en.into(),
        }
    }
}

/// Designates one column on a user-adjacent record. Used both to check
/// that a grant's required information has been supplied and to lock
/// that column against user edits while a grant requires it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "table", content = "column", rename_all = "snake_case")]
pub enum FieldRef {
    /// Column on the users record.
    Users(String),
    /// Column on the class-enrollment record.
    Classes(String),
    /// Column on the user-class join record.
    UsersClasses(String),
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Users(c) => write!(f, "users.{c}"),
            Self::Classes(c) => write!(f, "classes.{c}"),
            Self::UsersClasses(c) => write!(f, "users_classes.{c}"),
        }
    }
}

/// A property, qualification, or privilege that users may hold.
///
/// `implies` propagates association forward: any associated node makes all
/// of its implied nodes associated. `implied_by` is a conjunction: a node
/// whose (non-empty) `implied_by` list is entirely associated becomes
/// associated itself. The two relations are curated independently -
/// `implies` expresses "any one source suffices", `implied_by` expresses
/// "all prerequisites required".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub description: Translation,
    /// Nodes that association with this node implies.
    #[serde(default)]
    pub implies: Vec<NodeId>,
    /// When all of these nodes are associated, this node is too.
    #[serde(default)]
    pub implied_by: Vec<NodeId>,
    /// Terms the user must accept for permissions tied to this node.
    #[serde(default)]
    pub required_terms: Vec<TermId>,
    /// Information that must be supplied before this node can be granted.
    /// Granting locks these columns against user edits.
    #[serde(default)]
    pub required_fields: Vec<FieldRef>,
    /// Verified-email domains required for this node to be granted.
    #[serde(default)]
    pub required_verified_email: Vec<String>,
    /// Administrator-curated conflict pairs. Granting this node revokes
    /// any approved node listed here (and vice versa - the relation is
    /// symmetric and validated as such).
    #[serde(default)]
    pub conflicts_with: Vec<NodeId>,
    /// Notification message when the node is granted.
    #[serde(default)]
    pub on_granted: Option<Translation>,
    /// Notification message when the node is revoked.
    #[serde(default)]
    pub on_revoked: Option<Translation>,
    /// Notification message when the node enters the user's valid set.
    #[serde(default)]
    pub valid_added: Option<Translation>,
    /// Notification message when the node leaves the user's valid set.
    #[serde(default)]
    pub valid_removed: Option<Translation>,
}

impl Node {
    /// A node with no edges, requirements, or messages.
    pub fn new(id: NodeId, name: impl Into<String>, description: Translation) -> Self {
        Self {
            id,
            name: name.into(),
            description,
            implies: Vec::new(),
            implied_by: Vec::new(),
            required_terms: Vec::new(),
            required_fields: Vec::new(),
            required_verified_email: Vec::new(),
            conflicts_with: Vec::new(),
            on_granted: None,
            on_revoked: None,
            valid_added: None,
            valid_removed: None,
        }
    }

    pub fn in_conflict_with(&self, other: NodeId) -> bool {
        self.conflicts_with.contains(&other)
    }
}
