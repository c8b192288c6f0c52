//! Legal terms and per-user acceptance status.
//!
//! Acceptance is tied to a specific revision. A record against an older
//! revision than the term's current one counts as `Pending` - never `Ok`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use strum::AsRefStr;

use crate::error::PolicyError;
use crate::node::Translation;

/// Stable integer identifier for a term.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TermId(pub i32);

impl fmt::Display for TermId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A legal term with revisioned contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub name: String,
    pub title: Translation,
    /// Monotonically increasing; bumped whenever the text changes in a
    /// way that requires re-acceptance.
    pub current_revision: i32,
    /// Ordered revision texts, index = revision number.
    #[serde(default)]
    pub contents: Vec<String>,
}

/// Per-(user, term) acceptance status.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AcceptanceStatus {
    Ok,
    No,
    Pending,
}

impl AcceptanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Self::Ok),
            "no" => Some(Self::No),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// A recorded acceptance decision against a specific revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermAcceptance {
    pub term: TermId,
    pub revision: i32,
    pub status: AcceptanceStatus,
}

impl TermAcceptance {
    /// The status that counts for closure purposes. A record against an
    /// outdated revision is `Pending` regardless of what was recorded.
    pub fn effective(&self, current_revision: i32) -> AcceptanceStatus {
        if self.revision < current_revision {
            AcceptanceStatus::Pending
        } else {
            self.status
        }
    }
}

/// The static catalog of terms. Administrator-curated; injected at
/// construction rather than read from ambient state.
#[derive(Debug, Clone, Default)]
pub struct TermCatalog {
    terms: Vec<Term>,
    index: HashMap<TermId, usize>,
}

impl TermCatalog {
    pub fn new(terms: Vec<Term>) -> Self {
        let index = terms
            .iter()
            .enumerate()
            .map(|(ix, t)| (t.id, ix))
            .collect();
        Self { terms, index }
    }

    pub fn get(&self, id: TermId) -> Result<&Term, PolicyError> {
        self.index
            .get(&id)
            .map(|&ix| &self.terms[ix])
            .ok_or_else(|| PolicyError::NotFound(format!("term {id}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Term> {
        self.terms.iter()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Resolve the effective statuses of every term for one user, given
    /// that user's recorded acceptances. Unrecorded terms are `Pending`.
    pub fn effective_statuses(
        &self,
        recorded: &[TermAcceptance],
    ) -> HashMap<TermId, AcceptanceStatus> {
        let mut out: HashMap<TermId, AcceptanceStatus> = self
            .terms
            .iter()
            .map(|t| (t.id, AcceptanceStatus::Pending))
            .collect();
        for acc in recorded {
            if let Ok(term) = self.get(acc.term) {
                out.insert(acc.term, acc.effective(term.current_revision));
            }
        }
        out
    }
}
