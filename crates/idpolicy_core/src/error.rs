use thiserror::Error;

use crate::graph::GraphViolation;
use crate::node::FieldRef;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("missing required fields: {}", format_fields(.0))]
    MissingRequiredFields(Vec<FieldRef>),

    #[error("verified email required for domain(s): {}", .0.join(", "))]
    MissingVerifiedEmail(Vec<String>),

    #[error("stale term revision: submitted {submitted}, current {current}")]
    StaleRevision { submitted: i32, current: i32 },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("structural graph error: {} violation(s)", .0.len())]
    StructuralGraph(Vec<GraphViolation>),

    #[error("storage unavailable after {attempts} attempt(s): {source}")]
    StorageUnavailable {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PolicyError {
    /// Whether the caller may retry the operation unchanged.
    /// Only transient storage failures qualify - policy rejections never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

fn format_fields(fields: &[FieldRef]) -> String {
    fields
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphViolation, ViolationKind, ViolationSeverity};
    use crate::node::{FieldRef, NodeId};

    #[test]
    fn display_not_found() {
        let e = PolicyError::NotFound("node 7".into());
        assert_eq!(e.to_string(), "not found: node 7");
    }

    #[test]
    fn display_missing_required_fields() {
        let e = PolicyError::MissingRequiredFields(vec![
            FieldRef::Users("bs_number".into()),
            FieldRef::UsersClasses("seat".into()),
        ]);
        assert_eq!(
            e.to_string(),
            "missing required fields: users.bs_number, users_classes.seat"
        );
    }

    #[test]
    fn display_missing_verified_email() {
        let e = PolicyError::MissingVerifiedEmail(vec!["cs.example.edu".into()]);
        assert_eq!(
            e.to_string(),
            "verified email required for domain(s): cs.example.edu"
        );
    }

    #[test]
    fn display_stale_revision() {
        let e = PolicyError::StaleRevision {
            submitted: 1,
            current: 3,
        };
        assert_eq!(e.to_string(), "stale term revision: submitted 1, current 3");
    }

    #[test]
    fn display_structural_counts_violations() {
        let v = GraphViolation {
            node: NodeId(1),
            kind: ViolationKind::UnknownReference,
            severity: ViolationSeverity::Error,
            message: "implies unknown node 99".into(),
        };
        let e = PolicyError::StructuralGraph(vec![v.clone(), v]);
        assert_eq!(e.to_string(), "structural graph error: 2 violation(s)");
    }

    #[test]
    fn only_storage_unavailable_is_retryable() {
        let retryable = PolicyError::StorageUnavailable {
            attempts: 3,
            source: anyhow::anyhow!("pool timed out"),
        };
        assert!(retryable.is_retryable());
        assert!(!PolicyError::Conflict("x".into()).is_retryable());
        assert!(!PolicyError::NotFound("x".into()).is_retryable());
        assert!(!PolicyError::InvalidInput("x".into()).is_retryable());
    }
}
