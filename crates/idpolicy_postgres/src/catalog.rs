//! Loads the administrator-curated node graph and term catalog from
//! Postgres into the in-memory structures the engine runs on.
//!
//! Tables:
//!   nodes               - identity, description, notification messages
//!   node_implies        - forward implication edges
//!   node_prerequisites  - conjunctive implied_by lists
//!   node_conflicts      - symmetric conflict pairs
//!   node_required_terms / node_required_fields / node_required_email
//!   terms, term_revisions
//!
//! Graph edits are administrative and rare; callers reload after an edit
//! and rebuild the service, which also invalidates every closure result.

use std::collections::HashMap;

use anyhow::anyhow;
use sqlx::PgPool;

use idpolicy_core::ports::Result;
use idpolicy_core::{
    FieldRef, Node, NodeGraph, NodeId, PolicyError, Term, TermCatalog, TermId, Translation,
};

use crate::retry::{with_retry, RetryPolicy};

fn translation(value: serde_json::Value) -> Result<Translation> {
    serde_json::from_value(value).map_err(|e| PolicyError::Internal(anyhow!(e)))
}

fn opt_translation(value: Option<serde_json::Value>) -> Result<Option<Translation>> {
    value.map(translation).transpose()
}

fn field_ref(table: &str, column: String) -> Result<FieldRef> {
    match table {
        "users" => Ok(FieldRef::Users(column)),
        "classes" => Ok(FieldRef::Classes(column)),
        "users_classes" => Ok(FieldRef::UsersClasses(column)),
        other => Err(PolicyError::Internal(anyhow!(
            "unknown field table {other:?} in node_required_fields"
        ))),
    }
}

pub struct PgCatalogStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_policy(pool, RetryPolicy::default())
    }

    pub fn with_policy(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    /// Load and validate the whole node graph. Fails with
    /// `StructuralGraph` on error-severity violations, exactly as
    /// [`NodeGraph::load`] does.
    pub async fn load_graph(&self) -> Result<NodeGraph> {
        let base = with_retry(self.retry, || async {
            sqlx::query_as::<_, (
                i32,
                String,
                serde_json::Value,
                Option<serde_json::Value>,
                Option<serde_json::Value>,
                Option<serde_json::Value>,
                Option<serde_json::Value>,
            )>(
                r#"
                SELECT node_id, name, description,
                       on_granted, on_revoked, valid_added, valid_removed
                FROM nodes
                ORDER BY node_id
                "#,
            )
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        let mut nodes = Vec::with_capacity(base.len());
        let mut ix: HashMap<NodeId, usize> = HashMap::with_capacity(base.len());
        for (id, name, description, granted, revoked, added, removed) in base {
            let mut node = Node::new(NodeId(id), name, translation(description)?);
            node.on_granted = opt_translation(granted)?;
            node.on_revoked = opt_translation(revoked)?;
            node.valid_added = opt_translation(added)?;
            node.valid_removed = opt_translation(removed)?;
            ix.insert(node.id, nodes.len());
            nodes.push(node);
        }

        // Edge and requirement tables. Unknown edge targets flow through
        // to NodeGraph::load, which reports them as structural violations;
        // an unknown source row means a broken foreign key and errors here.
        let implies = with_retry(self.retry, || async {
            sqlx::query_as::<_, (i32, i32)>(
                "SELECT from_node, to_node FROM node_implies ORDER BY from_node, to_node",
            )
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        for (from, to) in implies {
            match ix.get(&NodeId(from)) {
                Some(&i) => nodes[i].implies.push(NodeId(to)),
                None => {
                    return Err(PolicyError::Internal(anyhow!(
                        "node_implies references unknown node {from}"
                    )))
                }
            }
        }

        let prerequisites = with_retry(self.retry, || async {
            sqlx::query_as::<_, (i32, i32)>(
                r#"
                SELECT node_id, prerequisite_id
                FROM node_prerequisites
                ORDER BY node_id, prerequisite_id
                "#,
            )
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        for (id, prereq) in prerequisites {
            match ix.get(&NodeId(id)) {
                Some(&i) => nodes[i].implied_by.push(NodeId(prereq)),
                None => {
                    return Err(PolicyError::Internal(anyhow!(
                        "node_prerequisites references unknown node {id}"
                    )))
                }
            }
        }

        let conflicts = with_retry(self.retry, || async {
            sqlx::query_as::<_, (i32, i32)>(
                "SELECT node_id, conflicts_with FROM node_conflicts ORDER BY node_id",
            )
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        for (id, other) in conflicts {
            match ix.get(&NodeId(id)) {
                Some(&i) => nodes[i].conflicts_with.push(NodeId(other)),
                None => {
                    return Err(PolicyError::Internal(anyhow!(
                        "node_conflicts references unknown node {id}"
                    )))
                }
            }
        }

        let required_terms = with_retry(self.retry, || async {
            sqlx::query_as::<_, (i32, i32)>(
                "SELECT node_id, term_id FROM node_required_terms ORDER BY node_id, term_id",
            )
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        for (id, term) in required_terms {
            if let Some(&i) = ix.get(&NodeId(id)) {
                nodes[i].required_terms.push(TermId(term));
            }
        }

        let required_fields = with_retry(self.retry, || async {
            sqlx::query_as::<_, (i32, String, String)>(
                r#"
                SELECT node_id, field_table, field_column
                FROM node_required_fields
                ORDER BY node_id, field_table, field_column
                "#,
            )
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        for (id, table, column) in required_fields {
            if let Some(&i) = ix.get(&NodeId(id)) {
                nodes[i].required_fields.push(field_ref(&table, column)?);
            }
        }

        let required_email = with_retry(self.retry, || async {
            sqlx::query_as::<_, (i32, String)>(
                "SELECT node_id, domain FROM node_required_email ORDER BY node_id, domain",
            )
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        for (id, domain) in required_email {
            if let Some(&i) = ix.get(&NodeId(id)) {
                nodes[i].required_verified_email.push(domain);
            }
        }

        NodeGraph::load(nodes)
    }

    /// Load the term catalog with revision texts in revision order.
    pub async fn load_terms(&self) -> Result<TermCatalog> {
        let base = with_retry(self.retry, || async {
            sqlx::query_as::<_, (i32, String, serde_json::Value, i32)>(
                r#"
                SELECT term_id, name, title, current_revision
                FROM terms
                ORDER BY term_id
                "#,
            )
            .fetch_all(&self.pool)
            .await
        })
        .await?;

        let mut terms = Vec::with_capacity(base.len());
        let mut ix: HashMap<TermId, usize> = HashMap::with_capacity(base.len());
        for (id, name, title, current_revision) in base {
            ix.insert(TermId(id), terms.len());
            terms.push(Term {
                id: TermId(id),
                name,
                title: translation(title)?,
                current_revision,
                contents: Vec::new(),
            });
        }

        let revisions = with_retry(self.retry, || async {
            sqlx::query_as::<_, (i32, String)>(
                "SELECT term_id, content FROM term_revisions ORDER BY term_id, revision",
            )
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        for (id, content) in revisions {
            if let Some(&i) = ix.get(&TermId(id)) {
                terms[i].contents.push(content);
            }
        }

        Ok(TermCatalog::new(terms))
    }
}
