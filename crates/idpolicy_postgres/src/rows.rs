//! Row types bridging Postgres columns and core domain types.
//!
//! Kept separate from the adapters so conversion failures (bad enum text,
//! unexpected NULLs) have one home and one error shape.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use idpolicy_core::{
    AcceptanceStatus, GrantRecord, NodeId, TermAcceptance, TermId, UserId, ValidEntry,
};

#[derive(Debug, FromRow)]
pub(crate) struct PgGrantRow {
    pub user_id: i32,
    pub node_id: i32,
    pub accepted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_at: DateTime<Utc>,
}

impl From<PgGrantRow> for GrantRecord {
    fn from(r: PgGrantRow) -> Self {
        GrantRecord {
            user: UserId(r.user_id),
            node: NodeId(r.node_id),
            accepted: r.accepted,
            expires_at: r.expires_at,
            granted_at: r.granted_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PgTermStatusRow {
    pub term_id: i32,
    pub revision: i32,
    pub status: String,
}

impl TryFrom<PgTermStatusRow> for TermAcceptance {
    type Error = String;

    fn try_from(r: PgTermStatusRow) -> Result<Self, Self::Error> {
        let status = AcceptanceStatus::parse(&r.status)
            .ok_or_else(|| format!("unknown acceptance status {:?}", r.status))?;
        Ok(TermAcceptance {
            term: TermId(r.term_id),
            revision: r.revision,
            status,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PgValidRow {
    pub node_id: i32,
    pub term_ok: bool,
    pub term_semi: bool,
}

impl From<PgValidRow> for ValidEntry {
    fn from(r: PgValidRow) -> Self {
        ValidEntry {
            node: NodeId(r.node_id),
            term_ok: r.term_ok,
            term_semi: r.term_semi,
        }
    }
}
