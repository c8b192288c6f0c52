//! idpolicy_core - privilege node policy engine for an identity service.
//!
//! Privileges ("nodes") form an implication graph and are conditioned on
//! acceptance of legal terms. From a small set of directly granted facts
//! the closure engine derives, per user, the associated / acknowledged /
//! semi-acknowledged / valid sets as a deterministic monotone fixed point.
//!
//! This crate is pure domain: types, the graph arena, the closure engine,
//! the grant/revoke workflow, and the port traits storage adapters
//! implement. No sqlx here - see `idpolicy_postgres`.

pub mod closure;
pub mod error;
pub mod grant;
pub mod graph;
pub mod memory;
pub mod node;
pub mod ports;
pub mod service;
pub mod term;

pub use closure::{ClosureEngine, ClosureInput, ClosureResult, ValidEntry};
pub use error::PolicyError;
pub use grant::{GrantRecord, GrantState, UserId};
pub use graph::{GraphViolation, NodeGraph, NodeGraphBuilder, ViolationKind, ViolationSeverity};
pub use node::{FieldRef, Node, NodeId, Translation};
pub use service::{PolicyPorts, PolicyService};
pub use term::{AcceptanceStatus, Term, TermAcceptance, TermCatalog, TermId};
