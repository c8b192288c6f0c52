//! The closure engine - derives the associated, acknowledged,
//! semi-acknowledged, and valid sets from a user's approved nodes.
//!
//! Each set is the least fixed point of the same two closure rules,
//! differing only in the term-gate applied at every inclusion step:
//!
//! - associated: no gate
//! - acknowledged: every required term accepted (`ok`) at current revision
//! - semi-acknowledged: no required term explicitly rejected (`no`)
//!
//! Computed by iterative relaxation over the arena until a full pass adds
//! nothing. Additions are monotone and the node set finite, so termination
//! holds on any graph, cycles included. The result is the unique least
//! fixed point whatever the scan order; `compute_with_scan_order` exists so
//! tests can assert exactly that.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::graph::NodeGraph;
use crate::node::{Node, NodeId};
use crate::term::{AcceptanceStatus, TermId};

/// One row of the valid-set snapshot: the node is valid, with flags for
/// acknowledged (`term_ok`) and semi-acknowledged (`term_semi`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValidEntry {
    pub node: NodeId,
    pub term_ok: bool,
    pub term_semi: bool,
}

/// The four derived sets for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosureResult {
    pub associated: BTreeSet<NodeId>,
    pub acknowledged: BTreeSet<NodeId>,
    pub semi_acknowledged: BTreeSet<NodeId>,
    /// associated − masked, ordered by node id, with per-node term flags.
    pub valid: Vec<ValidEntry>,
}

/// Inputs to one closure run. All references - the engine owns nothing
/// and performs no I/O.
#[derive(Debug, Clone, Copy)]
pub struct ClosureInput<'a> {
    pub approved: &'a HashSet<NodeId>,
    pub term_status: &'a HashMap<TermId, AcceptanceStatus>,
    pub masked: &'a HashSet<NodeId>,
}

pub struct ClosureEngine<'a> {
    graph: &'a NodeGraph,
}

impl<'a> ClosureEngine<'a> {
    pub fn new(graph: &'a NodeGraph) -> Self {
        Self { graph }
    }

    pub fn compute(&self, input: ClosureInput<'_>) -> ClosureResult {
        let order: Vec<usize> = (0..self.graph.len()).collect();
        self.compute_with_scan_order(input, &order)
    }

    /// Same computation with an explicit scan order. `order` must be a
    /// permutation of node indices. The output never depends on it - that
    /// property is load-bearing and covered by tests.
    pub fn compute_with_scan_order(
        &self,
        input: ClosureInput<'_>,
        order: &[usize],
    ) -> ClosureResult {
        debug_assert_eq!(order.len(), self.graph.len());

        let associated = self.close(input.approved, order, |_| true);
        let acknowledged = self.close(input.approved, order, |node| {
            self.gate(node, input.term_status, |s| s == AcceptanceStatus::Ok)
        });
        let semi_acknowledged = self.close(input.approved, order, |node| {
            self.gate(node, input.term_status, |s| s != AcceptanceStatus::No)
        });

        let valid = associated
            .iter()
            .filter(|id| !input.masked.contains(id))
            .map(|&node| ValidEntry {
                node,
                term_ok: acknowledged.contains(&node),
                term_semi: semi_acknowledged.contains(&node),
            })
            .collect();

        ClosureResult {
            associated,
            acknowledged,
            semi_acknowledged,
            valid,
        }
    }

    /// Term-gate: every required term of `node` satisfies `pass`.
    /// Unrecorded terms count as `Pending`.
    fn gate(
        &self,
        node: &Node,
        statuses: &HashMap<TermId, AcceptanceStatus>,
        pass: impl Fn(AcceptanceStatus) -> bool,
    ) -> bool {
        node.required_terms.iter().all(|term| {
            let status = statuses
                .get(term)
                .copied()
                .unwrap_or(AcceptanceStatus::Pending);
            pass(status)
        })
    }

    /// Least fixed point of the closure rules under `gate`:
    /// - an approved node enters if its gate passes;
    /// - a node enters if any node already in the set implies it and its
    ///   own gate passes;
    /// - a node with a non-empty prerequisite list enters once every
    ///   prerequisite is in the set and its own gate passes.
    fn close(
        &self,
        approved: &HashSet<NodeId>,
        order: &[usize],
        gate: impl Fn(&Node) -> bool,
    ) -> BTreeSet<NodeId> {
        let nodes = self.graph.nodes();
        let mut member = vec![false; nodes.len()];

        let mut changed = true;
        while changed {
            changed = false;
            for &ix in order {
                if member[ix] {
                    continue;
                }
                let node = &nodes[ix];
                if !gate(node) {
                    continue;
                }

                let seeded = approved.contains(&node.id);
                let implied = self
                    .graph
                    .implied_from(ix)
                    .iter()
                    .any(|&source| member[source]);
                let prerequisites = self.graph.prerequisites(ix);
                let conjoined = !prerequisites.is_empty()
                    && prerequisites.iter().all(|&p| member[p]);

                if seeded || implied || conjoined {
                    member[ix] = true;
                    changed = true;
                }
            }
        }

        member
            .iter()
            .enumerate()
            .filter(|(_, &m)| m)
            .map(|(ix, _)| nodes[ix].id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeGraph;
    use crate::node::{Node, Translation};

    fn node(id: i32, name: &str) -> Node {
        Node::new(NodeId(id), name, Translation::new(name, name))
    }

    fn node_with_term(id: i32, name: &str, term: i32) -> Node {
        let mut n = node(id, name);
        n.required_terms.push(TermId(term));
        n
    }

    fn ids(set: &BTreeSet<NodeId>) -> Vec<i32> {
        set.iter().map(|id| id.0).collect()
    }

    fn input<'a>(
        approved: &'a HashSet<NodeId>,
        term_status: &'a HashMap<TermId, AcceptanceStatus>,
        masked: &'a HashSet<NodeId>,
    ) -> ClosureInput<'a> {
        ClosureInput {
            approved,
            term_status,
            masked,
        }
    }

    #[test]
    fn approved_nodes_seed_association() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node(2, "b"))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let statuses = HashMap::new();
        let masked = HashSet::new();
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert_eq!(ids(&result.associated), vec![1]);
    }

    #[test]
    fn implies_propagates_transitively() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node(2, "b"))
            .node(node(3, "c"))
            .implies(NodeId(1), NodeId(2))
            .implies(NodeId(2), NodeId(3))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let statuses = HashMap::new();
        let masked = HashSet::new();
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert_eq!(ids(&result.associated), vec![1, 2, 3]);
    }

    #[test]
    fn prerequisites_are_conjunctive() {
        // y requires both x1 and x2; one alone is not enough.
        let graph = NodeGraph::builder()
            .node(node(1, "x1"))
            .node(node(2, "x2"))
            .node(node(3, "y"))
            .requires_all(NodeId(3), &[NodeId(1), NodeId(2)])
            .build()
            .unwrap();
        let statuses = HashMap::new();
        let masked = HashSet::new();
        let engine = ClosureEngine::new(&graph);

        let one = HashSet::from([NodeId(1)]);
        let result = engine.compute(input(&one, &statuses, &masked));
        assert_eq!(ids(&result.associated), vec![1]);

        let both = HashSet::from([NodeId(1), NodeId(2)]);
        let result = engine.compute(input(&both, &statuses, &masked));
        assert_eq!(ids(&result.associated), vec![1, 2, 3]);
    }

    #[test]
    fn empty_prerequisite_list_never_fires() {
        // Rule (b) applies only to nodes that actually curate a
        // prerequisite list; an isolated node must not self-associate.
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node(2, "isolated"))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let statuses = HashMap::new();
        let masked = HashSet::new();
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert_eq!(ids(&result.associated), vec![1]);
    }

    #[test]
    fn cycle_terminates_and_co_derives() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node(2, "b"))
            .node(node(3, "c"))
            .implies(NodeId(1), NodeId(2))
            .implies(NodeId(2), NodeId(3))
            .implies(NodeId(3), NodeId(1))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let statuses = HashMap::new();
        let masked = HashSet::new();
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert_eq!(ids(&result.associated), vec![1, 2, 3]);
        assert_eq!(ids(&result.acknowledged), vec![1, 2, 3]);
    }

    #[test]
    fn unapproved_cycle_stays_empty() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node(2, "b"))
            .implies(NodeId(1), NodeId(2))
            .implies(NodeId(2), NodeId(1))
            .build()
            .unwrap();
        let approved = HashSet::new();
        let statuses = HashMap::new();
        let masked = HashSet::new();
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert!(result.associated.is_empty());
    }

    #[test]
    fn term_gate_matrix() {
        // Node 1 requires term 0. pending → semi only; no → neither;
        // ok → both.
        let graph = NodeGraph::builder()
            .node(node_with_term(1, "classroom", 0))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let masked = HashSet::new();
        let engine = ClosureEngine::new(&graph);

        let pending = HashMap::from([(TermId(0), AcceptanceStatus::Pending)]);
        let result = engine.compute(input(&approved, &pending, &masked));
        assert!(result.acknowledged.is_empty());
        assert_eq!(ids(&result.semi_acknowledged), vec![1]);
        assert_eq!(ids(&result.associated), vec![1]);

        let no = HashMap::from([(TermId(0), AcceptanceStatus::No)]);
        let result = engine.compute(input(&approved, &no, &masked));
        assert!(result.acknowledged.is_empty());
        assert!(result.semi_acknowledged.is_empty());
        assert_eq!(ids(&result.associated), vec![1]);

        let ok = HashMap::from([(TermId(0), AcceptanceStatus::Ok)]);
        let result = engine.compute(input(&approved, &ok, &masked));
        assert_eq!(ids(&result.acknowledged), vec![1]);
        assert_eq!(ids(&result.semi_acknowledged), vec![1]);
    }

    #[test]
    fn unrecorded_term_counts_as_pending() {
        let graph = NodeGraph::builder()
            .node(node_with_term(1, "classroom", 0))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let statuses = HashMap::new();
        let masked = HashSet::new();
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert!(result.acknowledged.is_empty());
        assert_eq!(ids(&result.semi_acknowledged), vec![1]);
    }

    #[test]
    fn gate_applies_at_every_inclusion_step() {
        // 1 implies 2; 2 requires a rejected term. 2 stays out of the
        // gated sets but remains associated.
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node_with_term(2, "b", 0))
            .implies(NodeId(1), NodeId(2))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let statuses = HashMap::from([(TermId(0), AcceptanceStatus::No)]);
        let masked = HashSet::new();
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert_eq!(ids(&result.associated), vec![1, 2]);
        assert_eq!(ids(&result.acknowledged), vec![1]);
        assert_eq!(ids(&result.semi_acknowledged), vec![1]);
    }

    #[test]
    fn gated_node_blocks_downstream_acknowledgement() {
        // 1 implies 2 implies 3. 2's term is pending, 3 is term-free.
        // 3 still reaches the semi set through 2, but cannot be
        // acknowledged because nothing acknowledged implies it.
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node_with_term(2, "b", 0))
            .node(node(3, "c"))
            .implies(NodeId(1), NodeId(2))
            .implies(NodeId(2), NodeId(3))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let statuses = HashMap::from([(TermId(0), AcceptanceStatus::Pending)]);
        let masked = HashSet::new();
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert_eq!(ids(&result.associated), vec![1, 2, 3]);
        assert_eq!(ids(&result.acknowledged), vec![1]);
        assert_eq!(ids(&result.semi_acknowledged), vec![1, 2, 3]);
    }

    #[test]
    fn masked_nodes_drop_from_valid_only() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node(2, "b"))
            .implies(NodeId(1), NodeId(2))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let statuses = HashMap::new();
        let masked = HashSet::from([NodeId(2)]);
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert_eq!(ids(&result.associated), vec![1, 2]);
        let valid_nodes: Vec<i32> = result.valid.iter().map(|v| v.node.0).collect();
        assert_eq!(valid_nodes, vec![1]);
    }

    #[test]
    fn valid_entries_carry_term_flags() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node_with_term(2, "b", 0))
            .implies(NodeId(1), NodeId(2))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let statuses = HashMap::from([(TermId(0), AcceptanceStatus::Pending)]);
        let masked = HashSet::new();
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert_eq!(
            result.valid,
            vec![
                ValidEntry {
                    node: NodeId(1),
                    term_ok: true,
                    term_semi: true
                },
                ValidEntry {
                    node: NodeId(2),
                    term_ok: false,
                    term_semi: true
                },
            ]
        );
    }

    #[test]
    fn subset_invariants_hold() {
        let graph = NodeGraph::builder()
            .node(node_with_term(1, "a", 0))
            .node(node_with_term(2, "b", 1))
            .node(node(3, "c"))
            .node(node(4, "d"))
            .implies(NodeId(1), NodeId(3))
            .implies(NodeId(2), NodeId(3))
            .requires_all(NodeId(4), &[NodeId(1), NodeId(2)])
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1), NodeId(2)]);
        let statuses = HashMap::from([
            (TermId(0), AcceptanceStatus::Ok),
            (TermId(1), AcceptanceStatus::Pending),
        ]);
        let masked = HashSet::from([NodeId(3)]);
        let result =
            ClosureEngine::new(&graph).compute(input(&approved, &statuses, &masked));
        assert!(result.acknowledged.is_subset(&result.semi_acknowledged));
        assert!(result
            .semi_acknowledged
            .is_subset(&result.associated));
        let valid: BTreeSet<NodeId> = result.valid.iter().map(|v| v.node).collect();
        let masked_set: BTreeSet<NodeId> = masked.iter().copied().collect();
        let expected: BTreeSet<NodeId> = result
            .associated
            .difference(&masked_set)
            .copied()
            .collect();
        assert_eq!(valid, expected);
    }

    #[test]
    fn scan_order_does_not_change_result() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node(2, "b"))
            .node(node(3, "c"))
            .node(node(4, "d"))
            .node(node(5, "e"))
            .implies(NodeId(1), NodeId(2))
            .implies(NodeId(3), NodeId(1))
            .implies(NodeId(2), NodeId(3))
            .requires_all(NodeId(4), &[NodeId(2), NodeId(3)])
            .implies(NodeId(4), NodeId(5))
            .build()
            .unwrap();
        let approved = HashSet::from([NodeId(1)]);
        let statuses = HashMap::new();
        let masked = HashSet::new();
        let engine = ClosureEngine::new(&graph);

        let forward: Vec<usize> = (0..5).collect();
        let reverse: Vec<usize> = (0..5).rev().collect();
        let rotated: Vec<usize> = vec![2, 4, 0, 3, 1];

        let a = engine.compute_with_scan_order(input(&approved, &statuses, &masked), &forward);
        let b = engine.compute_with_scan_order(input(&approved, &statuses, &masked), &reverse);
        let c = engine.compute_with_scan_order(input(&approved, &statuses, &masked), &rotated);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(ids(&a.associated), vec![1, 2, 3, 4, 5]);
    }
}
