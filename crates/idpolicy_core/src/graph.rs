//! Node graph arena - flat table indexed by stable id, edges resolved to
//! indices at load time. No live object references, so cycles cost nothing.
//!
//! Validation distinguishes fatal structural defects (unknown references,
//! duplicate ids, asymmetric conflict pairs) from advisory findings
//! (implies/implied_by mirror drift, cycles). Cycles are semantically
//! meaningful to the closure engine and must never be rejected.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PolicyError;
use crate::node::{Node, NodeId};

/// Severity of a structural finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DuplicateNodeId,
    UnknownReference,
    AsymmetricConflict,
    /// An `implies` edge with no mirrored `implied_by` entry or vice
    /// versa. Advisory only: the relations are curated independently
    /// (disjunctive vs conjunctive), so drift is legal but worth a look.
    MirrorDrift,
    Cycle,
}

/// One structural finding from graph validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphViolation {
    pub node: NodeId,
    pub kind: ViolationKind,
    pub severity: ViolationSeverity,
    pub message: String,
}

impl fmt::Display for GraphViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[node {}] {}: {}", self.node, self.severity, self.message)
    }
}

impl GraphViolation {
    fn error(node: NodeId, kind: ViolationKind, message: String) -> Self {
        Self {
            node,
            kind,
            severity: ViolationSeverity::Error,
            message,
        }
    }

    fn warning(node: NodeId, kind: ViolationKind, message: String) -> Self {
        Self {
            node,
            kind,
            severity: ViolationSeverity::Warning,
            message,
        }
    }
}

/// The administrator-curated node graph, read-mostly.
#[derive(Debug, Clone)]
pub struct NodeGraph {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    /// Resolved `implies` targets per node index.
    fwd: Vec<Vec<usize>>,
    /// Inverse of `fwd`: which nodes imply this one.
    rev: Vec<Vec<usize>>,
    /// Resolved `implied_by` prerequisites per node index.
    conj: Vec<Vec<usize>>,
}

impl NodeGraph {
    /// Build and validate the arena. Fails with `StructuralGraph` if any
    /// error-severity violation is present; warnings are logged and kept
    /// available through [`NodeGraph::validate`].
    pub fn load(nodes: Vec<Node>) -> Result<Self, PolicyError> {
        let mut violations = Vec::new();

        let mut index: HashMap<NodeId, usize> = HashMap::with_capacity(nodes.len());
        for (ix, node) in nodes.iter().enumerate() {
            if index.insert(node.id, ix).is_some() {
                violations.push(GraphViolation::error(
                    node.id,
                    ViolationKind::DuplicateNodeId,
                    format!("node id {} defined more than once", node.id),
                ));
            }
        }

        check_references(&nodes, &index, &mut violations);

        if violations
            .iter()
            .any(|v| v.severity == ViolationSeverity::Error)
        {
            return Err(PolicyError::StructuralGraph(violations));
        }

        let n = nodes.len();
        let mut fwd = vec![Vec::new(); n];
        let mut rev = vec![Vec::new(); n];
        let mut conj = vec![Vec::new(); n];
        for (ix, node) in nodes.iter().enumerate() {
            for target in &node.implies {
                let tix = index[target];
                fwd[ix].push(tix);
                rev[tix].push(ix);
            }
            for prereq in &node.implied_by {
                conj[ix].push(index[prereq]);
            }
        }

        let graph = Self {
            nodes,
            index,
            fwd,
            rev,
            conj,
        };

        for violation in graph.validate() {
            tracing::warn!(%violation, "node graph finding");
        }

        Ok(graph)
    }

    pub fn builder() -> NodeGraphBuilder {
        NodeGraphBuilder::default()
    }

    pub fn get(&self, id: NodeId) -> Result<&Node, PolicyError> {
        self.index
            .get(&id)
            .map(|&ix| &self.nodes[ix])
            .ok_or_else(|| PolicyError::NotFound(format!("node {id}")))
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Ordered by load order (administrators control the sequence).
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn implied_from(&self, ix: usize) -> &[usize] {
        &self.rev[ix]
    }

    pub(crate) fn prerequisites(&self, ix: usize) -> &[usize] {
        &self.conj[ix]
    }

    /// Run every structural check. Empty result means a clean graph.
    pub fn validate(&self) -> Vec<GraphViolation> {
        let mut violations = Vec::new();

        check_references(&self.nodes, &self.index, &mut violations);

        // Conflict pairs must be symmetric: the workflow resolves them
        // from either side.
        for node in &self.nodes {
            for other_id in &node.conflicts_with {
                let other = &self.nodes[self.index[other_id]];
                if !other.conflicts_with.contains(&node.id) {
                    violations.push(GraphViolation::error(
                        node.id,
                        ViolationKind::AsymmetricConflict,
                        format!(
                            "conflicts with node {} but the reverse pair is missing",
                            other_id
                        ),
                    ));
                }
            }
        }

        // Mirror drift between implies/implied_by. Advisory - a conjunction
        // node legitimately lists prerequisites that do not imply it back.
        for (ix, node) in self.nodes.iter().enumerate() {
            for &tix in &self.fwd[ix] {
                let target = &self.nodes[tix];
                if !target.implied_by.contains(&node.id) && !target.implied_by.is_empty() {
                    violations.push(GraphViolation::warning(
                        node.id,
                        ViolationKind::MirrorDrift,
                        format!(
                            "implies node {} which lists other implied_by entries but not this one",
                            target.id
                        ),
                    ));
                }
            }
        }

        for cycle in self.cycles() {
            let members = cycle
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            violations.push(GraphViolation::warning(
                cycle[0],
                ViolationKind::Cycle,
                format!("implication cycle: [{members}]"),
            ));
        }

        violations
    }

    /// Strongly connected components of the `implies` relation with more
    /// than one member (or a self-loop). Iterative Tarjan - no recursion,
    /// so arbitrarily deep graphs are fine.
    pub fn cycles(&self) -> Vec<Vec<NodeId>> {
        const UNVISITED: usize = usize::MAX;
        let n = self.nodes.len();
        let mut order = vec![UNVISITED; n];
        let mut low = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut next = 0usize;
        let mut components = Vec::new();

        for root in 0..n {
            if order[root] != UNVISITED {
                continue;
            }
            order[root] = next;
            low[root] = next;
            next += 1;
            stack.push(root);
            on_stack[root] = true;
            let mut frames: Vec<(usize, usize)> = vec![(root, 0)];

            while let Some(frame) = frames.last_mut() {
                let v = frame.0;
                if frame.1 < self.fwd[v].len() {
                    let w = self.fwd[v][frame.1];
                    frame.1 += 1;
                    if order[w] == UNVISITED {
                        order[w] = next;
                        low[w] = next;
                        next += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        frames.push((w, 0));
                    } else if on_stack[w] {
                        low[v] = low[v].min(order[w]);
                    }
                } else {
                    frames.pop();
                    if let Some(parent) = frames.last() {
                        let p = parent.0;
                        low[p] = low[p].min(low[v]);
                    }
                    if low[v] == order[v] {
                        let mut component = Vec::new();
                        loop {
                            let w = stack.pop().expect("tarjan stack underflow");
                            on_stack[w] = false;
                            component.push(w);
                            if w == v {
                                break;
                            }
                        }
                        let self_loop =
                            component.len() == 1 && self.fwd[v].contains(&v);
                        if component.len() > 1 || self_loop {
                            component.sort_unstable();
                            components.push(
                                component.iter().map(|&ix| self.nodes[ix].id).collect(),
                            );
                        }
                    }
                }
            }
        }

        components
    }
}

fn check_references(
    nodes: &[Node],
    index: &HashMap<NodeId, usize>,
    violations: &mut Vec<GraphViolation>,
) {
    for node in nodes {
        let refs = node
            .implies
            .iter()
            .chain(&node.implied_by)
            .chain(&node.conflicts_with);
        for target in refs {
            if !index.contains_key(target) {
                violations.push(GraphViolation::error(
                    node.id,
                    ViolationKind::UnknownReference,
                    format!("references unknown node {target}"),
                ));
            }
        }
    }
}

/// Fixture-friendly builder. Edges are applied at `build()`, so unknown
/// references surface as validation errors instead of panics.
#[derive(Debug, Default)]
pub struct NodeGraphBuilder {
    nodes: Vec<Node>,
    implies_edges: Vec<(NodeId, NodeId)>,
    prerequisite_sets: Vec<(NodeId, Vec<NodeId>)>,
    conflict_pairs: Vec<(NodeId, NodeId)>,
}

impl NodeGraphBuilder {
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Association with `from` implies association with `to`.
    pub fn implies(mut self, from: NodeId, to: NodeId) -> Self {
        self.implies_edges.push((from, to));
        self
    }

    /// `node` becomes associated once all `prerequisites` are.
    pub fn requires_all(mut self, node: NodeId, prerequisites: &[NodeId]) -> Self {
        self.prerequisite_sets
            .push((node, prerequisites.to_vec()));
        self
    }

    /// Symmetric conflict pair.
    pub fn conflict(mut self, a: NodeId, b: NodeId) -> Self {
        self.conflict_pairs.push((a, b));
        self
    }

    pub fn build(mut self) -> Result<NodeGraph, PolicyError> {
        let mut dangling = Vec::new();
        for (from, to) in std::mem::take(&mut self.implies_edges) {
            match self.nodes.iter_mut().find(|n| n.id == from) {
                Some(node) => node.implies.push(to),
                None => dangling.push(GraphViolation::error(
                    from,
                    ViolationKind::UnknownReference,
                    format!("implies edge from unknown node {from}"),
                )),
            }
        }
        for (id, prerequisites) in std::mem::take(&mut self.prerequisite_sets) {
            match self.nodes.iter_mut().find(|n| n.id == id) {
                Some(node) => node.implied_by.extend(prerequisites),
                None => dangling.push(GraphViolation::error(
                    id,
                    ViolationKind::UnknownReference,
                    format!("prerequisite set on unknown node {id}"),
                )),
            }
        }
        for (a, b) in std::mem::take(&mut self.conflict_pairs) {
            for (from, to) in [(a, b), (b, a)] {
                match self.nodes.iter_mut().find(|n| n.id == from) {
                    Some(node) => node.conflicts_with.push(to),
                    None => dangling.push(GraphViolation::error(
                        from,
                        ViolationKind::UnknownReference,
                        format!("conflict pair on unknown node {from}"),
                    )),
                }
            }
        }
        if !dangling.is_empty() {
            return Err(PolicyError::StructuralGraph(dangling));
        }
        NodeGraph::load(self.nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Translation;

    fn node(id: i32, name: &str) -> Node {
        Node::new(NodeId(id), name, Translation::new(name, name))
    }

    #[test]
    fn load_and_lookup() {
        let graph = NodeGraph::builder()
            .node(node(1, "member"))
            .node(node(2, "mail"))
            .implies(NodeId(1), NodeId(2))
            .build()
            .unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get(NodeId(2)).unwrap().name, "mail");
        assert_eq!(graph.get_by_name("member").unwrap().id, NodeId(1));
        assert!(matches!(
            graph.get(NodeId(3)),
            Err(PolicyError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_id_is_fatal() {
        let err = NodeGraph::load(vec![node(1, "a"), node(1, "b")]).unwrap_err();
        let PolicyError::StructuralGraph(violations) = err else {
            panic!("expected StructuralGraph");
        };
        assert!(violations
            .iter()
            .any(|v| v.kind == ViolationKind::DuplicateNodeId));
    }

    #[test]
    fn unknown_reference_is_fatal() {
        let mut n = node(1, "a");
        n.implies.push(NodeId(9));
        let err = NodeGraph::load(vec![n]).unwrap_err();
        let PolicyError::StructuralGraph(violations) = err else {
            panic!("expected StructuralGraph");
        };
        assert!(violations
            .iter()
            .any(|v| v.kind == ViolationKind::UnknownReference));
    }

    #[test]
    fn asymmetric_conflict_reported_as_error() {
        let mut a = node(1, "a");
        a.conflicts_with.push(NodeId(2));
        let b = node(2, "b");
        // Load succeeds structurally (references resolve) but validate
        // reports the missing reverse pair as an error-severity finding.
        let graph = NodeGraph {
            nodes: vec![a, b],
            index: HashMap::from([(NodeId(1), 0), (NodeId(2), 1)]),
            fwd: vec![vec![], vec![]],
            rev: vec![vec![], vec![]],
            conj: vec![vec![], vec![]],
        };
        let violations = graph.validate();
        assert!(violations.iter().any(|v| v.kind
            == ViolationKind::AsymmetricConflict
            && v.severity == ViolationSeverity::Error));
    }

    #[test]
    fn symmetric_conflict_via_builder_is_clean() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node(2, "b"))
            .conflict(NodeId(1), NodeId(2))
            .build()
            .unwrap();
        assert!(graph.get(NodeId(1)).unwrap().in_conflict_with(NodeId(2)));
        assert!(graph.get(NodeId(2)).unwrap().in_conflict_with(NodeId(1)));
        assert!(graph
            .validate()
            .iter()
            .all(|v| v.kind != ViolationKind::AsymmetricConflict));
    }

    #[test]
    fn cycle_is_flagged_not_rejected() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node(2, "b"))
            .node(node(3, "c"))
            .implies(NodeId(1), NodeId(2))
            .implies(NodeId(2), NodeId(3))
            .implies(NodeId(3), NodeId(1))
            .build()
            .unwrap();
        let cycles = graph.cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0], vec![NodeId(1), NodeId(2), NodeId(3)]);
        assert!(graph.validate().iter().any(|v| v.kind == ViolationKind::Cycle
            && v.severity == ViolationSeverity::Warning));
    }

    #[test]
    fn self_loop_counts_as_cycle() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .implies(NodeId(1), NodeId(1))
            .build()
            .unwrap();
        assert_eq!(graph.cycles(), vec![vec![NodeId(1)]]);
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let graph = NodeGraph::builder()
            .node(node(1, "a"))
            .node(node(2, "b"))
            .node(node(3, "c"))
            .implies(NodeId(1), NodeId(2))
            .implies(NodeId(1), NodeId(3))
            .implies(NodeId(2), NodeId(3))
            .build()
            .unwrap();
        assert!(graph.cycles().is_empty());
    }

    #[test]
    fn builder_dangling_edge_fails() {
        let err = NodeGraph::builder()
            .node(node(1, "a"))
            .implies(NodeId(9), NodeId(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, PolicyError::StructuralGraph(_)));
    }

    #[test]
    fn violation_display() {
        let v = GraphViolation::error(
            NodeId(3),
            ViolationKind::UnknownReference,
            "references unknown node 9".into(),
        );
        assert_eq!(v.to_string(), "[node 3] error: references unknown node 9");
    }
}
