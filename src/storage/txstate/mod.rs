//! Uncommitted changes of one transaction.
//!
//! Cursors never hold the state lock while iterating; they take
//! [`DiffSnapshot`]s when a scan starts and consult per-entity state while
//! positioning.

mod diff;

pub use diff::{DiffSet, DiffSnapshot};

use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::types::{EdgeId, LabelId, NodeId, PropId, PropValue, TypeId};

/// Property change: `Some` sets a value, `None` removes it.
pub type PropChange = Option<PropValue>;

/// Per-node changes.
#[derive(Clone, Debug, Default)]
pub struct NodeState {
    /// Label changes.
    pub labels: DiffSet<LabelId>,
    /// Property changes.
    pub props: FxHashMap<PropId, PropChange>,
    /// Edges added in this transaction touching the node.
    pub added_edges: BTreeSet<EdgeId>,
}

/// Per-edge changes.
#[derive(Clone, Debug, Default)]
pub struct EdgeState {
    /// Property changes.
    pub props: FxHashMap<PropId, PropChange>,
}

/// Endpoints and type of an edge created in the transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AddedEdge {
    /// Source node.
    pub src: NodeId,
    /// Destination node.
    pub dst: NodeId,
    /// Edge type.
    pub ty: TypeId,
}

/// Transaction overlay.
#[derive(Clone, Debug, Default)]
pub struct TxState {
    nodes: DiffSet<u64>,
    edges: DiffSet<u64>,
    labels: FxHashMap<LabelId, DiffSet<u64>>,
    types: FxHashMap<TypeId, DiffSet<u64>>,
    node_states: FxHashMap<NodeId, NodeState>,
    edge_states: FxHashMap<EdgeId, EdgeState>,
    added_edges: FxHashMap<EdgeId, AddedEdge>,
    revision: u64,
}

impl TxState {
    /// Creates an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether anything changed.
    pub fn has_changes(&self) -> bool {
        !self.nodes.is_empty()
            || !self.edges.is_empty()
            || self.labels.values().any(|d| !d.is_empty())
            || self.types.values().any(|d| !d.is_empty())
            || !self.node_states.is_empty()
            || !self.edge_states.is_empty()
    }

    /// Monotonic counter bumped by every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn bump(&mut self) {
        self.revision += 1;
    }

    /// Records a node created in this transaction.
    pub fn node_create(&mut self, node: NodeId) {
        self.nodes.add(node.0);
        self.node_states.entry(node).or_default();
        self.bump();
    }

    /// Records a node deleted in this transaction along with its labels.
    pub fn node_delete(&mut self, node: NodeId, labels: &[LabelId]) {
        for label in labels {
            self.labels.entry(*label).or_default().remove(node.0);
        }
        if self.nodes.is_added(&node.0) {
            if let Some(state) = self.node_states.get(&node) {
                for label in state.labels.added().iter() {
                    if let Some(diff) = self.labels.get_mut(label) {
                        diff.forget(&node.0);
                    }
                }
            }
            self.node_states.remove(&node);
        } else {
            self.node_states.entry(node).or_default();
        }
        self.nodes.remove(node.0);
        self.bump();
    }

    /// Records an edge created in this transaction.
    pub fn edge_create(&mut self, edge: EdgeId, src: NodeId, ty: TypeId, dst: NodeId) {
        self.edges.add(edge.0);
        self.types.entry(ty).or_default().add(edge.0);
        self.added_edges.insert(edge, AddedEdge { src, dst, ty });
        self.node_states.entry(src).or_default().added_edges.insert(edge);
        self.node_states.entry(dst).or_default().added_edges.insert(edge);
        self.bump();
    }

    /// Records an edge deleted in this transaction.
    pub fn edge_delete(&mut self, edge: EdgeId, ty: TypeId) {
        if let Some(added) = self.added_edges.remove(&edge) {
            for node in [added.src, added.dst] {
                if let Some(state) = self.node_states.get_mut(&node) {
                    state.added_edges.remove(&edge);
                }
            }
        }
        self.edges.remove(edge.0);
        self.types.entry(ty).or_default().remove(edge.0);
        self.edge_states.remove(&edge);
        self.bump();
    }

    /// Records a label added to a node.
    pub fn node_add_label(&mut self, node: NodeId, label: LabelId) {
        self.labels.entry(label).or_default().add(node.0);
        self.node_states.entry(node).or_default().labels.add(label);
        self.bump();
    }

    /// Records a label removed from a node.
    pub fn node_remove_label(&mut self, node: NodeId, label: LabelId) {
        self.labels.entry(label).or_default().remove(node.0);
        self.node_states.entry(node).or_default().labels.remove(label);
        self.bump();
    }

    /// Records a node property write.
    pub fn node_set_property(&mut self, node: NodeId, prop: PropId, value: PropValue) {
        self.node_states
            .entry(node)
            .or_default()
            .props
            .insert(prop, Some(value));
        self.bump();
    }

    /// Records a node property removal.
    pub fn node_remove_property(&mut self, node: NodeId, prop: PropId) {
        self.node_states.entry(node).or_default().props.insert(prop, None);
        self.bump();
    }

    /// Records an edge property write.
    pub fn edge_set_property(&mut self, edge: EdgeId, prop: PropId, value: PropValue) {
        self.edge_states
            .entry(edge)
            .or_default()
            .props
            .insert(prop, Some(value));
        self.bump();
    }

    /// Node additions and deletions.
    pub fn node_diff(&self) -> DiffSnapshot<u64> {
        self.nodes.snapshot()
    }

    /// Edge additions and deletions.
    pub fn edge_diff(&self) -> DiffSnapshot<u64> {
        self.edges.snapshot()
    }

    /// Nodes gaining or losing `label`.
    pub fn label_diff(&self, label: LabelId) -> DiffSnapshot<u64> {
        self.labels
            .get(&label)
            .map(DiffSet::snapshot)
            .unwrap_or_default()
    }

    /// Edges of type `ty` created or deleted.
    pub fn type_diff(&self, ty: TypeId) -> DiffSnapshot<u64> {
        self.types
            .get(&ty)
            .map(DiffSet::snapshot)
            .unwrap_or_default()
    }

    /// Whether the node was created in this transaction.
    pub fn node_is_added(&self, node: NodeId) -> bool {
        self.nodes.is_added(&node.0)
    }

    /// Whether the node was deleted in this transaction.
    pub fn node_is_deleted(&self, node: NodeId) -> bool {
        self.nodes.is_removed(&node.0)
    }

    /// Whether the edge was created in this transaction.
    pub fn edge_is_added(&self, edge: EdgeId) -> bool {
        self.edges.is_added(&edge.0)
    }

    /// Whether the edge was deleted in this transaction.
    pub fn edge_is_deleted(&self, edge: EdgeId) -> bool {
        self.edges.is_removed(&edge.0)
    }

    /// Changes of one node.
    pub fn node_state(&self, node: NodeId) -> Option<&NodeState> {
        self.node_states.get(&node)
    }

    /// Changes of one edge.
    pub fn edge_state(&self, edge: EdgeId) -> Option<&EdgeState> {
        self.edge_states.get(&edge)
    }

    /// Endpoints of an edge created in this transaction.
    pub fn added_edge(&self, edge: EdgeId) -> Option<AddedEdge> {
        self.added_edges.get(&edge).copied()
    }

    /// Every node with any recorded change, ascending.
    pub fn touched_nodes(&self) -> BTreeSet<u64> {
        let mut out: BTreeSet<u64> = self.node_states.keys().map(|n| n.0).collect();
        out.extend(self.nodes.added().iter().copied());
        out.extend(self.nodes.removed().iter().copied());
        out
    }

    /// Every edge with any recorded change, ascending.
    pub fn touched_edges(&self) -> BTreeSet<u64> {
        let mut out: BTreeSet<u64> = self.edge_states.keys().map(|e| e.0).collect();
        out.extend(self.edges.added().iter().copied());
        out.extend(self.edges.removed().iter().copied());
        out
    }
}
