//! Access-mode oracle consulted by cursors and index filters.

use rustc_hash::FxHashSet;

use crate::types::{EdgeId, LabelId, NodeId, PropId, TypeId};

/// Side-effect free visibility queries.
pub trait AccessMode: Send + Sync {
    /// Whether every node carrying `label` is visible.
    fn allows_traverse_all_with_label(&self, label: LabelId) -> bool;

    /// Whether every node is visible regardless of labels.
    fn allows_traverse_all_nodes(&self) -> bool;

    /// Whether one node with `labels` is visible.
    fn allows_traverse_node(&self, node: NodeId, labels: &[LabelId]) -> bool;

    /// Whether every edge of type `ty` is visible.
    fn allows_traverse_all_of_type(&self, ty: TypeId) -> bool;

    /// Whether one edge is visible.
    fn allows_traverse_edge(&self, edge: EdgeId, ty: TypeId) -> bool;

    /// Whether property `prop` may be read on a node with `labels`.
    fn allows_read_node_property(&self, labels: &[LabelId], prop: PropId) -> bool;

    /// Whether property `prop` may be read on an edge of type `ty`.
    fn allows_read_edge_property(&self, ty: TypeId, prop: PropId) -> bool;
}

/// Grants everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AccessMode for AllowAll {
    fn allows_traverse_all_with_label(&self, _label: LabelId) -> bool {
        true
    }

    fn allows_traverse_all_nodes(&self) -> bool {
        true
    }

    fn allows_traverse_node(&self, _node: NodeId, _labels: &[LabelId]) -> bool {
        true
    }

    fn allows_traverse_all_of_type(&self, _ty: TypeId) -> bool {
        true
    }

    fn allows_traverse_edge(&self, _edge: EdgeId, _ty: TypeId) -> bool {
        true
    }

    fn allows_read_node_property(&self, _labels: &[LabelId], _prop: PropId) -> bool {
        true
    }

    fn allows_read_edge_property(&self, _ty: TypeId, _prop: PropId) -> bool {
        true
    }
}

/// Grant table with coarse token grants, denials and row-level grants.
///
/// A denial of a label hides every node carrying it, even if another label of
/// the node is granted.
#[derive(Clone, Debug, Default)]
pub struct RestrictedAccess {
    labels: FxHashSet<LabelId>,
    denied_labels: FxHashSet<LabelId>,
    types: FxHashSet<TypeId>,
    nodes: FxHashSet<NodeId>,
    edges: FxHashSet<EdgeId>,
    denied_props: FxHashSet<PropId>,
    unlabelled: bool,
}

impl RestrictedAccess {
    /// Denies everything until grants are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants traversal of every node carrying `label`.
    pub fn grant_label(mut self, label: LabelId) -> Self {
        self.labels.insert(label);
        self
    }

    /// Hides every node carrying `label`.
    pub fn deny_label(mut self, label: LabelId) -> Self {
        self.denied_labels.insert(label);
        self
    }

    /// Grants traversal of every edge of type `ty`.
    pub fn grant_type(mut self, ty: TypeId) -> Self {
        self.types.insert(ty);
        self
    }

    /// Grants one node regardless of labels.
    pub fn grant_node(mut self, node: NodeId) -> Self {
        self.nodes.insert(node);
        self
    }

    /// Grants one edge regardless of type.
    pub fn grant_edge(mut self, edge: EdgeId) -> Self {
        self.edges.insert(edge);
        self
    }

    /// Grants nodes without labels.
    pub fn grant_unlabelled(mut self) -> Self {
        self.unlabelled = true;
        self
    }

    /// Hides property `prop` everywhere.
    pub fn deny_property(mut self, prop: PropId) -> Self {
        self.denied_props.insert(prop);
        self
    }

    fn denies_any(&self, labels: &[LabelId]) -> bool {
        labels.iter().any(|l| self.denied_labels.contains(l))
    }
}

impl AccessMode for RestrictedAccess {
    fn allows_traverse_all_with_label(&self, label: LabelId) -> bool {
        self.denied_labels.is_empty() && self.labels.contains(&label)
    }

    fn allows_traverse_all_nodes(&self) -> bool {
        false
    }

    fn allows_traverse_node(&self, node: NodeId, labels: &[LabelId]) -> bool {
        if self.denies_any(labels) {
            return false;
        }
        if self.nodes.contains(&node) {
            return true;
        }
        if labels.is_empty() {
            return self.unlabelled;
        }
        labels.iter().any(|l| self.labels.contains(l))
    }

    fn allows_traverse_all_of_type(&self, ty: TypeId) -> bool {
        self.types.contains(&ty)
    }

    fn allows_traverse_edge(&self, edge: EdgeId, ty: TypeId) -> bool {
        self.types.contains(&ty) || self.edges.contains(&edge)
    }

    fn allows_read_node_property(&self, labels: &[LabelId], prop: PropId) -> bool {
        !self.denied_props.contains(&prop) && !self.denies_any(labels)
    }

    fn allows_read_edge_property(&self, _ty: TypeId, prop: PropId) -> bool {
        !self.denied_props.contains(&prop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_grants_apply_without_label_grant() {
        let access = RestrictedAccess::new().grant_node(NodeId(3));
        assert!(!access.allows_traverse_all_with_label(LabelId(1)));
        assert!(access.allows_traverse_node(NodeId(3), &[LabelId(1)]));
        assert!(!access.allows_traverse_node(NodeId(4), &[LabelId(1)]));
    }

    #[test]
    fn denial_beats_grants() {
        let access = RestrictedAccess::new()
            .grant_label(LabelId(1))
            .deny_label(LabelId(2));
        assert!(!access.allows_traverse_all_with_label(LabelId(1)));
        assert!(access.allows_traverse_node(NodeId(1), &[LabelId(1)]));
        assert!(!access.allows_traverse_node(NodeId(1), &[LabelId(1), LabelId(2)]));
        assert!(!access.allows_read_node_property(&[LabelId(2)], PropId(1)));
    }

    #[test]
    fn property_denial() {
        let access = RestrictedAccess::new().deny_property(PropId(9));
        assert!(!access.allows_read_edge_property(TypeId(1), PropId(9)));
        assert!(access.allows_read_edge_property(TypeId(1), PropId(1)));
        assert!(AllowAll.allows_traverse_all_nodes());
    }
}
