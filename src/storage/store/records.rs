use smallvec::SmallVec;

use crate::types::{EdgeId, GroupId, LabelId, NodeId, PropId, PropRecId, PropValue, TypeId};

use super::refs::EdgeRef;

/// Fixed-slot record kept in a [`super::RecordFile`].
pub trait Record: Clone + Default + Send + Sync + 'static {
    /// Whether the slot holds a live record.
    fn in_use(&self) -> bool;
}

/// Stored node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeRecord {
    /// Live flag.
    pub in_use: bool,
    /// Sorted label set.
    pub labels: SmallVec<[LabelId; 4]>,
    /// Head of the property chain.
    pub first_prop: Option<PropRecId>,
    /// Head of the edge chain or group chain.
    pub edges: EdgeRef,
    /// Number of incident edges, loops counted once.
    pub degree: u32,
}

impl NodeRecord {
    /// Returns true if the node carries `label`.
    pub fn has_label(&self, label: LabelId) -> bool {
        self.labels.binary_search(&label).is_ok()
    }

    /// Whether edges are grouped per type.
    pub fn is_dense(&self) -> bool {
        matches!(self.edges, EdgeRef::Group(_))
    }
}

impl Record for NodeRecord {
    fn in_use(&self) -> bool {
        self.in_use
    }
}

/// Stored edge. Each edge sits on the chain of both endpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeRecord {
    /// Live flag.
    pub in_use: bool,
    /// Source node.
    pub src: NodeId,
    /// Destination node.
    pub dst: NodeId,
    /// Edge type.
    pub ty: TypeId,
    /// Head of the property chain.
    pub first_prop: Option<PropRecId>,
    /// Next edge on the source node's chain.
    pub src_next: Option<EdgeId>,
    /// Next edge on the destination node's chain.
    pub dst_next: Option<EdgeId>,
}

impl Default for EdgeRecord {
    fn default() -> Self {
        Self {
            in_use: false,
            src: NodeId(0),
            dst: NodeId(0),
            ty: TypeId(0),
            first_prop: None,
            src_next: None,
            dst_next: None,
        }
    }
}

impl EdgeRecord {
    /// Returns the chain pointer to follow when walking `node`'s edges.
    ///
    /// Loops are linked through the source pointer only.
    pub fn next_for(&self, node: NodeId) -> Option<Option<EdgeId>> {
        if self.src == node {
            Some(self.src_next)
        } else if self.dst == node {
            Some(self.dst_next)
        } else {
            None
        }
    }

    /// Returns the endpoint opposite to `node`.
    pub fn other_node(&self, node: NodeId) -> NodeId {
        if self.src == node {
            self.dst
        } else {
            self.src
        }
    }

    /// Whether both endpoints are the same node.
    pub fn is_loop(&self) -> bool {
        self.src == self.dst
    }
}

impl Record for EdgeRecord {
    fn in_use(&self) -> bool {
        self.in_use
    }
}

/// One property of a node or edge; records form a singly linked chain.
#[derive(Clone, Debug, PartialEq)]
pub struct PropRecord {
    /// Live flag.
    pub in_use: bool,
    /// Property key.
    pub key: PropId,
    /// Stored value.
    pub value: PropValue,
    /// Next record in the chain.
    pub next: Option<PropRecId>,
}

impl Default for PropRecord {
    fn default() -> Self {
        Self {
            in_use: false,
            key: PropId(0),
            value: PropValue::Null,
            next: None,
        }
    }
}

impl Record for PropRecord {
    fn in_use(&self) -> bool {
        self.in_use
    }
}

/// Per-type edge chains of a dense node.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupRecord {
    /// Live flag.
    pub in_use: bool,
    /// Node owning the group.
    pub owner: NodeId,
    /// Edge type of every edge in the group.
    pub ty: TypeId,
    /// Outgoing chain head (linked through `src_next`).
    pub first_out: Option<EdgeId>,
    /// Incoming chain head (linked through `dst_next`).
    pub first_in: Option<EdgeId>,
    /// Loop chain head (linked through `src_next`).
    pub first_loop: Option<EdgeId>,
    /// Next group of the owner, sorted by type.
    pub next: Option<GroupId>,
}

impl Default for GroupRecord {
    fn default() -> Self {
        Self {
            in_use: false,
            owner: NodeId(0),
            ty: TypeId(0),
            first_out: None,
            first_in: None,
            first_loop: None,
            next: None,
        }
    }
}

impl Record for GroupRecord {
    fn in_use(&self) -> bool {
        self.in_use
    }
}
