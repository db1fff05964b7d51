use crate::types::{EdgeId, GroupId, TypeId};

/// Where a node's edges start.
///
/// Sparse nodes point straight at the first edge of a mixed chain; dense nodes
/// point at a chain of per-type group records.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EdgeRef {
    /// The node has no edges.
    #[default]
    None,
    /// First edge of the node's chain.
    Direct(EdgeId),
    /// First group record of a dense node.
    Group(GroupId),
}

/// Which edges of a node a traversal yields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Edges whose source is the node (loops included).
    Outgoing,
    /// Edges whose destination is the node (loops included).
    Incoming,
    /// All edges, loops once.
    Both,
}

impl Direction {
    /// Whether outgoing edges are selected.
    pub fn includes_out(self) -> bool {
        matches!(self, Direction::Outgoing | Direction::Both)
    }

    /// Whether incoming edges are selected.
    pub fn includes_in(self) -> bool {
        matches!(self, Direction::Incoming | Direction::Both)
    }
}

/// Direction plus optional type filter for edge traversal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EdgeSelection {
    /// Direction relative to the origin node.
    pub direction: Direction,
    /// Accepted types; `None` accepts all.
    pub types: Option<Vec<TypeId>>,
}

impl EdgeSelection {
    /// Selects every edge of the node.
    pub fn all() -> Self {
        Self {
            direction: Direction::Both,
            types: None,
        }
    }

    /// Selects edges in one direction.
    pub fn direction(direction: Direction) -> Self {
        Self {
            direction,
            types: None,
        }
    }

    /// Restricts the selection to the given types.
    pub fn with_types(mut self, types: &[TypeId]) -> Self {
        let mut types = types.to_vec();
        types.sort();
        types.dedup();
        self.types = Some(types);
        self
    }

    /// Whether an edge of type `ty` is accepted.
    pub fn accepts_type(&self, ty: TypeId) -> bool {
        match &self.types {
            None => true,
            Some(types) => types.binary_search(&ty).is_ok(),
        }
    }

    /// Whether an edge between `src` and `dst` matches the direction from `node`.
    pub fn accepts_direction(&self, node: u64, src: u64, dst: u64) -> bool {
        (self.direction.includes_out() && src == node)
            || (self.direction.includes_in() && dst == node)
    }
}
