//! Identifiers, values and the crate-wide error type.

#![forbid(unsafe_code)]

use std::fmt;

mod value;

pub use value::{compare_tuples, compare_values, IndexValue, PropValue, ValueGroup};

/// Identifier of a node record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct NodeId(pub u64);
/// Identifier of an edge (relationship) record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EdgeId(pub u64);
/// Identifier of a property record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PropRecId(pub u64);
/// Identifier of an edge-group record of a dense node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct GroupId(pub u64);
/// Label token.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct LabelId(pub u32);
/// Edge type token.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TypeId(pub u32);
/// Property key token.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PropId(pub u32);
/// Identifier of a value index.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct IndexId(pub u32);

/// Errors surfaced by the cursor engine.
///
/// Exhaustion is never an error: cursors report it as `Ok(false)` from `next`.
#[derive(thiserror::Error, Debug)]
pub enum SombraError {
    /// A stored record or chain is malformed.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller broke the cursor protocol.
    #[error("usage violation: {0}")]
    Usage(&'static str),
    /// The index cannot serve the requested query, ordering or uniqueness.
    #[error("index not applicable: {0}")]
    IndexNotApplicable(String),
    /// The operation is not permitted in the current transaction context.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// An argument was out of range.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A required entity does not exist.
    #[error("not found")]
    NotFound,
}

impl SombraError {
    /// Returns true for errors that indicate a programming error or corruption and
    /// must abort the enclosing transaction.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SombraError::Corruption(_) | SombraError::Usage(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SombraError>;

macro_rules! display_as_inner {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

display_as_inner!(NodeId, EdgeId, GroupId, LabelId, TypeId, PropId, IndexId);

impl From<u32> for LabelId {
    fn from(value: u32) -> Self {
        LabelId(value)
    }
}

impl From<u32> for TypeId {
    fn from(value: u32) -> Self {
        TypeId(value)
    }
}

impl From<u32> for PropId {
    fn from(value: u32) -> Self {
        PropId(value)
    }
}

/// Kind of entity a cursor or index iterates.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum EntityKind {
    /// Nodes.
    Node,
    /// Edges.
    Edge,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Node => f.write_str("node"),
            EntityKind::Edge => f.write_str("edge"),
        }
    }
}
