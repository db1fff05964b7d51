//! Transaction-aware cursors over the record store and its indexes.
//!
//! Every cursor follows the same lifecycle: created (fresh or from a pool),
//! initialized by a scan or seek, advanced with `next` until it returns
//! `Ok(false)`, then closed. Advancing a closed cursor is a usage error;
//! closing twice is harmless.

mod edge;
mod merge;
mod node;
mod partitioned;
mod pool;
mod property;
mod token_index;
mod traversal;
mod value_index;

pub use edge::EdgeScanCursor;
pub use merge::{MergeJoin, MergeSide, PrimitiveSortedMergeJoin, SortedMergeJoin};
pub use node::NodeCursor;
pub use partitioned::{BatchedScan, PartitionedScan, RangeCursor, ScanPartition, ScanRange};
pub use pool::{CursorPool, LeakReport, LeakTracker, Poolable, Pooled};
pub use property::PropertyCursor;
pub use token_index::{EdgeTypeIndexCursor, NodeLabelIndexCursor, TokenIndexCursor};
pub use traversal::EdgeTraversalCursor;
pub use value_index::{EdgeValueIndexCursor, NodeValueIndexCursor, ValueIndexCursor};

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::storage::index::TokenIndex;
use crate::storage::metrics::CursorMetrics;
use crate::storage::security::AccessMode;
use crate::storage::store::GraphStore;
use crate::storage::txstate::{DiffSnapshot, TxState};
use crate::types::{EdgeId, EntityKind, IndexId, LabelId, NodeId, PropId, Result, SombraError, TypeId};

/// Operations shared by every cursor.
pub trait Cursor {
    /// Advances to the next entity. `Ok(false)` means exhausted.
    fn next(&mut self) -> Result<bool>;

    /// Releases held resources and resets the cursor for reuse. Idempotent.
    fn close(&mut self);

    /// Whether the cursor is closed.
    fn is_closed(&self) -> bool;

    /// Installs or removes a read tracer.
    fn set_tracer(&mut self, tracer: Option<Arc<dyn ReadTracer>>);
}

/// Observation hook invoked as cursors read.
#[allow(unused_variables)]
pub trait ReadTracer: Send + Sync {
    /// A full node scan started.
    fn on_all_nodes_scan(&self) {}
    /// A node was produced.
    fn on_node(&self, node: NodeId) {}
    /// A label scan started.
    fn on_label_scan(&self, label: LabelId) {}
    /// An edge type scan started.
    fn on_type_scan(&self, ty: TypeId) {}
    /// A value index seek started.
    fn on_index_seek(&self, index: IndexId, predicates: usize) {}
    /// An edge was produced.
    fn on_edge(&self, edge: EdgeId) {}
    /// A property was produced.
    fn on_property(&self, prop: PropId) {}
}

/// Everything a cursor needs to read on behalf of one transaction.
#[derive(Clone)]
pub struct ReadContext {
    pub(crate) store: Arc<GraphStore>,
    pub(crate) tx: Arc<RwLock<TxState>>,
    pub(crate) access: Arc<dyn AccessMode>,
    pub(crate) metrics: Arc<dyn CursorMetrics>,
    pub(crate) leaks: LeakTracker,
}

impl ReadContext {
    /// Bundles the read collaborators of a transaction.
    pub fn new(
        store: Arc<GraphStore>,
        tx: Arc<RwLock<TxState>>,
        access: Arc<dyn AccessMode>,
        metrics: Arc<dyn CursorMetrics>,
        leaks: LeakTracker,
    ) -> Self {
        Self {
            store,
            tx,
            access,
            metrics,
            leaks,
        }
    }

    /// Committed store.
    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// Active access mode.
    pub fn access(&self) -> &dyn AccessMode {
        self.access.as_ref()
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum Lifecycle {
    #[default]
    Fresh,
    Active,
    Exhausted,
    Closed,
}

impl Lifecycle {
    /// Returns whether `next` may produce entities, or the usage error for a
    /// closed cursor.
    pub(crate) fn check_advance(self) -> Result<bool> {
        match self {
            Lifecycle::Closed => Err(SombraError::Usage("cursor advanced after close")),
            Lifecycle::Active => Ok(true),
            Lifecycle::Fresh | Lifecycle::Exhausted => Ok(false),
        }
    }
}

/// Where the ids an overlay adds to a scan come from.
#[derive(Clone, Debug, Default)]
pub(crate) enum AddedIds {
    #[default]
    None,
    /// A single id.
    One(u64),
    /// A frozen set, walked in ascending order.
    Set {
        ids: Arc<BTreeSet<u64>>,
        last: Option<u64>,
    },
    /// A claimed slice of a shared id array.
    Slice {
        ids: Arc<[u64]>,
        pos: usize,
        end: usize,
    },
}

impl AddedIds {
    pub(crate) fn from_set(ids: &Arc<BTreeSet<u64>>) -> Self {
        if ids.is_empty() {
            AddedIds::None
        } else {
            AddedIds::Set {
                ids: Arc::clone(ids),
                last: None,
            }
        }
    }

    pub(crate) fn next_id(&mut self) -> Option<u64> {
        match self {
            AddedIds::None => None,
            AddedIds::One(id) => {
                let id = *id;
                *self = AddedIds::None;
                Some(id)
            }
            AddedIds::Set { ids, last } => {
                let found = match last {
                    None => ids.iter().next().copied(),
                    Some(prev) => ids
                        .range((std::ops::Bound::Excluded(*prev), std::ops::Bound::Unbounded))
                        .next()
                        .copied(),
                };
                *last = found;
                if found.is_none() {
                    *self = AddedIds::None;
                }
                found
            }
            AddedIds::Slice { ids, pos, end } => {
                if *pos < *end {
                    let id = ids[*pos];
                    *pos += 1;
                    Some(id)
                } else {
                    *self = AddedIds::None;
                    None
                }
            }
        }
    }
}

/// Frozen removed ids consulted while a scan runs.
#[derive(Clone, Debug, Default)]
pub(crate) struct RemovedIds(Option<Arc<BTreeSet<u64>>>);

impl RemovedIds {
    pub(crate) fn from_snapshot(snapshot: &DiffSnapshot<u64>) -> Self {
        Self::from_set(snapshot.removed())
    }

    pub(crate) fn from_set(ids: &Arc<BTreeSet<u64>>) -> Self {
        if ids.is_empty() {
            RemovedIds(None)
        } else {
            RemovedIds(Some(Arc::clone(ids)))
        }
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.0.as_ref().map(|ids| ids.contains(&id)).unwrap_or(false)
    }
}

/// Entity cursor the token and value index cursors resolve hits through.
///
/// Node and edge flavours differ only here; the index cursors are written once
/// against this trait.
pub trait EntityCursor: Cursor + Default + Send + 'static {
    /// Entity kind produced.
    const KIND: EntityKind;

    /// Positions on exactly one entity, honouring transaction state and
    /// security. The following `next` reports whether it is visible.
    fn seek(&mut self, ctx: &ReadContext, id: u64);

    /// Like `seek`, but ignores deletions the transaction made after a scan
    /// admitted `id`. Entities created and deleted in the transaction are gone.
    fn seek_stable(&mut self, ctx: &ReadContext, id: u64);

    /// Current entity id.
    fn reference(&self) -> Option<u64>;

    /// Tokens of the current entity: labels of a node or the type of an edge.
    fn tokens(&self) -> SmallVec<[u32; 4]>;

    /// Points `props` at the properties of the current entity.
    fn load_properties(&self, props: &mut PropertyCursor) -> Result<()>;

    /// Whether `prop` of the current entity may be read.
    fn can_read_property(&self, access: &dyn AccessMode, prop: PropId) -> bool;

    /// Committed token index for the entity kind.
    fn token_index(store: &GraphStore) -> &Arc<TokenIndex>;

    /// Transaction changes to `token` membership.
    fn token_diff(tx: &TxState, token: u32) -> DiffSnapshot<u64>;

    /// Whether every entity carrying `token` is visible.
    fn traverse_all_with_token(access: &dyn AccessMode, token: u32) -> bool;

    /// Entities with any transaction change.
    fn touched(tx: &TxState) -> BTreeSet<u64>;
}
