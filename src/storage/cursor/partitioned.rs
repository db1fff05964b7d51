//! Parallel scans: committed id ranges (or value index key slices) handed out
//! through one atomic counter, and batches that also split the transaction's
//! added ids into disjoint slices.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::storage::index::{
    IndexQueryConstraints, KeyRange, PropertyPredicate, TokenIndex, ValueIndex, ValueKey,
};
use crate::storage::store::GraphStore;
use crate::types::{EntityKind, LabelId, Result, SombraError, TypeId};

use super::{
    AddedIds, Cursor, EdgeScanCursor, EdgeTypeIndexCursor, EntityCursor, NodeCursor,
    NodeLabelIndexCursor, ReadContext, RemovedIds, TokenIndexCursor, ValueIndexCursor,
};

/// Range assigned to a cursor by a partitioned or batched scan.
pub struct ScanRange {
    pub(crate) token: Option<u32>,
    pub(crate) start: u64,
    pub(crate) end: Option<u64>,
    pub(crate) added: AddedIds,
    pub(crate) removed: RemovedIds,
    pub(crate) seek: Option<SeekSlice>,
}

/// Key slice of a value index seek assigned to one partition.
pub(crate) struct SeekSlice {
    pub(crate) index: Arc<ValueIndex>,
    pub(crate) query: Vec<PropertyPredicate>,
    pub(crate) constraints: IndexQueryConstraints,
    pub(crate) keys: KeyRange,
}

/// Cursor that can be pointed at a sub-range of a scan.
pub trait RangeCursor: Cursor {
    /// Positions before the first entity of `range`.
    fn bind_range(&mut self, ctx: &ReadContext, range: ScanRange) -> Result<()>;
}

impl RangeCursor for NodeCursor {
    fn bind_range(&mut self, ctx: &ReadContext, range: ScanRange) -> Result<()> {
        let end = range.end.unwrap_or(u64::MAX);
        self.scan_range(ctx, range.start, end, range.added, range.removed);
        Ok(())
    }
}

impl RangeCursor for EdgeScanCursor {
    fn bind_range(&mut self, ctx: &ReadContext, range: ScanRange) -> Result<()> {
        let end = range.end.unwrap_or(u64::MAX);
        self.scan_range(ctx, range.start, end, range.added, range.removed);
        Ok(())
    }
}

impl<E: EntityCursor> RangeCursor for TokenIndexCursor<E> {
    fn bind_range(&mut self, ctx: &ReadContext, range: ScanRange) -> Result<()> {
        self.scan_range(ctx, range.token.unwrap_or_default(), range.start, range.end);
        Ok(())
    }
}

impl<E: EntityCursor> RangeCursor for ValueIndexCursor<E> {
    fn bind_range(&mut self, ctx: &ReadContext, range: ScanRange) -> Result<()> {
        let slice = range
            .seek
            .ok_or(SombraError::Usage("value index cursor needs a key slice"))?;
        self.seek_within(ctx, &slice.index, &slice.query, slice.constraints, slice.keys)
    }
}

/// One id range of a partitioned scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScanPartition {
    /// Position in hand-out order.
    pub index: usize,
    /// First id, inclusive. Value index partitions count hit ranks instead.
    pub start: u64,
    /// Last id, exclusive; `None` for the open-ended final partition.
    pub end: Option<u64>,
}

impl ScanPartition {
    /// Number of ids covered, `None` when unbounded.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    /// Whether the partition covers no ids.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// Committed scan split into partitions that independent threads reserve.
///
/// Every constructor yields `min(desired, max(total, 1))` partitions, where
/// `total` counts the committed entities in scope. The final partition is open ended so entities committed after sizing still
/// land somewhere. Only valid for transactions without pending changes.
pub struct PartitionedScan<C: RangeCursor> {
    ctx: ReadContext,
    token: Option<u32>,
    bounds: Vec<u64>,
    batch: u64,
    seek: Option<PartitionedSeek>,
    next: AtomicUsize,
    _cursor: PhantomData<fn() -> C>,
}

/// Value index seek whose committed hits are cut at `splits`.
struct PartitionedSeek {
    index: Arc<ValueIndex>,
    query: Vec<PropertyPredicate>,
    constraints: IndexQueryConstraints,
    splits: Vec<ValueKey>,
}

impl PartitionedSeek {
    fn slice(&self, partition: usize) -> SeekSlice {
        let floor = partition.checked_sub(1).and_then(|i| self.splits.get(i)).cloned();
        SeekSlice {
            index: Arc::clone(&self.index),
            query: self.query.clone(),
            constraints: self.constraints,
            keys: KeyRange {
                floor,
                ceiling: self.splits.get(partition).cloned(),
            },
        }
    }
}

impl PartitionedScan<NodeCursor> {
    /// Partitions a scan over every node.
    pub fn all_nodes(ctx: &ReadContext, desired: usize) -> Result<Self> {
        Self::by_id(ctx, ctx.store.node_count(), desired)
    }
}

impl PartitionedScan<EdgeScanCursor> {
    /// Partitions a scan over every edge.
    pub fn all_edges(ctx: &ReadContext, desired: usize) -> Result<Self> {
        Self::by_id(ctx, ctx.store.edge_count(), desired)
    }
}

impl PartitionedScan<NodeLabelIndexCursor> {
    /// Partitions a label scan.
    pub fn label(ctx: &ReadContext, label: LabelId, desired: usize) -> Result<Self> {
        Self::by_token(ctx, EntityKind::Node, label.0, desired)
    }

    /// Partitions one scan per label, all with the same partition count so a
    /// worker can reserve the same partition of each.
    pub fn labels(ctx: &ReadContext, labels: &[LabelId], desired: usize) -> Result<Vec<Self>> {
        let tokens: Vec<u32> = labels.iter().map(|label| label.0).collect();
        Self::by_tokens(ctx, EntityKind::Node, &tokens, desired)
    }
}

impl PartitionedScan<EdgeTypeIndexCursor> {
    /// Partitions an edge type scan.
    pub fn edge_type(ctx: &ReadContext, ty: TypeId, desired: usize) -> Result<Self> {
        Self::by_token(ctx, EntityKind::Edge, ty.0, desired)
    }

    /// Partitions one scan per edge type, all with the same partition count.
    pub fn edge_types(ctx: &ReadContext, types: &[TypeId], desired: usize) -> Result<Vec<Self>> {
        let tokens: Vec<u32> = types.iter().map(|ty| ty.0).collect();
        Self::by_tokens(ctx, EntityKind::Edge, &tokens, desired)
    }
}

impl<E: EntityCursor> PartitionedScan<ValueIndexCursor<E>> {
    /// Partitions the committed hits of `query` on `index` into slices of the
    /// index key space. Ordered seeks cannot be partitioned.
    pub fn index_seek(
        ctx: &ReadContext,
        index: &Arc<ValueIndex>,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
        desired: usize,
    ) -> Result<Self> {
        let descriptor = index.descriptor();
        if descriptor.entity != E::KIND {
            return Err(SombraError::IndexNotApplicable(format!(
                "index {} covers {} entities, cursor reads {}",
                descriptor.name,
                descriptor.entity,
                E::KIND
            )));
        }
        if constraints.order.is_ordered() {
            return Err(SombraError::Unsupported("ordered partitioned index seek"));
        }
        descriptor.validate_query(query, &constraints)?;
        let total = index.count_matching(query);
        let (count, batch) = sizing(total, desired)?;
        let (bounds, splits): (Vec<u64>, Vec<ValueKey>) =
            index.split_keys(query, count).into_iter().unzip();
        debug!(index = %descriptor.name, total, partitions = bounds.len() + 1, batch, "scan.partitioned");
        let mut scan = Self::from_bounds(ctx, None, bounds, batch);
        scan.seek = Some(PartitionedSeek {
            index: Arc::clone(index),
            query: query.to_vec(),
            constraints,
            splits,
        });
        Ok(scan)
    }
}

fn token_index(ctx: &ReadContext, kind: EntityKind) -> &Arc<TokenIndex> {
    match kind {
        EntityKind::Node => ctx.store.label_index(),
        EntityKind::Edge => ctx.store.type_index(),
    }
}

/// `min(desired, max(total, 1))` partitions of `ceil(total / count)` ids.
fn sizing(total: u64, desired: usize) -> Result<(usize, u64)> {
    if desired == 0 {
        return Err(SombraError::Invalid("partition count must be positive"));
    }
    let count = (desired as u64).min(total.max(1));
    Ok((count as usize, total.div_ceil(count)))
}

impl<C: RangeCursor> PartitionedScan<C> {
    fn by_id(ctx: &ReadContext, total: u64, desired: usize) -> Result<Self> {
        let (count, batch) = sizing(total, desired)?;
        let bounds = (1..count as u64).map(|i| i * batch).collect();
        debug!(total, partitions = count, batch, "scan.partitioned");
        Ok(Self::from_bounds(ctx, None, bounds, batch))
    }

    fn by_token(ctx: &ReadContext, kind: EntityKind, token: u32, desired: usize) -> Result<Self> {
        let index = token_index(ctx, kind);
        let total = index.count(token);
        let (count, batch) = sizing(total, desired)?;
        debug!(%kind, token, total, partitions = count, batch, "scan.partitioned");
        Ok(Self::from_bounds(ctx, Some(token), index.split_points(token, count), batch))
    }

    /// Sized by the largest token, so smaller tokens may get empty partitions.
    fn by_tokens(
        ctx: &ReadContext,
        kind: EntityKind,
        tokens: &[u32],
        desired: usize,
    ) -> Result<Vec<Self>> {
        let index = token_index(ctx, kind);
        let largest = tokens.iter().map(|token| index.count(*token)).max().unwrap_or(0);
        let (count, batch) = sizing(largest, desired)?;
        debug!(%kind, tokens = tokens.len(), largest, partitions = count, batch, "scan.partitioned");
        Ok(tokens
            .iter()
            .map(|token| {
                Self::from_bounds(ctx, Some(*token), index.split_points(*token, count), batch)
            })
            .collect())
    }

    fn from_bounds(ctx: &ReadContext, token: Option<u32>, bounds: Vec<u64>, batch: u64) -> Self {
        Self {
            ctx: ctx.clone(),
            token,
            bounds,
            batch,
            seek: None,
            next: AtomicUsize::new(0),
            _cursor: PhantomData,
        }
    }

    /// Number of partitions.
    pub fn partitions(&self) -> usize {
        self.bounds.len() + 1
    }

    /// Upper bound on entities per bounded partition.
    pub fn batch_size(&self) -> u64 {
        self.batch
    }

    /// Every partition in hand-out order.
    pub fn layout(&self) -> Vec<ScanPartition> {
        (0..self.partitions()).map(|i| self.partition(i)).collect()
    }

    fn partition(&self, index: usize) -> ScanPartition {
        let start = if index == 0 { 0 } else { self.bounds[index - 1] };
        ScanPartition {
            index,
            start,
            end: self.bounds.get(index).copied(),
        }
    }

    /// Claims the next partition and points `cursor` at it. Returns `false`
    /// once every partition has been handed out.
    pub fn reserve_partition(&self, cursor: &mut C) -> Result<bool> {
        if self.ctx.tx.read().has_changes() {
            return Err(SombraError::Unsupported(
                "partitioned scan over a transaction with pending changes",
            ));
        }
        let index = self.next.fetch_add(1, Ordering::SeqCst);
        if index >= self.partitions() {
            return Ok(false);
        }
        let partition = self.partition(index);
        self.ctx.metrics.partition_reserved();
        trace!(index, start = partition.start, end = ?partition.end, "scan.reserve_partition");
        cursor.bind_range(
            &self.ctx,
            ScanRange {
                token: self.token,
                start: partition.start,
                end: partition.end,
                added: AddedIds::None,
                removed: RemovedIds::default(),
                seek: self.seek.as_ref().map(|seek| seek.slice(index)),
            },
        )?;
        Ok(true)
    }
}

/// Transaction-aware full scan consumed in batches by concurrent cursors.
///
/// The transaction's added ids are materialized once; each batch claims a
/// disjoint slice of them and a disjoint committed id range, both through
/// fetch-and-add.
pub struct BatchedScan<C: RangeCursor> {
    ctx: ReadContext,
    added: Arc<[u64]>,
    removed: RemovedIds,
    added_claim: AtomicUsize,
    store_claim: AtomicU64,
    high_id: fn(&GraphStore) -> u64,
    _cursor: PhantomData<fn() -> C>,
}

impl BatchedScan<NodeCursor> {
    /// Batches over every node the transaction sees.
    pub fn all_nodes(ctx: &ReadContext) -> Self {
        let diff = ctx.tx.read().node_diff();
        Self::new(ctx, diff.added().iter().copied().collect(), RemovedIds::from_snapshot(&diff), |store| {
            store.nodes().high_id()
        })
    }
}

impl BatchedScan<EdgeScanCursor> {
    /// Batches over every edge the transaction sees.
    pub fn all_edges(ctx: &ReadContext) -> Self {
        let diff = ctx.tx.read().edge_diff();
        Self::new(ctx, diff.added().iter().copied().collect(), RemovedIds::from_snapshot(&diff), |store| {
            store.edges().high_id()
        })
    }
}

impl<C: RangeCursor> BatchedScan<C> {
    fn new(
        ctx: &ReadContext,
        added: Arc<[u64]>,
        removed: RemovedIds,
        high_id: fn(&GraphStore) -> u64,
    ) -> Self {
        debug!(added = added.len(), "scan.batched");
        Self {
            ctx: ctx.clone(),
            added,
            removed,
            added_claim: AtomicUsize::new(0),
            store_claim: AtomicU64::new(0),
            high_id,
            _cursor: PhantomData,
        }
    }

    /// Number of ids the transaction added, shared across all batches.
    pub fn added_len(&self) -> usize {
        self.added.len()
    }

    /// Claims up to `size_hint` added ids and `size_hint` committed ids and
    /// points `cursor` at them. Returns `false` once both sides are exhausted.
    pub fn reserve_batch(&self, cursor: &mut C, size_hint: usize) -> Result<bool> {
        let size = size_hint.max(1);
        let start = self.added_claim.fetch_add(size, Ordering::SeqCst);
        let added = if start < self.added.len() {
            AddedIds::Slice {
                ids: Arc::clone(&self.added),
                pos: start,
                end: (start + size).min(self.added.len()),
            }
        } else {
            AddedIds::None
        };
        let store_start = self.store_claim.fetch_add(size as u64, Ordering::SeqCst);
        let high = (self.high_id)(&self.ctx.store);
        if store_start >= high && matches!(added, AddedIds::None) {
            return Ok(false);
        }
        self.ctx.metrics.partition_reserved();
        trace!(added_start = start, store_start, size, "scan.reserve_batch");
        cursor.bind_range(
            &self.ctx,
            ScanRange {
                token: None,
                start: store_start,
                end: Some(store_start.saturating_add(size as u64)),
                added,
                removed: self.removed.clone(),
                seek: None,
            },
        )?;
        Ok(true)
    }
}
