use std::sync::Arc;

use tracing::trace;

use crate::storage::cursor::{
    BatchedScan, Cursor, EdgeScanCursor, EdgeTypeIndexCursor, EdgeValueIndexCursor,
    EntityCursor, NodeCursor, NodeLabelIndexCursor, NodeValueIndexCursor, PartitionedScan,
    ReadContext, ValueIndexCursor,
};
use crate::storage::index::{
    IndexOrder, IndexQueryConstraints, PropertyPredicate, ValueIndex,
};
use crate::types::{EdgeId, IndexId, LabelId, NodeId, Result, SombraError, TypeId};

use super::KernelTransaction;

/// Read operations of one transaction. Every scan positions a caller-owned
/// cursor; nothing is read until the cursor is advanced.
pub struct Read<'t> {
    pub(super) tx: &'t KernelTransaction,
}

impl<'t> Read<'t> {
    pub(super) fn new(tx: &'t KernelTransaction) -> Self {
        Self { tx }
    }

    fn ctx(&self) -> &ReadContext {
        &self.tx.ctx
    }

    /// Every node visible to the transaction.
    pub fn all_nodes_scan(&self, cursor: &mut NodeCursor) {
        cursor.scan(self.ctx());
    }

    /// One node, if visible.
    pub fn single_node(&self, cursor: &mut NodeCursor, node: NodeId) {
        cursor.single(self.ctx(), node);
    }

    /// Every edge visible to the transaction.
    pub fn all_edges_scan(&self, cursor: &mut EdgeScanCursor) {
        cursor.scan(self.ctx());
    }

    /// One edge, if visible.
    pub fn single_edge(&self, cursor: &mut EdgeScanCursor, edge: EdgeId) {
        cursor.single(self.ctx(), edge);
    }

    /// Nodes carrying `label`.
    pub fn node_label_scan(&self, cursor: &mut NodeLabelIndexCursor, label: LabelId, order: IndexOrder) {
        cursor.scan(self.ctx(), label.0, order);
    }

    /// Edges of type `ty`.
    pub fn edge_type_scan(&self, cursor: &mut EdgeTypeIndexCursor, ty: TypeId, order: IndexOrder) {
        cursor.scan(self.ctx(), ty.0, order);
    }

    /// Seeks a node value index.
    pub fn node_index_seek(
        &self,
        cursor: &mut NodeValueIndexCursor,
        index: IndexId,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
    ) -> Result<()> {
        self.index_seek(cursor, index, query, constraints)
    }

    /// Seeks an edge value index.
    pub fn edge_index_seek(
        &self,
        cursor: &mut EdgeValueIndexCursor,
        index: IndexId,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
    ) -> Result<()> {
        self.index_seek(cursor, index, query, constraints)
    }

    /// Every entry of a node value index.
    pub fn node_index_scan(
        &self,
        cursor: &mut NodeValueIndexCursor,
        index: IndexId,
        constraints: IndexQueryConstraints,
    ) -> Result<()> {
        self.index_scan(cursor, index, constraints)
    }

    /// Every entry of an edge value index.
    pub fn edge_index_scan(
        &self,
        cursor: &mut EdgeValueIndexCursor,
        index: IndexId,
        constraints: IndexQueryConstraints,
    ) -> Result<()> {
        self.index_scan(cursor, index, constraints)
    }

    pub(super) fn index_seek<E: EntityCursor>(
        &self,
        cursor: &mut ValueIndexCursor<E>,
        index: IndexId,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
    ) -> Result<()> {
        let index = self.ctx().store.index(index)?;
        cursor.seek(self.ctx(), &index, query, constraints)
    }

    fn index_scan<E: EntityCursor>(
        &self,
        cursor: &mut ValueIndexCursor<E>,
        index: IndexId,
        constraints: IndexQueryConstraints,
    ) -> Result<()> {
        let (index, exists) = self.scan_query(index)?;
        cursor.seek(self.ctx(), &index, &[exists], constraints)
    }

    /// An index scan is a seek for entries whose first property exists.
    fn scan_query(&self, index: IndexId) -> Result<(Arc<ValueIndex>, PropertyPredicate)> {
        let index = self.ctx().store.index(index)?;
        let first = index
            .descriptor()
            .props
            .first()
            .copied()
            .ok_or(SombraError::Corruption("value index without properties"))?;
        trace!(index = %index.descriptor().name, "read.index_scan");
        Ok((index, PropertyPredicate::Exists { prop: first }))
    }

    /// Splits a full node scan into `desired` partitions.
    pub fn all_nodes_scan_partitioned(&self, desired: usize) -> Result<PartitionedScan<NodeCursor>> {
        PartitionedScan::all_nodes(self.ctx(), desired)
    }

    /// Splits a full edge scan into `desired` partitions.
    pub fn all_edges_scan_partitioned(&self, desired: usize) -> Result<PartitionedScan<EdgeScanCursor>> {
        PartitionedScan::all_edges(self.ctx(), desired)
    }

    /// Splits a label scan into `desired` partitions.
    pub fn node_label_scan_partitioned(
        &self,
        label: LabelId,
        desired: usize,
    ) -> Result<PartitionedScan<NodeLabelIndexCursor>> {
        PartitionedScan::label(self.ctx(), label, desired)
    }

    /// Splits an edge type scan into `desired` partitions.
    pub fn edge_type_scan_partitioned(
        &self,
        ty: TypeId,
        desired: usize,
    ) -> Result<PartitionedScan<EdgeTypeIndexCursor>> {
        PartitionedScan::edge_type(self.ctx(), ty, desired)
    }

    /// Splits label scans for every label in `labels` into the same number of
    /// partitions, at most `desired`.
    pub fn node_label_scans(
        &self,
        labels: &[LabelId],
        desired: usize,
    ) -> Result<Vec<PartitionedScan<NodeLabelIndexCursor>>> {
        PartitionedScan::labels(self.ctx(), labels, desired)
    }

    /// Splits type scans for every type in `types` into the same number of
    /// partitions, at most `desired`.
    pub fn edge_type_scans(
        &self,
        types: &[TypeId],
        desired: usize,
    ) -> Result<Vec<PartitionedScan<EdgeTypeIndexCursor>>> {
        PartitionedScan::edge_types(self.ctx(), types, desired)
    }

    /// Splits an unordered node index seek into `desired` partitions.
    pub fn node_index_seek_partitioned(
        &self,
        index: IndexId,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
        desired: usize,
    ) -> Result<PartitionedScan<NodeValueIndexCursor>> {
        let index = self.ctx().store.index(index)?;
        PartitionedScan::index_seek(self.ctx(), &index, query, constraints, desired)
    }

    /// Splits an unordered edge index seek into `desired` partitions.
    pub fn edge_index_seek_partitioned(
        &self,
        index: IndexId,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
        desired: usize,
    ) -> Result<PartitionedScan<EdgeValueIndexCursor>> {
        let index = self.ctx().store.index(index)?;
        PartitionedScan::index_seek(self.ctx(), &index, query, constraints, desired)
    }

    /// Splits an unordered scan of a node index into `desired` partitions.
    pub fn node_index_scan_partitioned(
        &self,
        index: IndexId,
        constraints: IndexQueryConstraints,
        desired: usize,
    ) -> Result<PartitionedScan<NodeValueIndexCursor>> {
        let (index, exists) = self.scan_query(index)?;
        PartitionedScan::index_seek(self.ctx(), &index, &[exists], constraints, desired)
    }

    /// Whether `node` exists for the transaction and is visible to it.
    pub fn node_exists(&self, node: NodeId) -> Result<bool> {
        let mut cursor = self.tx.acquire_node_cursor();
        cursor.single(self.ctx(), node);
        cursor.next()
    }

    /// Whether `edge` exists for the transaction and is visible to it.
    pub fn edge_exists(&self, edge: EdgeId) -> Result<bool> {
        let mut cursor = self.tx.acquire_edge_scan_cursor();
        cursor.single(self.ctx(), edge);
        cursor.next()
    }

    /// Whether the transaction deleted the committed node `node`.
    pub fn node_deleted_in_transaction(&self, node: NodeId) -> bool {
        self.ctx().tx.read().node_is_deleted(node)
    }

    /// Whether the transaction deleted the committed edge `edge`.
    pub fn edge_deleted_in_transaction(&self, edge: EdgeId) -> bool {
        self.ctx().tx.read().edge_is_deleted(edge)
    }

    /// Number of nodes the transaction sees.
    pub fn nodes_get_count(&self) -> Result<u64> {
        self.counts_for_node(None)
    }

    /// Number of nodes the transaction sees carrying `label`, or every node
    /// for `None`.
    ///
    /// Committed counts adjusted by the transaction's changes when the access
    /// mode grants the whole label; otherwise a visibility-checked scan.
    pub fn counts_for_node(&self, label: Option<LabelId>) -> Result<u64> {
        let ctx = self.ctx();
        let access = ctx.access();
        let whole = match label {
            Some(label) => access.allows_traverse_all_with_label(label),
            None => access.allows_traverse_all_nodes(),
        };
        if whole {
            let tx = ctx.tx.read();
            let (committed, diff) = match label {
                Some(label) => (ctx.store.label_count(label), tx.label_diff(label)),
                None => (ctx.store.node_count(), tx.node_diff()),
            };
            return Ok(adjusted(committed, diff.added().len(), diff.removed().len()));
        }
        trace!(label = ?label, "read.counts_for_node.scan");
        match label {
            Some(label) => {
                let mut cursor = self.tx.acquire_label_index_cursor();
                cursor.scan(ctx, label.0, IndexOrder::None);
                count(&mut *cursor)
            }
            None => {
                let mut cursor = self.tx.acquire_node_cursor();
                cursor.scan(ctx);
                count(&mut *cursor)
            }
        }
    }

    /// Number of edges the transaction sees, counted with a visibility-checked
    /// scan.
    pub fn edges_get_count(&self) -> Result<u64> {
        let ctx = self.ctx();
        let mut cursor = self.tx.acquire_edge_scan_cursor();
        cursor.scan(ctx);
        count(&mut *cursor)
    }

    /// Full node scan, including transaction changes, consumed in batches.
    pub fn all_nodes_batched(&self) -> BatchedScan<NodeCursor> {
        BatchedScan::all_nodes(self.ctx())
    }

    /// Full edge scan, including transaction changes, consumed in batches.
    pub fn all_edges_batched(&self) -> BatchedScan<EdgeScanCursor> {
        BatchedScan::all_edges(self.ctx())
    }
}

fn adjusted(committed: u64, added: usize, removed: usize) -> u64 {
    (committed + added as u64).saturating_sub(removed as u64)
}

fn count(cursor: &mut dyn Cursor) -> Result<u64> {
    let mut seen = 0;
    while cursor.next()? {
        seen += 1;
    }
    Ok(seen)
}
