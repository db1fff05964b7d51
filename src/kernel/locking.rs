//! Lock-then-verify helpers.
//!
//! Reads taken without locks are re-checked once the locks are held; when the
//! re-read disagrees the locks are dropped and the whole cycle starts over.
//! Resource ids are always sorted before acquisition.

use std::hash::Hasher;

use tracing::{debug, trace};
use xxhash_rust::xxh64::Xxh64;

use crate::primitives::concurrency::{LockClient, ResourceType};
use crate::storage::cursor::{
    Cursor, EdgeScanCursor, EdgeTraversalCursor, EdgeValueIndexCursor, EntityCursor, NodeCursor,
    NodeValueIndexCursor, ReadContext, ValueIndexCursor,
};
use crate::storage::index::{IndexQueryConstraints, PropertyPredicate};
use crate::storage::store::EdgeSelection;
use crate::types::{
    EdgeId, EntityKind, IndexId, LabelId, NodeId, PropValue, Result, SombraError, TypeId,
};

use super::{Read, Write};

/// Incident edges and neighbours of a node as seen by one read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DetachSnapshot {
    /// Whether the node was visible at all.
    pub exists: bool,
    /// Labels of the node, ascending.
    pub labels: Vec<LabelId>,
    /// Incident edges with their types, ascending by id.
    pub edges: Vec<(EdgeId, TypeId)>,
    /// The node and every neighbour, ascending and deduplicated.
    pub nodes: Vec<NodeId>,
}

/// Outcome of comparing a lock-free snapshot with the re-read under locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetachVerdict {
    /// Nothing moved; the locked view may be acted on.
    Proceed,
    /// Something changed; release and start over.
    Retry,
}

/// Decides whether a detach may proceed.
///
/// Any difference counts: an edge that appeared or vanished, a neighbour that
/// changed, or the node itself disappearing.
pub fn verify_detach(snapshot: &DetachSnapshot, reread: &DetachSnapshot) -> DetachVerdict {
    if snapshot == reread {
        DetachVerdict::Proceed
    } else {
        DetachVerdict::Retry
    }
}

fn detach_snapshot(ctx: &ReadContext, node: NodeId) -> Result<DetachSnapshot> {
    let mut nodes = NodeCursor::new();
    let mut traversal = EdgeTraversalCursor::new();
    let outcome = collect_detach(ctx, node, &mut nodes, &mut traversal);
    traversal.close();
    nodes.close();
    outcome
}

fn collect_detach(
    ctx: &ReadContext,
    node: NodeId,
    nodes: &mut NodeCursor,
    traversal: &mut EdgeTraversalCursor,
) -> Result<DetachSnapshot> {
    nodes.single(ctx, node);
    if !nodes.next()? {
        return Ok(DetachSnapshot::default());
    }
    let mut snapshot = DetachSnapshot {
        exists: true,
        labels: nodes.labels().to_vec(),
        edges: Vec::new(),
        nodes: vec![node],
    };
    nodes.edges(traversal, EdgeSelection::all())?;
    while traversal.next()? {
        if let Some(edge) = traversal.edge_reference() {
            snapshot.edges.push((edge, traversal.edge_type()));
            snapshot.nodes.push(traversal.other_node());
        }
    }
    snapshot.edges.sort_unstable_by_key(|(edge, _)| *edge);
    snapshot.edges.dedup_by_key(|(edge, _)| *edge);
    snapshot.nodes.sort_unstable();
    snapshot.nodes.dedup();
    Ok(snapshot)
}

/// Endpoints and type of one edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct EdgeEnds {
    pub(super) src: NodeId,
    pub(super) dst: NodeId,
    pub(super) ty: TypeId,
}

impl EdgeEnds {
    fn sorted_nodes(&self) -> Vec<u64> {
        let mut ids = vec![self.src.0, self.dst.0];
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

pub(super) fn read_edge(ctx: &ReadContext, edge: EdgeId) -> Result<Option<EdgeEnds>> {
    let mut cursor = EdgeScanCursor::new();
    cursor.single(ctx, edge);
    let outcome = match cursor.next() {
        Ok(true) => Ok(Some(EdgeEnds {
            src: cursor.source(),
            dst: cursor.target(),
            ty: cursor.edge_type(),
        })),
        Ok(false) => Ok(None),
        Err(err) => Err(err),
    };
    cursor.close();
    outcome
}

fn node_ids(nodes: &[NodeId]) -> Vec<u64> {
    nodes.iter().map(|node| node.0).collect()
}

fn hash_value(value: &PropValue, hasher: &mut Xxh64) {
    match value {
        PropValue::Null => hasher.write_u8(0),
        PropValue::Bool(v) => {
            hasher.write_u8(1);
            hasher.write_u8(*v as u8);
        }
        PropValue::Int(v) => {
            hasher.write_u8(2);
            hasher.write_i64(*v);
        }
        PropValue::Float(v) => {
            hasher.write_u8(3);
            hasher.write_u64(v.to_bits());
        }
        PropValue::Str(s) => {
            hasher.write_u8(4);
            hasher.write_u64(s.len() as u64);
            hasher.write(s.as_bytes());
        }
        PropValue::Bytes(bytes) => {
            hasher.write_u8(5);
            hasher.write_u64(bytes.len() as u64);
            hasher.write(bytes);
        }
    }
}

/// Lock id of a unique index entry: the token plus every exact value.
pub(crate) fn index_entry_key(token: u32, query: &[PropertyPredicate]) -> u64 {
    let mut hasher = Xxh64::new(0);
    hasher.write_u32(token);
    for predicate in query {
        if let PropertyPredicate::Exact { prop, value } = predicate {
            hasher.write_u32(prop.0);
            hash_value(value, &mut hasher);
        }
    }
    hasher.finish()
}

impl Read<'_> {
    /// Looks up a unique node index entry and locks it.
    ///
    /// Returns with a shared lock on the entry when it exists and an exclusive
    /// lock when it does not, so the caller may create it without racing
    /// another transaction.
    pub fn locking_node_unique_index_seek(
        &self,
        cursor: &mut NodeValueIndexCursor,
        index: IndexId,
        query: &[PropertyPredicate],
    ) -> Result<Option<NodeId>> {
        Ok(self
            .unique_seek(cursor, EntityKind::Node, index, query)?
            .map(NodeId))
    }

    /// Edge variant of [`Read::locking_node_unique_index_seek`].
    pub fn locking_edge_unique_index_seek(
        &self,
        cursor: &mut EdgeValueIndexCursor,
        index: IndexId,
        query: &[PropertyPredicate],
    ) -> Result<Option<EdgeId>> {
        Ok(self
            .unique_seek(cursor, EntityKind::Edge, index, query)?
            .map(EdgeId))
    }

    fn unique_seek<E: EntityCursor>(
        &self,
        cursor: &mut ValueIndexCursor<E>,
        kind: EntityKind,
        index_id: IndexId,
        query: &[PropertyPredicate],
    ) -> Result<Option<u64>> {
        self.tx.require_serial("locking index lookup in a parallel context")?;
        let index = self.tx.ctx.store.index(index_id)?;
        let descriptor = index.descriptor();
        if descriptor.entity != kind {
            return Err(SombraError::IndexNotApplicable(format!(
                "index {} covers {} entities, not {}",
                descriptor.name, descriptor.entity, kind
            )));
        }
        if !descriptor.unique {
            return Err(SombraError::IndexNotApplicable(format!(
                "index {} is not unique",
                descriptor.name
            )));
        }
        let token = match descriptor.tokens.as_slice() {
            [token] => *token,
            _ => {
                return Err(SombraError::IndexNotApplicable(format!(
                    "unique lookup on multi-token index {}",
                    descriptor.name
                )))
            }
        };
        let constraints = IndexQueryConstraints::unconstrained();
        descriptor.validate_query(query, &constraints)?;
        if query.len() != descriptor.props.len() || !query.iter().all(PropertyPredicate::is_exact) {
            return Err(SombraError::IndexNotApplicable(format!(
                "unique lookup on {} needs an exact value for every property",
                descriptor.name
            )));
        }

        let key = [index_entry_key(token, query)];
        let locks = &self.tx.locks;
        locks.acquire_shared(ResourceType::IndexEntry, &key)?;
        let found = self.seek_one(cursor, index_id, query)?;
        if found.is_some() {
            trace!(index = %descriptor.name, "unique lookup hit under shared lock");
            return Ok(found);
        }

        locks.release_shared(ResourceType::IndexEntry, &key)?;
        debug!(index = %descriptor.name, entry = key[0], "unique lookup escalating");
        locks.acquire_exclusive(ResourceType::IndexEntry, &key)?;
        let found = self.seek_one(cursor, index_id, query)?;
        if found.is_some() {
            locks.acquire_shared(ResourceType::IndexEntry, &key)?;
            locks.release_exclusive(ResourceType::IndexEntry, &key)?;
            debug!(index = %descriptor.name, "unique entry appeared, downgraded");
        }
        Ok(found)
    }

    fn seek_one<E: EntityCursor>(
        &self,
        cursor: &mut ValueIndexCursor<E>,
        index: IndexId,
        query: &[PropertyPredicate],
    ) -> Result<Option<u64>> {
        self.index_seek(cursor, index, query, IndexQueryConstraints::unconstrained())?;
        if cursor.next()? {
            Ok(cursor.entity_reference())
        } else {
            Ok(None)
        }
    }
}

impl Write<'_> {
    /// Deletes a node and all its edges.
    ///
    /// The node and its neighbours are locked in id order and re-read; if the
    /// neighbourhood moved in between, the locks are dropped and the cycle is
    /// repeated. Returns the number of edges deleted, or `None` when the node
    /// is not visible.
    pub fn node_detach_delete(&self, node: NodeId) -> Result<Option<usize>> {
        self.tx.require_serial("writes in a parallel context")?;
        let ctx = &self.tx.ctx;
        let locks = &self.tx.locks;
        let mut attempts = 0u32;
        let stable = loop {
            let snapshot = detach_snapshot(ctx, node)?;
            if !snapshot.exists {
                return Ok(None);
            }
            let ids = node_ids(&snapshot.nodes);
            locks.acquire_exclusive(ResourceType::Node, &ids)?;
            let reread = detach_snapshot(ctx, node)?;
            match verify_detach(&snapshot, &reread) {
                DetachVerdict::Proceed => break reread,
                DetachVerdict::Retry => {
                    locks.release_exclusive(ResourceType::Node, &ids)?;
                    ctx.metrics.lock_retry();
                    attempts += 1;
                    debug!(node = %node, attempts, "detach snapshot changed, retrying");
                }
            }
        };

        let edge_ids: Vec<u64> = stable.edges.iter().map(|(edge, _)| edge.0).collect();
        locks.acquire_exclusive(ResourceType::Edge, &edge_ids)?;
        let mut state = ctx.tx.write();
        let mut deleted = 0;
        for (edge, ty) in &stable.edges {
            if state.edge_is_deleted(*edge) {
                continue;
            }
            state.edge_delete(*edge, *ty);
            deleted += 1;
        }
        state.node_delete(node, &stable.labels);
        debug!(node = %node, edges = deleted, "node detached and deleted");
        Ok(Some(deleted))
    }

    /// Locks both endpoints of `edge`, then the edge itself, ahead of deleting
    /// it. Returns false when the edge no longer exists.
    pub fn lock_edge_endpoints_for_delete(&self, edge: EdgeId) -> Result<bool> {
        Ok(self.lock_edge_for_delete(edge)?.is_some())
    }

    pub(super) fn lock_edge_for_delete(&self, edge: EdgeId) -> Result<Option<EdgeEnds>> {
        let ctx = &self.tx.ctx;
        let locks = &self.tx.locks;
        loop {
            let Some(ends) = read_edge(ctx, edge)? else {
                return Ok(None);
            };
            let ids = ends.sorted_nodes();
            locks.acquire_exclusive(ResourceType::Node, &ids)?;
            match read_edge(ctx, edge)? {
                Some(reread) if reread == ends => {
                    locks.acquire_exclusive(ResourceType::Edge, &[edge.0])?;
                    return Ok(Some(ends));
                }
                Some(_) => {
                    locks.release_exclusive(ResourceType::Node, &ids)?;
                    ctx.metrics.lock_retry();
                    debug!(edge = %edge, "edge endpoints changed under lock, retrying");
                }
                None => {
                    locks.release_exclusive(ResourceType::Node, &ids)?;
                    return Ok(None);
                }
            }
        }
    }
}
