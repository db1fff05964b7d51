use tracing::trace;

use crate::primitives::concurrency::{LockClient, ResourceType};
use crate::storage::cursor::{Cursor, EdgeScanCursor, NodeCursor, ReadContext};
use crate::storage::store::EdgeSelection;
use crate::types::{EdgeId, LabelId, NodeId, PropId, PropValue, Result, SombraError, TypeId};

use super::KernelTransaction;

/// Tentative writes of one transaction.
///
/// Changes land in transaction state only and are visible to the cursors of
/// the same transaction. Every touched entity is locked exclusively until the
/// transaction closes.
pub struct Write<'t> {
    pub(super) tx: &'t KernelTransaction,
}

struct NodeView {
    labels: Vec<LabelId>,
    degree: u64,
}

fn read_node(ctx: &ReadContext, node: NodeId) -> Result<Option<NodeView>> {
    let mut cursor = NodeCursor::new();
    cursor.single(ctx, node);
    let outcome = match cursor.next() {
        Ok(true) => cursor.degree(EdgeSelection::all()).map(|degree| {
            Some(NodeView {
                labels: cursor.labels().to_vec(),
                degree,
            })
        }),
        Ok(false) => Ok(None),
        Err(err) => Err(err),
    };
    cursor.close();
    outcome
}

fn edge_exists(ctx: &ReadContext, edge: EdgeId) -> Result<bool> {
    let mut cursor = EdgeScanCursor::new();
    cursor.single(ctx, edge);
    let outcome = cursor.next();
    cursor.close();
    outcome
}

impl<'t> Write<'t> {
    pub(super) fn new(tx: &'t KernelTransaction) -> Self {
        Self { tx }
    }

    fn ctx(&self) -> &ReadContext {
        &self.tx.ctx
    }

    fn serial(&self) -> Result<()> {
        self.tx.require_serial("writes in a parallel context")
    }

    fn lock_node(&self, node: NodeId) -> Result<NodeView> {
        self.tx.locks.acquire_exclusive(ResourceType::Node, &[node.0])?;
        read_node(self.ctx(), node)?.ok_or(SombraError::NotFound)
    }

    /// Creates a node carrying `labels`.
    pub fn node_create(&self, labels: &[LabelId]) -> Result<NodeId> {
        self.serial()?;
        let node = self.ctx().store.reserve_node_id();
        self.tx.locks.acquire_exclusive(ResourceType::Node, &[node.0])?;
        let mut state = self.ctx().tx.write();
        state.node_create(node);
        for label in labels {
            state.node_add_label(node, *label);
        }
        trace!(node = %node, labels = labels.len(), "write.node_create");
        Ok(node)
    }

    /// Deletes a node without edges. Returns false when it is not visible.
    pub fn node_delete(&self, node: NodeId) -> Result<bool> {
        self.serial()?;
        self.tx.locks.acquire_exclusive(ResourceType::Node, &[node.0])?;
        let Some(view) = read_node(self.ctx(), node)? else {
            return Ok(false);
        };
        if view.degree > 0 {
            return Err(SombraError::Invalid("node still has edges"));
        }
        self.ctx().tx.write().node_delete(node, &view.labels);
        Ok(true)
    }

    /// Adds `label` to a node. Returns false when it already carried it.
    pub fn node_add_label(&self, node: NodeId, label: LabelId) -> Result<bool> {
        self.serial()?;
        let view = self.lock_node(node)?;
        if view.labels.binary_search(&label).is_ok() {
            return Ok(false);
        }
        self.ctx().tx.write().node_add_label(node, label);
        Ok(true)
    }

    /// Removes `label` from a node. Returns false when it did not carry it.
    pub fn node_remove_label(&self, node: NodeId, label: LabelId) -> Result<bool> {
        self.serial()?;
        let view = self.lock_node(node)?;
        if view.labels.binary_search(&label).is_err() {
            return Ok(false);
        }
        self.ctx().tx.write().node_remove_label(node, label);
        Ok(true)
    }

    /// Sets a node property. `Null` is rejected; use
    /// [`Write::node_remove_property`].
    pub fn node_set_property(&self, node: NodeId, prop: PropId, value: PropValue) -> Result<()> {
        self.serial()?;
        if value.is_null() {
            return Err(SombraError::Invalid("null property value"));
        }
        self.lock_node(node)?;
        self.ctx().tx.write().node_set_property(node, prop, value);
        Ok(())
    }

    /// Removes a node property.
    pub fn node_remove_property(&self, node: NodeId, prop: PropId) -> Result<()> {
        self.serial()?;
        self.lock_node(node)?;
        self.ctx().tx.write().node_remove_property(node, prop);
        Ok(())
    }

    /// Creates an edge `src -[ty]-> dst`; both endpoints must be visible.
    pub fn edge_create(&self, src: NodeId, ty: TypeId, dst: NodeId) -> Result<EdgeId> {
        self.serial()?;
        let mut ids = vec![src.0, dst.0];
        ids.sort_unstable();
        ids.dedup();
        self.tx.locks.acquire_exclusive(ResourceType::Node, &ids)?;
        for node in [src, dst] {
            if read_node(self.ctx(), node)?.is_none() {
                return Err(SombraError::NotFound);
            }
        }
        let edge = self.ctx().store.reserve_edge_id();
        self.tx.locks.acquire_exclusive(ResourceType::Edge, &[edge.0])?;
        self.ctx().tx.write().edge_create(edge, src, ty, dst);
        trace!(edge = %edge, src = %src, dst = %dst, "write.edge_create");
        Ok(edge)
    }

    /// Deletes an edge after locking its endpoints. Returns false when it is
    /// not visible.
    pub fn edge_delete(&self, edge: EdgeId) -> Result<bool> {
        self.serial()?;
        let Some(ends) = self.lock_edge_for_delete(edge)? else {
            return Ok(false);
        };
        self.ctx().tx.write().edge_delete(edge, ends.ty);
        Ok(true)
    }

    /// Sets an edge property.
    pub fn edge_set_property(&self, edge: EdgeId, prop: PropId, value: PropValue) -> Result<()> {
        self.serial()?;
        if value.is_null() {
            return Err(SombraError::Invalid("null property value"));
        }
        self.tx.locks.acquire_exclusive(ResourceType::Edge, &[edge.0])?;
        if !edge_exists(self.ctx(), edge)? {
            return Err(SombraError::NotFound);
        }
        self.ctx().tx.write().edge_set_property(edge, prop, value);
        Ok(())
    }
}
