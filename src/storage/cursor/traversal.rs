use std::sync::Arc;

use crate::storage::store::{EdgeRef, EdgeSelection, StoreEdgeTraversal};
use crate::types::{EdgeId, NodeId, Result, SombraError, TypeId};

use super::edge::EdgePosition;
use super::pool::LeakToken;
use super::{Cursor, Lifecycle, PropertyCursor, ReadContext, ReadTracer, RemovedIds};

/// Edges of one node: edges the transaction created first, then the committed
/// chain minus edges the transaction deleted.
pub struct EdgeTraversalCursor {
    ctx: Option<ReadContext>,
    lifecycle: Lifecycle,
    store: StoreEdgeTraversal,
    node: NodeId,
    start: EdgeRef,
    selection: EdgeSelection,
    node_added: bool,
    prepared: bool,
    added: Vec<EdgePosition>,
    added_pos: usize,
    removed: RemovedIds,
    position: EdgePosition,
    tracer: Option<Arc<dyn ReadTracer>>,
    leak: Option<LeakToken>,
}

impl Default for EdgeTraversalCursor {
    fn default() -> Self {
        Self {
            ctx: None,
            lifecycle: Lifecycle::Fresh,
            store: StoreEdgeTraversal::default(),
            node: NodeId(0),
            start: EdgeRef::None,
            selection: EdgeSelection::all(),
            node_added: false,
            prepared: false,
            added: Vec::new(),
            added_pos: 0,
            removed: RemovedIds::default(),
            position: EdgePosition::default(),
            tracer: None,
            leak: None,
        }
    }
}

impl EdgeTraversalCursor {
    /// Creates an unpositioned cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions before the first edge of `node` matching `selection`.
    ///
    /// `start` is the committed chain head; `node_added` marks a node created in
    /// the transaction, which has no committed edges.
    pub fn init(
        &mut self,
        ctx: &ReadContext,
        node: NodeId,
        start: EdgeRef,
        selection: EdgeSelection,
        node_added: bool,
    ) {
        if self.leak.is_none() {
            self.leak = ctx.leaks.register("edge_traversal");
        }
        self.ctx = Some(ctx.clone());
        self.lifecycle = Lifecycle::Active;
        self.node = node;
        self.start = start;
        self.selection = selection;
        self.node_added = node_added;
        self.prepared = false;
        self.added.clear();
        self.added_pos = 0;
        self.removed = RemovedIds::default();
        self.position = EdgePosition::default();
    }

    fn prepare(&mut self, ctx: &ReadContext) {
        self.prepared = true;
        {
            let tx = ctx.tx.read();
            if tx.has_changes() {
                if let Some(state) = tx.node_state(self.node) {
                    for edge in &state.added_edges {
                        let added = match tx.added_edge(*edge) {
                            Some(added) => added,
                            None => continue,
                        };
                        if self.selection.accepts_type(added.ty)
                            && self
                                .selection
                                .accepts_direction(self.node.0, added.src.0, added.dst.0)
                        {
                            self.added.push(EdgePosition::from_added(edge.0, added));
                        }
                    }
                }
                self.removed = RemovedIds::from_snapshot(&tx.edge_diff());
            }
        }
        let start = if self.node_added { EdgeRef::None } else { self.start };
        self.store.init(
            ctx.store.edges(),
            ctx.store.groups(),
            self.node,
            start,
            self.selection.clone(),
        );
    }

    fn produce(&self) -> bool {
        if let (Some(tracer), Some(edge)) = (&self.tracer, self.position.id) {
            tracer.on_edge(edge);
        }
        true
    }

    /// Current edge.
    pub fn edge_reference(&self) -> Option<EdgeId> {
        self.position.id
    }

    /// Type of the current edge.
    pub fn edge_type(&self) -> TypeId {
        self.position.ty
    }

    /// Source node of the current edge.
    pub fn source(&self) -> NodeId {
        self.position.src
    }

    /// Target node of the current edge.
    pub fn target(&self) -> NodeId {
        self.position.dst
    }

    /// Node the traversal started from.
    pub fn origin(&self) -> NodeId {
        self.node
    }

    /// Endpoint of the current edge opposite to the origin.
    pub fn other_node(&self) -> NodeId {
        if self.position.src == self.node {
            self.position.dst
        } else {
            self.position.src
        }
    }

    /// Whether the current edge was created in this transaction.
    pub fn is_added_in_tx(&self) -> bool {
        self.position.added_in_tx
    }

    /// Points `props` at the properties of the current edge.
    pub fn properties(&self, props: &mut PropertyCursor) -> Result<()> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or(SombraError::Usage("edge traversal is not positioned"))?;
        self.position.load_properties(ctx, props)
    }
}

impl Cursor for EdgeTraversalCursor {
    fn next(&mut self) -> Result<bool> {
        if !self.lifecycle.check_advance()? {
            return Ok(false);
        }
        let ctx = match &self.ctx {
            Some(ctx) => ctx.clone(),
            None => return Ok(false),
        };
        if !self.prepared {
            self.prepare(&ctx);
        }
        while self.added_pos < self.added.len() {
            self.position = self.added[self.added_pos];
            self.added_pos += 1;
            if self.position.visible(&ctx) {
                ctx.metrics.overlay_hit();
                return Ok(self.produce());
            }
        }
        while self.store.next()? {
            let id = match self.store.edge() {
                Some(id) => id,
                None => continue,
            };
            if self.removed.contains(id.0) {
                continue;
            }
            self.position = EdgePosition::from_record(id.0, self.store.record());
            if self.position.visible(&ctx) {
                return Ok(self.produce());
            }
        }
        self.position = EdgePosition::default();
        self.lifecycle = Lifecycle::Exhausted;
        Ok(false)
    }

    fn close(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        self.store.close();
        self.ctx = None;
        self.added.clear();
        self.removed = RemovedIds::default();
        self.position = EdgePosition::default();
        self.lifecycle = Lifecycle::Closed;
        if let Some(token) = self.leak.take() {
            token.release();
        }
    }

    fn is_closed(&self) -> bool {
        self.lifecycle == Lifecycle::Closed
    }

    fn set_tracer(&mut self, tracer: Option<Arc<dyn ReadTracer>>) {
        self.tracer = tracer;
    }
}
