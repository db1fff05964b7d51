use std::collections::BTreeSet;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::storage::security::AccessMode;
use crate::storage::store::{EdgeRef, EdgeSelection, GraphStore, StoreGroupCursor, StoreNodeCursor};
use crate::storage::index::TokenIndex;
use crate::storage::txstate::{DiffSnapshot, TxState};
use crate::types::{EntityKind, LabelId, NodeId, PropId, PropRecId, Result, SombraError, TypeId};

use super::pool::LeakToken;
use super::{
    AddedIds, Cursor, EdgeTraversalCursor, EntityCursor, Lifecycle, PropertyCursor, ReadContext,
    ReadTracer, RemovedIds,
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Source {
    #[default]
    All,
    Single(u64),
    Stable(u64),
    Range {
        start: u64,
        end: u64,
    },
}

/// Nodes visible to a transaction.
///
/// A full scan serves nodes created in the transaction first, then committed
/// nodes minus those the transaction deleted. Transaction state is frozen at the
/// first `next`, so later writes in the same transaction do not change what an
/// open scan yields.
#[derive(Default)]
pub struct NodeCursor {
    ctx: Option<ReadContext>,
    lifecycle: Lifecycle,
    store: StoreNodeCursor,
    source: Source,
    prepared: bool,
    tx_aware: bool,
    traverse_all: bool,
    added: AddedIds,
    removed: RemovedIds,
    current: Option<NodeId>,
    labels: SmallVec<[LabelId; 4]>,
    first_prop: Option<PropRecId>,
    edges: EdgeRef,
    added_in_tx: bool,
    tracer: Option<Arc<dyn ReadTracer>>,
    leak: Option<LeakToken>,
}

impl NodeCursor {
    /// Creates an unpositioned cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions before the first node of a full scan.
    pub fn scan(&mut self, ctx: &ReadContext) {
        self.begin(ctx, Source::All);
        if let Some(tracer) = &self.tracer {
            tracer.on_all_nodes_scan();
        }
    }

    /// Positions on exactly one node.
    pub fn single(&mut self, ctx: &ReadContext, node: NodeId) {
        self.begin(ctx, Source::Single(node.0));
    }

    /// Positions before a committed id range plus an explicit overlay slice.
    pub(crate) fn scan_range(
        &mut self,
        ctx: &ReadContext,
        start: u64,
        end: u64,
        added: AddedIds,
        removed: RemovedIds,
    ) {
        self.begin(ctx, Source::Range { start, end });
        self.added = added;
        self.removed = removed;
    }

    fn begin(&mut self, ctx: &ReadContext, source: Source) {
        if self.leak.is_none() {
            self.leak = ctx.leaks.register("node");
        }
        self.ctx = Some(ctx.clone());
        self.lifecycle = Lifecycle::Active;
        self.source = source;
        self.prepared = false;
        self.added = AddedIds::None;
        self.removed = RemovedIds::default();
        self.clear_current();
    }

    fn clear_current(&mut self) {
        self.current = None;
        self.labels.clear();
        self.first_prop = None;
        self.edges = EdgeRef::None;
        self.added_in_tx = false;
    }

    fn prepare(&mut self, ctx: &ReadContext) {
        self.prepared = true;
        self.traverse_all = ctx.access.allows_traverse_all_nodes();
        let tx = ctx.tx.read();
        self.tx_aware = tx.has_changes();
        match self.source {
            Source::All => {
                if self.tx_aware {
                    let diff = tx.node_diff();
                    self.added = AddedIds::from_set(diff.added());
                    self.removed = RemovedIds::from_snapshot(&diff);
                }
                self.store.scan(ctx.store.nodes());
            }
            Source::Single(id) => {
                if tx.node_is_deleted(NodeId(id)) {
                    self.store.close();
                } else if tx.node_is_added(NodeId(id)) {
                    self.added = AddedIds::One(id);
                    self.store.close();
                } else {
                    self.store.single(ctx.store.nodes(), id);
                }
            }
            Source::Stable(id) => {
                if tx.node_is_added(NodeId(id)) {
                    self.added = AddedIds::One(id);
                    self.store.close();
                } else {
                    self.store.single(ctx.store.nodes(), id);
                }
            }
            Source::Range { start, end } => {
                self.store.scan_range(ctx.store.nodes(), start, end);
            }
        }
    }

    fn load_added(&mut self, ctx: &ReadContext, id: u64) {
        self.clear_current();
        self.current = Some(NodeId(id));
        self.added_in_tx = true;
        let tx = ctx.tx.read();
        if let Some(state) = tx.node_state(NodeId(id)) {
            self.labels.extend(state.labels.added().iter().copied());
        }
    }

    fn load_store(&mut self, ctx: &ReadContext, id: u64) {
        let record = self.store.record();
        self.current = Some(NodeId(id));
        self.first_prop = record.first_prop;
        self.edges = record.edges;
        self.added_in_tx = false;
        self.labels.clear();
        if self.tx_aware {
            let tx = ctx.tx.read();
            if let Some(state) = tx.node_state(NodeId(id)) {
                self.labels
                    .extend(state.labels.apply_to(record.labels.iter().copied()));
                return;
            }
        }
        self.labels.extend(record.labels.iter().copied());
    }

    fn visible(&self, ctx: &ReadContext) -> bool {
        let node = match self.current {
            Some(node) => node,
            None => return false,
        };
        if self.traverse_all || ctx.access.allows_traverse_node(node, &self.labels) {
            return true;
        }
        ctx.metrics.security_rejection();
        false
    }

    fn produce(&self) -> bool {
        if let (Some(tracer), Some(node)) = (&self.tracer, self.current) {
            tracer.on_node(node);
        }
        true
    }

    fn positioned(&self) -> Result<(&ReadContext, NodeId)> {
        match (&self.ctx, self.current) {
            (Some(ctx), Some(node)) => Ok((ctx, node)),
            _ => Err(SombraError::Usage("node cursor is not positioned")),
        }
    }

    /// Current node.
    pub fn node_reference(&self) -> Option<NodeId> {
        self.current
    }

    /// Labels of the current node as the transaction sees them, ascending.
    pub fn labels(&self) -> &[LabelId] {
        &self.labels
    }

    /// Whether the current node carries `label`.
    pub fn has_label(&self, label: LabelId) -> bool {
        self.labels.binary_search(&label).is_ok()
    }

    /// Whether the current node was created in this transaction.
    pub fn is_added_in_tx(&self) -> bool {
        self.added_in_tx
    }

    /// Points `props` at the properties of the current node.
    pub fn properties(&self, props: &mut PropertyCursor) -> Result<()> {
        let (ctx, node) = self.positioned()?;
        props.init_node(ctx, node, &self.labels, self.first_prop);
        Ok(())
    }

    /// Points `traversal` at the edges of the current node.
    pub fn edges(&self, traversal: &mut EdgeTraversalCursor, selection: EdgeSelection) -> Result<()> {
        let (ctx, node) = self.positioned()?;
        traversal.init(ctx, node, self.edges, selection, self.added_in_tx);
        Ok(())
    }

    /// Number of edges of the current node matching `selection`.
    pub fn degree(&self, selection: EdgeSelection) -> Result<u64> {
        let mut traversal = EdgeTraversalCursor::new();
        self.edges(&mut traversal, selection)?;
        let mut count = 0;
        let outcome = loop {
            match traversal.next() {
                Ok(true) => count += 1,
                Ok(false) => break Ok(count),
                Err(err) => break Err(err),
            }
        };
        traversal.close();
        outcome
    }

    /// Distinct types of the edges of the current node, ascending.
    pub fn edge_types(&self) -> Result<Vec<TypeId>> {
        let (ctx, node) = self.positioned()?;
        let clean = !self.tx_aware || ctx.tx.read().node_state(node).is_none();
        if clean && matches!(self.edges, EdgeRef::Group(_)) {
            // Committed dense node: one group per type, empty groups skipped.
            let mut groups = StoreGroupCursor::default();
            groups.init(ctx.store.groups(), node, self.edges);
            let mut types = Vec::new();
            let outcome = loop {
                match groups.next() {
                    Ok(true) => {
                        let group = groups.record();
                        let ty = group.ty;
                        let used = group.first_out.is_some()
                            || group.first_in.is_some()
                            || group.first_loop.is_some();
                        if !used {
                            continue;
                        }
                        if ctx.access.allows_traverse_all_of_type(ty) {
                            types.push(ty);
                            continue;
                        }
                        match self.any_visible_of_type(ty) {
                            Ok(true) => types.push(ty),
                            Ok(false) => {}
                            Err(err) => break Err(err),
                        }
                    }
                    Ok(false) => break Ok(types),
                    Err(err) => break Err(err),
                }
            };
            groups.close();
            return outcome;
        }
        let mut traversal = EdgeTraversalCursor::new();
        self.edges(&mut traversal, EdgeSelection::all())?;
        let mut types = BTreeSet::new();
        let outcome = loop {
            match traversal.next() {
                Ok(true) => {
                    types.insert(traversal.edge_type());
                }
                Ok(false) => break Ok(types.into_iter().collect()),
                Err(err) => break Err(err),
            }
        };
        traversal.close();
        outcome
    }

    fn any_visible_of_type(&self, ty: TypeId) -> Result<bool> {
        let mut traversal = EdgeTraversalCursor::new();
        self.edges(&mut traversal, EdgeSelection::all().with_types(&[ty]))?;
        let found = traversal.next();
        traversal.close();
        found
    }
}

impl Cursor for NodeCursor {
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
        loop {
            if let Some(id) = self.added.next_id() {
                self.load_added(&ctx, id);
                if self.visible(&ctx) {
                    ctx.metrics.overlay_hit();
                    return Ok(self.produce());
                }
                continue;
            }
            if !self.store.next() {
                self.clear_current();
                self.lifecycle = Lifecycle::Exhausted;
                return Ok(false);
            }
            let id = match self.store.entity() {
                Some(id) => id,
                None => continue,
            };
            if self.removed.contains(id) {
                continue;
            }
            self.load_store(&ctx, id);
            if self.visible(&ctx) {
                return Ok(self.produce());
            }
        }
    }

    fn close(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        self.store.close();
        self.ctx = None;
        self.added = AddedIds::None;
        self.removed = RemovedIds::default();
        self.clear_current();
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

impl EntityCursor for NodeCursor {
    const KIND: EntityKind = EntityKind::Node;

    fn seek(&mut self, ctx: &ReadContext, id: u64) {
        self.single(ctx, NodeId(id));
    }

    fn seek_stable(&mut self, ctx: &ReadContext, id: u64) {
        self.begin(ctx, Source::Stable(id));
    }

    fn reference(&self) -> Option<u64> {
        self.current.map(|node| node.0)
    }

    fn tokens(&self) -> SmallVec<[u32; 4]> {
        self.labels.iter().map(|label| label.0).collect()
    }

    fn load_properties(&self, props: &mut PropertyCursor) -> Result<()> {
        self.properties(props)
    }

    fn can_read_property(&self, access: &dyn AccessMode, prop: PropId) -> bool {
        access.allows_read_node_property(&self.labels, prop)
    }

    fn token_index(store: &GraphStore) -> &Arc<TokenIndex> {
        store.label_index()
    }

    fn token_diff(tx: &TxState, token: u32) -> DiffSnapshot<u64> {
        tx.label_diff(LabelId(token))
    }

    fn traverse_all_with_token(access: &dyn AccessMode, token: u32) -> bool {
        access.allows_traverse_all_with_label(LabelId(token))
    }

    fn touched(tx: &TxState) -> BTreeSet<u64> {
        tx.touched_nodes()
    }
}
