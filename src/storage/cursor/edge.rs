use std::collections::BTreeSet;
use std::sync::Arc;

use smallvec::{smallvec, SmallVec};

use crate::storage::index::TokenIndex;
use crate::storage::security::AccessMode;
use crate::storage::store::{EdgeRecord, GraphStore, StoreEdgeCursor};
use crate::storage::txstate::{AddedEdge, DiffSnapshot, TxState};
use crate::types::{EdgeId, EntityKind, NodeId, PropId, PropRecId, Result, SombraError, TypeId};

use super::pool::LeakToken;
use super::{
    AddedIds, Cursor, EntityCursor, Lifecycle, PropertyCursor, ReadContext, ReadTracer, RemovedIds,
};

/// Endpoints, type and property head of the edge a cursor sits on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EdgePosition {
    pub(crate) id: Option<EdgeId>,
    pub(crate) src: NodeId,
    pub(crate) dst: NodeId,
    pub(crate) ty: TypeId,
    pub(crate) first_prop: Option<PropRecId>,
    pub(crate) added_in_tx: bool,
}

impl Default for EdgePosition {
    fn default() -> Self {
        Self {
            id: None,
            src: NodeId(0),
            dst: NodeId(0),
            ty: TypeId(0),
            first_prop: None,
            added_in_tx: false,
        }
    }
}

impl EdgePosition {
    pub(crate) fn from_record(id: u64, record: &EdgeRecord) -> Self {
        Self {
            id: Some(EdgeId(id)),
            src: record.src,
            dst: record.dst,
            ty: record.ty,
            first_prop: record.first_prop,
            added_in_tx: false,
        }
    }

    pub(crate) fn from_added(id: u64, added: AddedEdge) -> Self {
        Self {
            id: Some(EdgeId(id)),
            src: added.src,
            dst: added.dst,
            ty: added.ty,
            first_prop: None,
            added_in_tx: true,
        }
    }

    pub(crate) fn visible(&self, ctx: &ReadContext) -> bool {
        let edge = match self.id {
            Some(edge) => edge,
            None => return false,
        };
        if ctx.access.allows_traverse_edge(edge, self.ty) {
            return true;
        }
        ctx.metrics.security_rejection();
        false
    }

    pub(crate) fn load_properties(&self, ctx: &ReadContext, props: &mut PropertyCursor) -> Result<()> {
        let edge = self
            .id
            .ok_or(SombraError::Usage("edge cursor is not positioned"))?;
        props.init_edge(ctx, edge, self.ty, self.first_prop);
        Ok(())
    }
}

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

/// Edges visible to a transaction, independent of their endpoints.
#[derive(Default)]
pub struct EdgeScanCursor {
    ctx: Option<ReadContext>,
    lifecycle: Lifecycle,
    store: StoreEdgeCursor,
    source: Source,
    prepared: bool,
    added: AddedIds,
    removed: RemovedIds,
    position: EdgePosition,
    tracer: Option<Arc<dyn ReadTracer>>,
    leak: Option<LeakToken>,
}

impl EdgeScanCursor {
    /// Creates an unpositioned cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions before the first edge of a full scan.
    pub fn scan(&mut self, ctx: &ReadContext) {
        self.begin(ctx, Source::All);
    }

    /// Positions on exactly one edge.
    pub fn single(&mut self, ctx: &ReadContext, edge: EdgeId) {
        self.begin(ctx, Source::Single(edge.0));
    }

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
            self.leak = ctx.leaks.register("edge_scan");
        }
        self.ctx = Some(ctx.clone());
        self.lifecycle = Lifecycle::Active;
        self.source = source;
        self.prepared = false;
        self.added = AddedIds::None;
        self.removed = RemovedIds::default();
        self.position = EdgePosition::default();
    }

    fn prepare(&mut self, ctx: &ReadContext) {
        self.prepared = true;
        let tx = ctx.tx.read();
        match self.source {
            Source::All => {
                if tx.has_changes() {
                    let diff = tx.edge_diff();
                    self.added = AddedIds::from_set(diff.added());
                    self.removed = RemovedIds::from_snapshot(&diff);
                }
                self.store.scan(ctx.store.edges());
            }
            Source::Single(id) => {
                if tx.edge_is_deleted(EdgeId(id)) {
                    self.store.close();
                } else if tx.edge_is_added(EdgeId(id)) {
                    self.added = AddedIds::One(id);
                    self.store.close();
                } else {
                    self.store.single(ctx.store.edges(), id);
                }
            }
            Source::Stable(id) => {
                if tx.edge_is_added(EdgeId(id)) {
                    self.added = AddedIds::One(id);
                    self.store.close();
                } else {
                    self.store.single(ctx.store.edges(), id);
                }
            }
            Source::Range { start, end } => {
                self.store.scan_range(ctx.store.edges(), start, end);
            }
        }
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

    /// Whether the current edge was created in this transaction.
    pub fn is_added_in_tx(&self) -> bool {
        self.position.added_in_tx
    }

    /// Points `props` at the properties of the current edge.
    pub fn properties(&self, props: &mut PropertyCursor) -> Result<()> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or(SombraError::Usage("edge cursor is not positioned"))?;
        self.position.load_properties(ctx, props)
    }
}

impl Cursor for EdgeScanCursor {
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
                let added = ctx.tx.read().added_edge(EdgeId(id));
                // Deleted again after the snapshot; nothing left to describe it.
                let added = match added {
                    Some(added) => added,
                    None => continue,
                };
                self.position = EdgePosition::from_added(id, added);
                if self.position.visible(&ctx) {
                    ctx.metrics.overlay_hit();
                    return Ok(self.produce());
                }
                continue;
            }
            if !self.store.next() {
                self.position = EdgePosition::default();
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
            self.position = EdgePosition::from_record(id, self.store.record());
            if self.position.visible(&ctx) {
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

impl EntityCursor for EdgeScanCursor {
    const KIND: EntityKind = EntityKind::Edge;

    fn seek(&mut self, ctx: &ReadContext, id: u64) {
        self.single(ctx, EdgeId(id));
    }

    fn seek_stable(&mut self, ctx: &ReadContext, id: u64) {
        self.begin(ctx, Source::Stable(id));
    }

    fn reference(&self) -> Option<u64> {
        self.position.id.map(|edge| edge.0)
    }

    fn tokens(&self) -> SmallVec<[u32; 4]> {
        match self.position.id {
            Some(_) => smallvec![self.position.ty.0],
            None => SmallVec::new(),
        }
    }

    fn load_properties(&self, props: &mut PropertyCursor) -> Result<()> {
        self.properties(props)
    }

    fn can_read_property(&self, access: &dyn AccessMode, prop: PropId) -> bool {
        access.allows_read_edge_property(self.position.ty, prop)
    }

    fn token_index(store: &GraphStore) -> &Arc<TokenIndex> {
        store.type_index()
    }

    fn token_diff(tx: &TxState, token: u32) -> DiffSnapshot<u64> {
        tx.type_diff(TypeId(token))
    }

    fn traverse_all_with_token(access: &dyn AccessMode, token: u32) -> bool {
        access.allows_traverse_all_of_type(TypeId(token))
    }

    fn touched(tx: &TxState) -> BTreeSet<u64> {
        tx.touched_edges()
    }
}
