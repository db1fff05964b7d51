use std::sync::Arc;

use tracing::trace;

use crate::storage::index::{EntityStream, IndexOrder, TokenStream};
use crate::types::{EdgeId, EntityKind, LabelId, NodeId, Result, SombraError, TypeId};

use super::merge::PrimitiveSortedMergeJoin;
use super::pool::LeakToken;
use super::{
    AddedIds, Cursor, EdgeScanCursor, EntityCursor, Lifecycle, NodeCursor, ReadContext,
    ReadTracer, RemovedIds,
};

/// Scan over every entity carrying one token (a node label or an edge type),
/// merged with the transaction's token changes.
///
/// Unordered scans serve entities that gained the token in the transaction
/// first, then committed members minus those that lost it. Ordered scans merge
/// both sides by id. When the access mode grants the whole token, per-entity
/// visibility checks are skipped for the rest of the scan.
pub struct TokenIndexCursor<E: EntityCursor> {
    ctx: Option<ReadContext>,
    lifecycle: Lifecycle,
    token: u32,
    order: IndexOrder,
    range: Option<(u64, Option<u64>)>,
    prepared: bool,
    stream: Option<TokenStream>,
    added: AddedIds,
    ordered_added: Vec<u64>,
    ordered_pos: usize,
    removed: RemovedIds,
    join: PrimitiveSortedMergeJoin,
    traverse_all: bool,
    entity: E,
    loaded: bool,
    current: Option<u64>,
    tracer: Option<Arc<dyn ReadTracer>>,
    leak: Option<LeakToken>,
}

/// Node label scan.
pub type NodeLabelIndexCursor = TokenIndexCursor<NodeCursor>;
/// Edge type scan.
pub type EdgeTypeIndexCursor = TokenIndexCursor<EdgeScanCursor>;

impl<E: EntityCursor> Default for TokenIndexCursor<E> {
    fn default() -> Self {
        Self {
            ctx: None,
            lifecycle: Lifecycle::Fresh,
            token: 0,
            order: IndexOrder::None,
            range: None,
            prepared: false,
            stream: None,
            added: AddedIds::None,
            ordered_added: Vec::new(),
            ordered_pos: 0,
            removed: RemovedIds::default(),
            join: PrimitiveSortedMergeJoin::new(IndexOrder::None),
            traverse_all: false,
            entity: E::default(),
            loaded: false,
            current: None,
            tracer: None,
            leak: None,
        }
    }
}

impl<E: EntityCursor> TokenIndexCursor<E> {
    /// Creates an unpositioned cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions before the first entity carrying `token`, in `order`.
    pub fn scan(&mut self, ctx: &ReadContext, token: u32, order: IndexOrder) {
        self.begin(ctx, token, order, None);
    }

    /// Positions before the committed members of `token` with ids in
    /// `[start, end)`; used by partitioned scans, which carry no overlay.
    pub(crate) fn scan_range(&mut self, ctx: &ReadContext, token: u32, start: u64, end: Option<u64>) {
        self.begin(ctx, token, IndexOrder::None, Some((start, end)));
    }

    fn begin(&mut self, ctx: &ReadContext, token: u32, order: IndexOrder, range: Option<(u64, Option<u64>)>) {
        if self.leak.is_none() {
            self.leak = ctx.leaks.register("token_index");
        }
        self.release_scan();
        self.ctx = Some(ctx.clone());
        self.lifecycle = Lifecycle::Active;
        self.token = token;
        self.order = order;
        self.range = range;
        self.prepared = false;
        // Computed once per scan.
        self.traverse_all = E::traverse_all_with_token(ctx.access(), token);
        if let Some(tracer) = &self.tracer {
            match E::KIND {
                EntityKind::Node => tracer.on_label_scan(LabelId(token)),
                EntityKind::Edge => tracer.on_type_scan(TypeId(token)),
            }
        }
    }

    fn release_scan(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.added = AddedIds::None;
        self.ordered_added.clear();
        self.ordered_pos = 0;
        self.removed = RemovedIds::default();
        self.current = None;
        self.loaded = false;
    }

    fn prepare(&mut self, ctx: &ReadContext) {
        self.prepared = true;
        let index = E::token_index(&ctx.store);
        let (start, end) = self.range.unwrap_or((0, None));
        self.stream = Some(index.stream(self.token, self.order, start, end));
        if self.range.is_none() {
            let tx = ctx.tx.read();
            if tx.has_changes() {
                let diff = E::token_diff(&tx, self.token);
                self.removed = RemovedIds::from_snapshot(&diff);
                if self.order.is_ordered() {
                    self.ordered_added.extend(diff.added().iter().copied());
                    if matches!(self.order, IndexOrder::Descending) {
                        self.ordered_added.reverse();
                    }
                } else {
                    self.added = AddedIds::from_set(diff.added());
                }
            }
        }
        self.join.initialize(self.order);
        trace!(
            kind = %E::KIND,
            token = self.token,
            order = ?self.order,
            shortcut = self.traverse_all,
            "token_index.scan"
        );
    }

    /// Positions on `id` if the caller may see it.
    fn accept(&mut self, ctx: &ReadContext, id: u64) -> Result<bool> {
        if self.traverse_all {
            self.current = Some(id);
            self.loaded = false;
            return Ok(true);
        }
        self.entity.seek_stable(ctx, id);
        if self.entity.next()? {
            self.current = Some(id);
            self.loaded = true;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn next_store(&mut self) -> Result<Option<u64>> {
        let stream = match &mut self.stream {
            Some(stream) => stream,
            None => return Ok(None),
        };
        while let Some(id) = stream.next_entity()? {
            if !self.removed.contains(id) {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    fn next_unordered(&mut self, ctx: &ReadContext) -> Result<bool> {
        while let Some(id) = self.added.next_id() {
            if self.accept(ctx, id)? {
                ctx.metrics.overlay_hit();
                return Ok(true);
            }
        }
        while let Some(id) = self.next_store()? {
            if self.accept(ctx, id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn next_ordered(&mut self, ctx: &ReadContext) -> Result<bool> {
        loop {
            if self.join.needs_store() {
                let id = self.next_store()?;
                self.join.set_store(id);
            }
            if self.join.needs_added() {
                let id = self.ordered_added.get(self.ordered_pos).copied();
                self.ordered_pos += 1;
                self.join.set_added(id);
            }
            let (id, _) = match self.join.next() {
                Some(hit) => hit,
                None => return Ok(false),
            };
            if self.accept(ctx, id)? {
                return Ok(true);
            }
        }
    }

    /// Current entity id.
    pub fn entity_reference(&self) -> Option<u64> {
        self.current
    }

    /// Entity cursor positioned on the current hit, for labels, endpoints and
    /// properties.
    pub fn entity(&mut self) -> Result<&E> {
        let id = self
            .current
            .ok_or(SombraError::Usage("token index cursor is not positioned"))?;
        if !self.loaded {
            let ctx = self
                .ctx
                .as_ref()
                .ok_or(SombraError::Usage("token index cursor is not positioned"))?;
            self.entity.seek_stable(ctx, id);
            if !self.entity.next()? {
                return Err(SombraError::Usage("token index hit vanished"));
            }
            self.loaded = true;
        }
        Ok(&self.entity)
    }

    /// Token being scanned.
    pub fn token(&self) -> u32 {
        self.token
    }

    /// Whether the scan skips per-entity visibility checks.
    pub fn uses_token_shortcut(&self) -> bool {
        self.traverse_all
    }
}

impl TokenIndexCursor<NodeCursor> {
    /// Current node.
    pub fn node_reference(&self) -> Option<NodeId> {
        self.current.map(NodeId)
    }
}

impl TokenIndexCursor<EdgeScanCursor> {
    /// Current edge.
    pub fn edge_reference(&self) -> Option<EdgeId> {
        self.current.map(EdgeId)
    }

    /// Source node of the current edge.
    pub fn source(&mut self) -> Result<NodeId> {
        Ok(self.entity()?.source())
    }

    /// Target node of the current edge.
    pub fn target(&mut self) -> Result<NodeId> {
        Ok(self.entity()?.target())
    }
}

impl<E: EntityCursor> Cursor for TokenIndexCursor<E> {
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
        let found = if self.order.is_ordered() {
            self.next_ordered(&ctx)?
        } else {
            self.next_unordered(&ctx)?
        };
        if !found {
            self.current = None;
            self.loaded = false;
            self.lifecycle = Lifecycle::Exhausted;
            return Ok(false);
        }
        if let (Some(tracer), Some(id)) = (&self.tracer, self.current) {
            match E::KIND {
                EntityKind::Node => tracer.on_node(NodeId(id)),
                EntityKind::Edge => tracer.on_edge(EdgeId(id)),
            }
        }
        Ok(true)
    }

    fn close(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        self.release_scan();
        self.entity.close();
        self.ctx = None;
        self.traverse_all = false;
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
