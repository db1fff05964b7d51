use std::sync::Arc;

use smallvec::SmallVec;

use crate::storage::store::StorePropertyCursor;
use crate::types::{EdgeId, LabelId, NodeId, PropId, PropRecId, PropValue, Result, TypeId};

use super::pool::LeakToken;
use super::{Cursor, Lifecycle, ReadContext, ReadTracer};

#[derive(Clone, Debug, Default)]
enum Owner {
    #[default]
    None,
    Node {
        labels: SmallVec<[LabelId; 4]>,
    },
    Edge {
        ty: TypeId,
    },
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum Position {
    #[default]
    None,
    Tx(usize),
    Store,
}

/// Properties of one node or edge: transaction writes first, then the committed
/// chain minus every key the transaction touched.
///
/// Properties the access mode hides are skipped.
#[derive(Default)]
pub struct PropertyCursor {
    ctx: Option<ReadContext>,
    lifecycle: Lifecycle,
    store: StorePropertyCursor,
    owner: Owner,
    tx_values: Vec<(PropId, PropValue)>,
    changed: Vec<PropId>,
    tx_pos: usize,
    store_first: Option<PropRecId>,
    store_started: bool,
    position: Position,
    tracer: Option<Arc<dyn ReadTracer>>,
    leak: Option<LeakToken>,
}

impl PropertyCursor {
    /// Creates an unpositioned cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions before the first property of a node.
    pub fn init_node(
        &mut self,
        ctx: &ReadContext,
        node: NodeId,
        labels: &[LabelId],
        first: Option<PropRecId>,
    ) {
        self.reset(ctx, first);
        self.owner = Owner::Node {
            labels: labels.iter().copied().collect(),
        };
        let tx = ctx.tx.read();
        if let Some(state) = tx.node_state(node) {
            collect_changes(&state.props, &mut self.tx_values, &mut self.changed);
        }
    }

    /// Positions before the first property of an edge.
    pub fn init_edge(
        &mut self,
        ctx: &ReadContext,
        edge: EdgeId,
        ty: TypeId,
        first: Option<PropRecId>,
    ) {
        self.reset(ctx, first);
        self.owner = Owner::Edge { ty };
        let tx = ctx.tx.read();
        if let Some(state) = tx.edge_state(edge) {
            collect_changes(&state.props, &mut self.tx_values, &mut self.changed);
        }
    }

    fn reset(&mut self, ctx: &ReadContext, first: Option<PropRecId>) {
        if self.leak.is_none() {
            self.leak = ctx.leaks.register("property");
        }
        self.ctx = Some(ctx.clone());
        self.lifecycle = Lifecycle::Active;
        self.tx_values.clear();
        self.changed.clear();
        self.tx_pos = 0;
        self.store_first = first;
        self.store_started = false;
        self.position = Position::None;
    }

    /// Key of the current property.
    pub fn key(&self) -> Option<PropId> {
        match self.position {
            Position::None => None,
            Position::Tx(pos) => Some(self.tx_values[pos].0),
            Position::Store => Some(self.store.key()),
        }
    }

    /// Value of the current property.
    pub fn value(&self) -> Option<&PropValue> {
        match self.position {
            Position::None => None,
            Position::Tx(pos) => Some(&self.tx_values[pos].1),
            Position::Store => Some(self.store.value()),
        }
    }

    /// Advances until `prop` and returns its value, or `None` once exhausted.
    pub fn find(&mut self, prop: PropId) -> Result<Option<PropValue>> {
        while self.next()? {
            if self.key() == Some(prop) {
                return Ok(self.value().cloned());
            }
        }
        Ok(None)
    }

    fn readable(&self, ctx: &ReadContext, prop: PropId) -> bool {
        match &self.owner {
            Owner::None => false,
            Owner::Node { labels, .. } => ctx.access.allows_read_node_property(labels, prop),
            Owner::Edge { ty, .. } => ctx.access.allows_read_edge_property(*ty, prop),
        }
    }

    fn produced(&self, prop: PropId) {
        if let Some(tracer) = &self.tracer {
            tracer.on_property(prop);
        }
    }
}

fn collect_changes(
    props: &rustc_hash::FxHashMap<PropId, Option<PropValue>>,
    values: &mut Vec<(PropId, PropValue)>,
    changed: &mut Vec<PropId>,
) {
    for (prop, change) in props {
        changed.push(*prop);
        if let Some(value) = change {
            values.push((*prop, value.clone()));
        }
    }
    changed.sort_unstable();
    values.sort_unstable_by_key(|(prop, _)| *prop);
}

impl Cursor for PropertyCursor {
    fn next(&mut self) -> Result<bool> {
        if !self.lifecycle.check_advance()? {
            return Ok(false);
        }
        let ctx = match &self.ctx {
            Some(ctx) => ctx.clone(),
            None => return Ok(false),
        };
        while self.tx_pos < self.tx_values.len() {
            let pos = self.tx_pos;
            self.tx_pos += 1;
            let prop = self.tx_values[pos].0;
            if self.readable(&ctx, prop) {
                self.position = Position::Tx(pos);
                self.produced(prop);
                return Ok(true);
            }
        }
        if !self.store_started {
            self.store_started = true;
            self.store.init(ctx.store.props(), self.store_first);
        }
        while self.store.next()? {
            let prop = self.store.key();
            if self.changed.binary_search(&prop).is_ok() || !self.readable(&ctx, prop) {
                continue;
            }
            self.position = Position::Store;
            self.produced(prop);
            return Ok(true);
        }
        self.position = Position::None;
        self.lifecycle = Lifecycle::Exhausted;
        Ok(false)
    }

    fn close(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        self.store.close();
        self.ctx = None;
        self.owner = Owner::None;
        self.tx_values.clear();
        self.changed.clear();
        self.position = Position::None;
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
