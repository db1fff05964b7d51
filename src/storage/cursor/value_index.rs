use std::sync::Arc;

use tracing::trace;

use crate::storage::index::{
    ChainPlan, EntityValueClient, ExactMatchPolicy, FilterClient, IndexDescriptor, IndexOrder,
    IndexProgressor, IndexQueryConstraints, IndexSeekClient, KeyRange, PropertyPredicate,
    SecurityPolicy, ValueIndex, ValueInjectorPolicy, ValueKey,
};
use crate::types::{EdgeId, EntityKind, IndexValue, NodeId, PropValue, Result, SombraError};

use super::merge::{MergeSide, SortedMergeJoin};
use super::pool::LeakToken;
use super::{
    Cursor, EdgeScanCursor, EntityCursor, Lifecycle, NodeCursor, PropertyCursor, ReadContext,
    ReadTracer, RemovedIds,
};

/// Receives the hits that survive the filter chain.
#[derive(Default)]
struct HitSink {
    removed: RemovedIds,
    needs_values: bool,
    reference: Option<u64>,
    values: Vec<IndexValue>,
}

impl EntityValueClient for HitSink {
    fn accept_entity(
        &mut self,
        reference: u64,
        _score: f32,
        values: &mut [IndexValue],
    ) -> Result<bool> {
        // Entities the transaction touched are answered from its own state.
        if self.removed.contains(reference) {
            return Ok(false);
        }
        self.reference = Some(reference);
        self.values.clear();
        self.values.extend_from_slice(values);
        Ok(true)
    }

    fn needs_values(&self) -> bool {
        self.needs_values
    }
}

/// Seek over a value index, merged with what the transaction changed.
///
/// Committed hits pass through the filter chain the query needs (security,
/// exact-match re-verification, value injection) before reaching the cursor.
/// Every entity the transaction touched is dropped from the committed side and
/// re-evaluated against its transaction-local properties instead.
pub struct ValueIndexCursor<E: EntityCursor> {
    ctx: Option<ReadContext>,
    lifecycle: Lifecycle,
    descriptor: Option<IndexDescriptor>,
    query: Vec<PropertyPredicate>,
    constraints: IndexQueryConstraints,
    progressor: Option<Box<dyn IndexProgressor>>,
    sink: HitSink,
    prepared: bool,
    added: Vec<ValueKey>,
    added_pos: usize,
    join: SortedMergeJoin,
    store_values: Vec<IndexValue>,
    current: Option<u64>,
    values: Vec<IndexValue>,
    entity: E,
    props: PropertyCursor,
    loaded: bool,
    tracer: Option<Arc<dyn ReadTracer>>,
    leak: Option<LeakToken>,
}

/// Seek over a node property index.
pub type NodeValueIndexCursor = ValueIndexCursor<NodeCursor>;
/// Seek over an edge property index.
pub type EdgeValueIndexCursor = ValueIndexCursor<EdgeScanCursor>;

impl<E: EntityCursor> Default for ValueIndexCursor<E> {
    fn default() -> Self {
        Self {
            ctx: None,
            lifecycle: Lifecycle::Fresh,
            descriptor: None,
            query: Vec::new(),
            constraints: IndexQueryConstraints::unconstrained(),
            progressor: None,
            sink: HitSink::default(),
            prepared: false,
            added: Vec::new(),
            added_pos: 0,
            join: SortedMergeJoin::new(IndexOrder::None),
            store_values: Vec::new(),
            current: None,
            values: Vec::new(),
            entity: E::default(),
            props: PropertyCursor::new(),
            loaded: false,
            tracer: None,
            leak: None,
        }
    }
}

impl<E: EntityCursor> ValueIndexCursor<E> {
    /// Creates an unpositioned cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `query` against `index` and positions before the first hit.
    ///
    /// Schema and ordering mismatches are reported here, before any hit.
    pub fn seek(
        &mut self,
        ctx: &ReadContext,
        index: &Arc<ValueIndex>,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
    ) -> Result<()> {
        self.seek_within(ctx, index, query, constraints, KeyRange::default())
    }

    /// Seek restricted to the committed keys in `range`; used by partitioned
    /// seeks.
    pub(crate) fn seek_within(
        &mut self,
        ctx: &ReadContext,
        index: &Arc<ValueIndex>,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
        range: KeyRange,
    ) -> Result<()> {
        if self.leak.is_none() {
            self.leak = ctx.leaks.register("value_index");
        }
        self.release_seek();
        self.ctx = Some(ctx.clone());
        self.lifecycle = Lifecycle::Active;
        let descriptor = index.descriptor();
        if descriptor.entity != E::KIND {
            self.lifecycle = Lifecycle::Exhausted;
            return Err(SombraError::IndexNotApplicable(format!(
                "index {} covers {} entities, cursor reads {}",
                descriptor.name,
                descriptor.entity,
                E::KIND
            )));
        }
        if let Some(tracer) = &self.tracer {
            tracer.on_index_seek(descriptor.id, query.len());
        }
        let plan = ChainPlan::for_query(ctx.access(), descriptor, query, &constraints);
        trace!(
            index = %descriptor.name,
            security = plan.security,
            exact_match = plan.exact_match,
            inject_values = plan.inject_values,
            "value_index.seek"
        );
        self.sink.needs_values = constraints.reports_values();
        if let Err(err) = self.attach(ctx, index, query, constraints, plan, range) {
            self.lifecycle = Lifecycle::Exhausted;
            return Err(err);
        }
        Ok(())
    }

    /// Builds the chain raw hits -> security -> exact match -> injector -> self.
    fn attach(
        &mut self,
        ctx: &ReadContext,
        index: &Arc<ValueIndex>,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
        plan: ChainPlan,
        range: KeyRange,
    ) -> Result<()> {
        let mut injector = FilterClient::optional(
            self,
            plan.inject_values
                .then(|| ValueInjectorPolicy::<E>::new(ctx)),
        );
        let mut exact = FilterClient::optional(
            &mut injector,
            plan.exact_match.then(|| ExactMatchPolicy::<E>::new(ctx)),
        );
        let mut security = FilterClient::optional(
            &mut exact,
            plan.security.then(|| SecurityPolicy::<E>::new(ctx)),
        );
        index.query_within(&mut security, query, constraints, range)
    }

    fn release_seek(&mut self) {
        if let Some(mut progressor) = self.progressor.take() {
            progressor.close();
        }
        self.descriptor = None;
        self.query.clear();
        self.sink = HitSink::default();
        self.prepared = false;
        self.added.clear();
        self.added_pos = 0;
        self.store_values.clear();
        self.current = None;
        self.values.clear();
        self.loaded = false;
    }

    fn prepare(&mut self, ctx: &ReadContext) -> Result<()> {
        self.prepared = true;
        self.join.initialize(self.constraints.order);
        let descriptor = match &self.descriptor {
            Some(descriptor) => descriptor.clone(),
            None => return Ok(()),
        };
        let touched = {
            let tx = ctx.tx.read();
            if !tx.has_changes() {
                return Ok(());
            }
            E::touched(&tx)
        };
        self.sink.removed = RemovedIds::from_set(&Arc::new(touched.clone()));
        for id in touched {
            let values = match self.tx_tuple(ctx, &descriptor, id)? {
                Some(values) => values,
                None => continue,
            };
            if self
                .query
                .iter()
                .zip(values.iter())
                .all(|(predicate, value)| predicate.accepts(value))
            {
                self.added.push(ValueKey { values, entity: id });
            }
        }
        self.entity.close();
        if self.constraints.order.is_ordered() {
            self.added.sort();
            if matches!(self.constraints.order, IndexOrder::Descending) {
                self.added.reverse();
            }
        }
        Ok(())
    }

    /// Index tuple of `id` as the transaction sees it, if it belongs to the
    /// index and every indexed property is present and readable.
    fn tx_tuple(
        &mut self,
        ctx: &ReadContext,
        descriptor: &IndexDescriptor,
        id: u64,
    ) -> Result<Option<Vec<PropValue>>> {
        self.entity.seek(ctx, id);
        if !self.entity.next()? || !descriptor.matches_tokens(self.entity.tokens()) {
            return Ok(None);
        }
        let mut slots: Vec<Option<PropValue>> = vec![None; descriptor.props.len()];
        self.entity.load_properties(&mut self.props)?;
        while self.props.next()? {
            let key = match self.props.key() {
                Some(key) => key,
                None => continue,
            };
            if let Some(pos) = descriptor.props.iter().position(|p| *p == key) {
                slots[pos] = self.props.value().cloned();
            }
        }
        self.props.close();
        Ok(slots.into_iter().collect())
    }

    fn pull_store(&mut self) -> Result<bool> {
        let progressor = match &mut self.progressor {
            Some(progressor) => progressor,
            None => return Ok(false),
        };
        progressor.next(&mut self.sink)
    }

    fn next_unordered(&mut self, ctx: &ReadContext) -> Result<bool> {
        if let Some(key) = self.added.get(self.added_pos) {
            self.added_pos += 1;
            self.current = Some(key.entity);
            self.values = key.values.iter().cloned().map(IndexValue::Known).collect();
            ctx.metrics.overlay_hit();
            return Ok(true);
        }
        if self.pull_store()? {
            self.current = self.sink.reference;
            self.values = std::mem::take(&mut self.sink.values);
            return Ok(true);
        }
        Ok(false)
    }

    fn next_ordered(&mut self, ctx: &ReadContext) -> Result<bool> {
        if self.join.needs_store() {
            let key = if self.pull_store()? {
                self.store_values = std::mem::take(&mut self.sink.values);
                self.sink.reference.map(|entity| ValueKey {
                    values: self
                        .store_values
                        .iter()
                        .map(|v| v.known().cloned().unwrap_or(PropValue::Null))
                        .collect(),
                    entity,
                })
            } else {
                None
            };
            self.join.set_store(key);
        }
        if self.join.needs_added() {
            let key = self.added.get(self.added_pos).cloned();
            if key.is_some() {
                self.added_pos += 1;
            }
            self.join.set_added(key);
        }
        match self.join.next() {
            Some((key, MergeSide::Store)) => {
                self.current = Some(key.entity);
                self.values = std::mem::take(&mut self.store_values);
                Ok(true)
            }
            Some((key, MergeSide::Added)) => {
                ctx.metrics.overlay_hit();
                self.current = Some(key.entity);
                self.values = key.values.into_iter().map(IndexValue::Known).collect();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Current entity id.
    pub fn entity_reference(&self) -> Option<u64> {
        self.current
    }

    /// Values of the current hit in index property order. Committed hits carry
    /// values only when the seek asked for values or for an order.
    pub fn values(&self) -> &[IndexValue] {
        &self.values
    }

    /// Value at `slot` of the current hit, if known.
    pub fn property_value(&self, slot: usize) -> Option<&PropValue> {
        self.values.get(slot).and_then(IndexValue::known)
    }

    /// Entity cursor positioned on the current hit.
    pub fn entity(&mut self) -> Result<&E> {
        let id = self
            .current
            .ok_or(SombraError::Usage("value index cursor is not positioned"))?;
        if !self.loaded {
            let ctx = self
                .ctx
                .as_ref()
                .ok_or(SombraError::Usage("value index cursor is not positioned"))?;
            self.entity.seek_stable(ctx, id);
            if !self.entity.next()? {
                return Err(SombraError::Usage("value index hit vanished"));
            }
            self.loaded = true;
        }
        Ok(&self.entity)
    }
}

impl ValueIndexCursor<NodeCursor> {
    /// Current node.
    pub fn node_reference(&self) -> Option<NodeId> {
        self.current.map(NodeId)
    }
}

impl ValueIndexCursor<EdgeScanCursor> {
    /// Current edge.
    pub fn edge_reference(&self) -> Option<EdgeId> {
        self.current.map(EdgeId)
    }
}

impl<E: EntityCursor> IndexSeekClient for ValueIndexCursor<E> {
    fn initialize(
        &mut self,
        descriptor: &IndexDescriptor,
        progressor: Box<dyn IndexProgressor>,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
    ) -> Result<()> {
        if let Some(mut old) = self.progressor.replace(progressor) {
            old.close();
        }
        self.descriptor = Some(descriptor.clone());
        self.query = query.to_vec();
        self.constraints = constraints;
        self.prepared = false;
        Ok(())
    }
}

impl<E: EntityCursor> Cursor for ValueIndexCursor<E> {
    fn next(&mut self) -> Result<bool> {
        if !self.lifecycle.check_advance()? {
            return Ok(false);
        }
        let ctx = match &self.ctx {
            Some(ctx) => ctx.clone(),
            None => return Ok(false),
        };
        if !self.prepared {
            self.prepare(&ctx)?;
        }
        self.loaded = false;
        let found = if self.constraints.order.is_ordered() {
            self.next_ordered(&ctx)?
        } else {
            self.next_unordered(&ctx)?
        };
        if !found {
            self.current = None;
            self.values.clear();
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
        self.release_seek();
        self.entity.close();
        self.props.close();
        self.ctx = None;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::cursor::testing::{context, with_access};
    use crate::storage::index::IndexCapability;
    use crate::storage::metrics::{CounterMetrics, CursorMetrics};
    use crate::storage::security::RestrictedAccess;
    use crate::types::{IndexId, LabelId, PropId};

    fn person_age(ctx: &ReadContext, capability: IndexCapability) -> Arc<ValueIndex> {
        ctx.store
            .create_index(IndexDescriptor {
                id: IndexId(1),
                name: "person_age".into(),
                entity: EntityKind::Node,
                tokens: vec![1],
                props: vec![PropId(1), PropId(2)],
                unique: false,
                capability,
            })
            .unwrap()
    }

    fn person(ctx: &ReadContext, age: i64, name: &str) -> NodeId {
        let node = ctx.store.create_node(&[LabelId(1)]).unwrap();
        ctx.store.set_node_property(node, PropId(1), PropValue::Int(age)).unwrap();
        ctx.store
            .set_node_property(node, PropId(2), PropValue::Str(name.into()))
            .unwrap();
        node
    }

    fn drain(cursor: &mut NodeValueIndexCursor) -> Vec<u64> {
        let mut out = Vec::new();
        while cursor.next().unwrap() {
            out.push(cursor.entity_reference().unwrap());
        }
        out
    }

    #[test]
    fn seek_merges_transaction_changes() {
        let ctx = context();
        let index = person_age(&ctx, IndexCapability::default());
        let a = person(&ctx, 30, "ann");
        let b = person(&ctx, 30, "bob");
        let c = person(&ctx, 40, "cid");
        {
            let mut tx = ctx.tx.write();
            tx.node_set_property(b, PropId(1), PropValue::Int(31));
            tx.node_set_property(c, PropId(1), PropValue::Int(30));
        }
        let mut cursor = NodeValueIndexCursor::new();
        cursor
            .seek(
                &ctx,
                &index,
                &[PropertyPredicate::exact(PropId(1), 30i64)],
                IndexQueryConstraints::unconstrained(),
            )
            .unwrap();
        let mut hits = drain(&mut cursor);
        hits.sort_unstable();
        assert_eq!(hits, vec![a.0, c.0]);
        cursor.close();
    }

    #[test]
    fn ordered_seek_interleaves_by_value() {
        let ctx = context();
        let index = person_age(&ctx, IndexCapability::default());
        let young = person(&ctx, 20, "y");
        let old = person(&ctx, 60, "o");
        let mid = ctx.store.create_node(&[]).unwrap();
        {
            let mut tx = ctx.tx.write();
            tx.node_add_label(mid, LabelId(1));
            tx.node_set_property(mid, PropId(1), PropValue::Int(40));
            tx.node_set_property(mid, PropId(2), PropValue::Str("m".into()));
        }
        let mut cursor = NodeValueIndexCursor::new();
        let range = PropertyPredicate::range(
            PropId(1),
            std::ops::Bound::Included(PropValue::Int(0)),
            std::ops::Bound::Unbounded,
        );
        cursor
            .seek(
                &ctx,
                &index,
                std::slice::from_ref(&range),
                IndexQueryConstraints::ordered(IndexOrder::Ascending),
            )
            .unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.node_reference(), Some(young));
        assert_eq!(cursor.property_value(0), Some(&PropValue::Int(20)));
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.node_reference(), Some(mid));
        assert_eq!(cursor.property_value(1), Some(&PropValue::Str("m".into())));
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.node_reference(), Some(old));
        assert!(!cursor.next().unwrap());

        cursor
            .seek(
                &ctx,
                &index,
                &[range],
                IndexQueryConstraints::ordered(IndexOrder::Descending),
            )
            .unwrap();
        assert_eq!(drain(&mut cursor), vec![old.0, mid.0, young.0]);
        cursor.close();
    }

    fn age_range() -> PropertyPredicate {
        PropertyPredicate::range(
            PropId(1),
            std::ops::Bound::Included(PropValue::Int(0)),
            std::ops::Bound::Unbounded,
        )
    }

    #[test]
    fn ordered_seek_without_values_still_merges_by_value() {
        let ctx = context();
        let index = person_age(&ctx, IndexCapability::default());
        let young = person(&ctx, 20, "y");
        let old = person(&ctx, 60, "o");
        let mid = ctx.store.create_node(&[]).unwrap();
        {
            let mut tx = ctx.tx.write();
            tx.node_add_label(mid, LabelId(1));
            tx.node_set_property(mid, PropId(1), PropValue::Int(40));
            tx.node_set_property(mid, PropId(2), PropValue::Str("m".into()));
        }
        let mut cursor = NodeValueIndexCursor::new();
        for (order, expected) in [
            (IndexOrder::Ascending, vec![young.0, mid.0, old.0]),
            (IndexOrder::Descending, vec![old.0, mid.0, young.0]),
        ] {
            cursor
                .seek(
                    &ctx,
                    &index,
                    &[age_range()],
                    IndexQueryConstraints::ordered(order).with_values(false),
                )
                .unwrap();
            assert_eq!(drain(&mut cursor), expected, "{order:?}");
        }
        cursor.close();
    }

    #[test]
    fn ordered_seek_over_lossy_values_merges_on_exact_values() {
        let ctx = context();
        let index = person_age(&ctx, IndexCapability::lossy(4));
        let first = person(&ctx, 30, "abcdef");
        let last = person(&ctx, 30, "abcdzz");
        let between = ctx.store.create_node(&[]).unwrap();
        {
            let mut tx = ctx.tx.write();
            tx.node_add_label(between, LabelId(1));
            tx.node_set_property(between, PropId(1), PropValue::Int(30));
            tx.node_set_property(between, PropId(2), PropValue::Str("abcdmm".into()));
        }
        let mut cursor = NodeValueIndexCursor::new();
        for constraints in [
            IndexQueryConstraints::ordered(IndexOrder::Ascending),
            IndexQueryConstraints::ordered(IndexOrder::Ascending).with_values(false),
        ] {
            cursor.seek(&ctx, &index, &[age_range()], constraints).unwrap();
            assert!(cursor.next().unwrap());
            assert_eq!(cursor.node_reference(), Some(first));
            assert_eq!(cursor.property_value(1), Some(&PropValue::Str("abcdef".into())));
            assert!(cursor.next().unwrap());
            assert_eq!(cursor.node_reference(), Some(between));
            assert!(cursor.next().unwrap());
            assert_eq!(cursor.node_reference(), Some(last));
            assert!(!cursor.next().unwrap());
        }
        cursor.close();
    }

    #[test]
    fn mismatched_query_fails_before_iteration() {
        let ctx = context();
        let index = person_age(&ctx, IndexCapability::default());
        let mut cursor = NodeValueIndexCursor::new();
        let err = cursor
            .seek(
                &ctx,
                &index,
                &[PropertyPredicate::exact(PropId(2), 1i64)],
                IndexQueryConstraints::unconstrained(),
            )
            .unwrap_err();
        assert!(matches!(err, SombraError::IndexNotApplicable(_)));
        assert!(!cursor.next().unwrap());
        let mut edges = EdgeValueIndexCursor::new();
        let err = edges
            .seek(
                &ctx,
                &index,
                &[PropertyPredicate::exact(PropId(1), 1i64)],
                IndexQueryConstraints::unconstrained(),
            )
            .unwrap_err();
        assert!(matches!(err, SombraError::IndexNotApplicable(_)));
        edges.close();
        cursor.close();
    }

    #[test]
    fn lossy_index_injects_values_once() {
        let metrics = Arc::new(CounterMetrics::default());
        let mut ctx = context();
        let shared: Arc<dyn CursorMetrics> = metrics.clone();
        ctx.metrics = shared;
        let index = person_age(&ctx, IndexCapability::lossy(4));
        let node = person(&ctx, 7, "a name well past the limit");
        let mut cursor = NodeValueIndexCursor::new();
        cursor
            .seek(
                &ctx,
                &index,
                &[PropertyPredicate::exact(PropId(1), 7i64)],
                IndexQueryConstraints::unconstrained().with_values(true),
            )
            .unwrap();
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.node_reference(), Some(node));
        assert_eq!(cursor.property_value(0), Some(&PropValue::Int(7)));
        assert_eq!(
            cursor.property_value(1),
            Some(&PropValue::Str("a name well past the limit".into()))
        );
        assert!(!cursor.next().unwrap());
        assert_eq!(metrics.snapshot().store_lookups, 1);
        cursor.close();
    }

    #[test]
    fn hidden_property_filters_hits() {
        let base = context();
        let index = person_age(&base, IndexCapability::default());
        person(&base, 5, "x");
        let ctx = with_access(
            Arc::clone(&base.store),
            Arc::new(RestrictedAccess::new().grant_label(LabelId(1)).deny_property(PropId(1))),
        );
        let mut cursor = NodeValueIndexCursor::new();
        cursor
            .seek(
                &ctx,
                &index,
                &[PropertyPredicate::exact(PropId(1), 5i64)],
                IndexQueryConstraints::unconstrained(),
            )
            .unwrap();
        assert!(!cursor.next().unwrap());
        cursor.close();
        assert_eq!(ctx.leaks.outstanding(), 0);
    }
}
