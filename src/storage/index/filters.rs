//! Policies for the decorator stages layered over raw index hits.
//!
//! Stages run in a fixed order: security, then exact-match re-verification,
//! then value injection. A hit the security stage rejects never costs a store
//! lookup further up.

use crate::storage::cursor::{EntityCursor, PropertyCursor, ReadContext};
use crate::storage::security::AccessMode;
use crate::types::{EntityKind, IndexValue, LabelId, PropId, Result, TypeId};

use super::descriptor::{IndexDescriptor, IndexQueryConstraints, PropertyPredicate};
use super::progressor::AcceptPolicy;

use crate::storage::cursor::Cursor;

/// Which stages a query needs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChainPlan {
    /// Re-check visibility of every hit and readability of queried properties.
    pub security: bool,
    /// Re-verify composite predicates the index only matched approximately.
    pub exact_match: bool,
    /// Fill values the index could only report as unknown.
    pub inject_values: bool,
}

impl ChainPlan {
    /// Decides the stages for `query` against `descriptor` under `access`.
    pub fn for_query(
        access: &dyn AccessMode,
        descriptor: &IndexDescriptor,
        query: &[PropertyPredicate],
        constraints: &IndexQueryConstraints,
    ) -> Self {
        let capability = &descriptor.capability;
        let lossy = capability.text_value_limit.is_some() || !capability.floats_lossless;
        Self {
            security: !grants_whole_index(access, descriptor, query),
            exact_match: !capability.composite_exact && query.len() > 1,
            inject_values: constraints.reports_values() && lossy,
        }
    }
}

fn grants_whole_index(
    access: &dyn AccessMode,
    descriptor: &IndexDescriptor,
    query: &[PropertyPredicate],
) -> bool {
    descriptor.tokens.iter().all(|token| match descriptor.entity {
        EntityKind::Node => {
            let label = LabelId(*token);
            access.allows_traverse_all_with_label(label)
                && query
                    .iter()
                    .all(|p| access.allows_read_node_property(&[label], p.prop()))
        }
        EntityKind::Edge => {
            let ty = TypeId(*token);
            access.allows_traverse_all_of_type(ty)
                && query
                    .iter()
                    .all(|p| access.allows_read_edge_property(ty, p.prop()))
        }
    })
}

/// Rejects hits the access mode hides, or whose queried properties it hides.
pub struct SecurityPolicy<E: EntityCursor> {
    ctx: ReadContext,
    entity: E,
    props: Vec<PropId>,
}

impl<E: EntityCursor> SecurityPolicy<E> {
    /// Creates the policy with its own scratch entity cursor.
    pub fn new(ctx: &ReadContext) -> Self {
        Self {
            ctx: ctx.clone(),
            entity: E::default(),
            props: Vec::new(),
        }
    }
}

impl<E: EntityCursor> AcceptPolicy for SecurityPolicy<E> {
    fn initialize(
        &mut self,
        _descriptor: &IndexDescriptor,
        query: &[PropertyPredicate],
        _constraints: &IndexQueryConstraints,
    ) -> Result<()> {
        self.props = query.iter().map(PropertyPredicate::prop).collect();
        Ok(())
    }

    fn accept(&mut self, reference: u64, _values: &mut [IndexValue]) -> Result<bool> {
        self.entity.seek_stable(&self.ctx, reference);
        if !self.entity.next()? {
            return Ok(false);
        }
        let access = self.ctx.access();
        if self
            .props
            .iter()
            .all(|prop| self.entity.can_read_property(access, *prop))
        {
            Ok(true)
        } else {
            self.ctx.metrics.security_rejection();
            Ok(false)
        }
    }

    fn close(&mut self) {
        self.entity.close();
    }
}

/// Re-verifies every predicate against the entity's live properties in one
/// pass over its property chain.
pub struct ExactMatchPolicy<E: EntityCursor> {
    ctx: ReadContext,
    entity: E,
    props: PropertyCursor,
    predicates: Vec<PropertyPredicate>,
}

impl<E: EntityCursor> ExactMatchPolicy<E> {
    /// Creates the policy with its own scratch cursors.
    pub fn new(ctx: &ReadContext) -> Self {
        Self {
            ctx: ctx.clone(),
            entity: E::default(),
            props: PropertyCursor::new(),
            predicates: Vec::new(),
        }
    }
}

impl<E: EntityCursor> AcceptPolicy for ExactMatchPolicy<E> {
    fn initialize(
        &mut self,
        _descriptor: &IndexDescriptor,
        query: &[PropertyPredicate],
        _constraints: &IndexQueryConstraints,
    ) -> Result<()> {
        self.predicates = query.to_vec();
        self.predicates.sort_by_key(PropertyPredicate::prop);
        Ok(())
    }

    fn accept(&mut self, reference: u64, _values: &mut [IndexValue]) -> Result<bool> {
        self.entity.seek_stable(&self.ctx, reference);
        if !self.entity.next()? {
            return Ok(false);
        }
        self.entity.load_properties(&mut self.props)?;
        let mut matched = 0;
        while matched < self.predicates.len() && self.props.next()? {
            let key = match self.props.key() {
                Some(key) => key,
                None => continue,
            };
            let pos = match self.predicates.binary_search_by_key(&key, PropertyPredicate::prop) {
                Ok(pos) => pos,
                Err(_) => continue,
            };
            match self.props.value() {
                Some(value) if self.predicates[pos].accepts(value) => matched += 1,
                _ => return Ok(false),
            }
        }
        Ok(matched == self.predicates.len())
    }

    fn close(&mut self) {
        self.props.close();
        self.entity.close();
    }
}

/// Fills values the index reported as unknown with one pass over the entity's
/// properties, leaving known slots untouched.
pub struct ValueInjectorPolicy<E: EntityCursor> {
    ctx: ReadContext,
    entity: E,
    props: PropertyCursor,
    keys: Vec<PropId>,
}

impl<E: EntityCursor> ValueInjectorPolicy<E> {
    /// Creates the policy with its own scratch cursors.
    pub fn new(ctx: &ReadContext) -> Self {
        Self {
            ctx: ctx.clone(),
            entity: E::default(),
            props: PropertyCursor::new(),
            keys: Vec::new(),
        }
    }
}

impl<E: EntityCursor> AcceptPolicy for ValueInjectorPolicy<E> {
    fn initialize(
        &mut self,
        descriptor: &IndexDescriptor,
        _query: &[PropertyPredicate],
        _constraints: &IndexQueryConstraints,
    ) -> Result<()> {
        self.keys = descriptor.props.clone();
        Ok(())
    }

    fn accept(&mut self, reference: u64, values: &mut [IndexValue]) -> Result<bool> {
        let mut missing = values.iter().filter(|v| v.is_unknown()).count();
        if missing == 0 {
            return Ok(true);
        }
        self.entity.seek_stable(&self.ctx, reference);
        if !self.entity.next()? {
            return Ok(false);
        }
        self.ctx.metrics.store_lookup();
        self.entity.load_properties(&mut self.props)?;
        while missing > 0 && self.props.next()? {
            let key = match self.props.key() {
                Some(key) => key,
                None => continue,
            };
            let slot = match self.keys.iter().position(|k| *k == key) {
                Some(slot) if slot < values.len() => slot,
                _ => continue,
            };
            if values[slot].is_unknown() {
                if let Some(value) = self.props.value() {
                    values[slot] = IndexValue::Known(value.clone());
                    missing -= 1;
                }
            }
        }
        Ok(true)
    }

    fn needs_values(&self) -> bool {
        true
    }

    fn close(&mut self) {
        self.props.close();
        self.entity.close();
    }
}
