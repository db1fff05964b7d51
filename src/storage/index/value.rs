use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::types::{compare_tuples, compare_values, IndexValue, PropValue, Result, ValueGroup};

use super::descriptor::{IndexDescriptor, IndexOrder, IndexQueryConstraints, PropertyPredicate};
use super::progressor::{EntityValueClient, IndexProgressor, IndexSeekClient};

/// Index key: a value tuple with the entity id as tie-break.
#[derive(Clone, Debug)]
pub struct ValueKey {
    /// Indexed values in index property order.
    pub values: Vec<PropValue>,
    /// Entity owning the values.
    pub entity: u64,
}

impl PartialEq for ValueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ValueKey {}

impl PartialOrd for ValueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_tuples(&self.values, &other.values).then(self.entity.cmp(&other.entity))
    }
}

/// Slice of an index's key space: `floor` inclusive, `ceiling` exclusive.
///
/// A floor must not sort before the first key the query could match.
#[derive(Clone, Debug, Default)]
pub struct KeyRange {
    /// First key of the slice.
    pub floor: Option<ValueKey>,
    /// First key past the slice.
    pub ceiling: Option<ValueKey>,
}

impl KeyRange {
    /// Whether `key` falls inside the slice.
    pub fn contains(&self, key: &ValueKey) -> bool {
        self.floor.as_ref().map_or(true, |floor| key >= floor)
            && self.ceiling.as_ref().map_or(true, |ceiling| key < ceiling)
    }
}

#[derive(Default)]
struct ValueIndexState {
    entries: BTreeSet<ValueKey>,
    by_entity: FxHashMap<u64, Vec<PropValue>>,
}

/// Committed entries of one property index.
pub struct ValueIndex {
    descriptor: IndexDescriptor,
    state: RwLock<ValueIndexState>,
}

impl ValueIndex {
    /// Creates an empty index.
    pub fn new(descriptor: IndexDescriptor) -> Self {
        Self {
            descriptor,
            state: RwLock::new(ValueIndexState::default()),
        }
    }

    /// Schema and capability.
    pub fn descriptor(&self) -> &IndexDescriptor {
        &self.descriptor
    }

    /// Replaces the entry of `entity`; `None` removes it.
    pub fn update(&self, entity: u64, values: Option<Vec<PropValue>>) {
        let mut state = self.state.write();
        if let Some(old) = state.by_entity.remove(&entity) {
            state.entries.remove(&ValueKey {
                values: old,
                entity,
            });
        }
        if let Some(values) = values {
            state.entries.insert(ValueKey {
                values: values.clone(),
                entity,
            });
            state.by_entity.insert(entity, values);
        }
    }

    /// Number of indexed entities.
    pub fn count(&self) -> u64 {
        self.state.read().entries.len() as u64
    }

    /// Values currently indexed for `entity`.
    pub fn values_of(&self, entity: u64) -> Option<Vec<PropValue>> {
        self.state.read().by_entity.get(&entity).cloned()
    }

    /// Number of committed entries matching `query`.
    pub fn count_matching(self: &Arc<Self>, query: &[PropertyPredicate]) -> u64 {
        let seek = ValueProgressor::new(
            Arc::clone(self),
            query.to_vec(),
            IndexOrder::None,
            KeyRange::default(),
        );
        let state = self.state.read();
        seek.matching(&state.entries).count() as u64
    }

    /// Keys that split the entries matching `query` into
    /// `min(partitions, matches)` runs whose sizes differ by at most one, each
    /// with the rank of the first entry it starts.
    pub fn split_keys(
        self: &Arc<Self>,
        query: &[PropertyPredicate],
        partitions: usize,
    ) -> Vec<(u64, ValueKey)> {
        let seek = ValueProgressor::new(
            Arc::clone(self),
            query.to_vec(),
            IndexOrder::None,
            KeyRange::default(),
        );
        let state = self.state.read();
        let total = seek.matching(&state.entries).count();
        let partitions = partitions.min(total);
        if partitions <= 1 {
            return Vec::new();
        }
        let mut cuts = Vec::with_capacity(partitions - 1);
        for (pos, key) in seek.matching(&state.entries).enumerate() {
            if cuts.len() + 1 == partitions {
                break;
            }
            if pos == (cuts.len() + 1) * total / partitions {
                cuts.push((pos as u64, key.clone()));
            }
        }
        cuts
    }

    /// Validates `query` and hands a progressor over its hits to `client`.
    ///
    /// Schema and ordering mismatches fail here, before any hit is produced.
    pub fn query(
        self: &Arc<Self>,
        client: &mut dyn IndexSeekClient,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
    ) -> Result<()> {
        self.query_within(client, query, constraints, KeyRange::default())
    }

    /// Like [`ValueIndex::query`], restricted to the keys in `range`.
    pub fn query_within(
        self: &Arc<Self>,
        client: &mut dyn IndexSeekClient,
        query: &[PropertyPredicate],
        constraints: IndexQueryConstraints,
        range: KeyRange,
    ) -> Result<()> {
        self.descriptor.validate_query(query, &constraints)?;
        trace!(
            index = %self.descriptor.name,
            predicates = query.len(),
            order = ?constraints.order,
            bounded = range.floor.is_some() || range.ceiling.is_some(),
            "index.query"
        );
        let progressor =
            ValueProgressor::new(Arc::clone(self), query.to_vec(), constraints.order, range);
        client.initialize(&self.descriptor, Box::new(progressor), query, constraints)
    }
}

/// Raw progressor over the committed entries matching a query.
///
/// Approximate indexes only evaluate the first predicate; the remaining ones are
/// left to an exact-match filter further up the chain.
pub struct ValueProgressor {
    index: Arc<ValueIndex>,
    query: Vec<PropertyPredicate>,
    descending: bool,
    range: KeyRange,
    last: Option<ValueKey>,
    values: Vec<IndexValue>,
    done: bool,
}

impl ValueProgressor {
    fn new(
        index: Arc<ValueIndex>,
        query: Vec<PropertyPredicate>,
        order: IndexOrder,
        range: KeyRange,
    ) -> Self {
        Self {
            index,
            query,
            descending: matches!(order, IndexOrder::Descending),
            range,
            last: None,
            values: Vec::new(),
            done: false,
        }
    }

    /// Committed entries matching the query, ascending.
    fn matching<'a>(
        &'a self,
        entries: &'a BTreeSet<ValueKey>,
    ) -> impl Iterator<Item = &'a ValueKey> + 'a {
        entries
            .range((self.start_bound(), Bound::Unbounded))
            .take_while(move |key| !self.past_end(key))
            .filter(move |key| self.matches(key))
    }

    fn start_bound(&self) -> Bound<ValueKey> {
        let seed = match self.query.first() {
            Some(PropertyPredicate::Exact { value, .. }) => Some(value.clone()),
            Some(PropertyPredicate::Range {
                lower: Bound::Included(v) | Bound::Excluded(v),
                ..
            }) => Some(v.clone()),
            Some(PropertyPredicate::StringPrefix { prefix, .. }) => {
                Some(PropValue::Str(prefix.clone()))
            }
            _ => None,
        };
        // A one-value tuple with entity 0 sorts before every tuple it prefixes.
        match seed {
            Some(value) => Bound::Included(ValueKey {
                values: vec![value],
                entity: 0,
            }),
            None => Bound::Unbounded,
        }
    }

    fn step(&self, entries: &BTreeSet<ValueKey>) -> Option<ValueKey> {
        if self.descending {
            let upper = match (&self.last, &self.range.ceiling) {
                (Some(last), _) => Bound::Excluded(last.clone()),
                (None, Some(ceiling)) => Bound::Excluded(ceiling.clone()),
                (None, None) => Bound::Unbounded,
            };
            entries
                .range((Bound::Unbounded, upper))
                .next_back()
                .cloned()
        } else {
            let lower = match (&self.last, &self.range.floor) {
                (Some(last), _) => Bound::Excluded(last.clone()),
                (None, Some(floor)) => Bound::Included(floor.clone()),
                (None, None) => self.start_bound(),
            };
            entries.range((lower, Bound::Unbounded)).next().cloned()
        }
    }

    fn matches(&self, key: &ValueKey) -> bool {
        let checked = if self.index.descriptor.capability.composite_exact {
            self.query.len()
        } else {
            1
        };
        self.query
            .iter()
            .zip(key.values.iter())
            .take(checked)
            .all(|(predicate, value)| predicate.accepts(value))
    }

    /// Whether no later key in ascending order can match the first predicate.
    fn past_end(&self, key: &ValueKey) -> bool {
        let first = match key.values.first() {
            Some(first) => first,
            None => return false,
        };
        match self.query.first() {
            Some(PropertyPredicate::Exact { value, .. }) => compare_values(first, value).is_gt(),
            Some(PropertyPredicate::Range { lower, upper, .. }) => match upper {
                Bound::Included(u) => compare_values(first, u).is_gt(),
                Bound::Excluded(u) => compare_values(first, u).is_ge(),
                Bound::Unbounded => match lower {
                    Bound::Included(l) | Bound::Excluded(l) => first.group() > l.group(),
                    Bound::Unbounded => false,
                },
            },
            Some(PropertyPredicate::StringPrefix { prefix, .. }) => match first {
                PropValue::Str(s) => s.as_str() > prefix.as_str() && !s.starts_with(prefix.as_str()),
                other => other.group() > ValueGroup::Text,
            },
            _ => false,
        }
    }
}

impl IndexProgressor for ValueProgressor {
    fn next(&mut self, client: &mut dyn EntityValueClient) -> Result<bool> {
        while !self.done {
            let key = {
                let state = self.index.state.read();
                self.step(&state.entries)
            };
            let key = match key {
                Some(key) => key,
                None => {
                    self.done = true;
                    break;
                }
            };
            if !self.range.contains(&key) || (!self.descending && self.past_end(&key)) {
                self.done = true;
                break;
            }
            let hit = self.matches(&key);
            let entity = key.entity;
            if hit {
                let capability = &self.index.descriptor.capability;
                self.values.clear();
                if client.needs_values() {
                    self.values
                        .extend(key.values.iter().map(|value| capability.report(value)));
                }
                self.last = Some(key);
                if client.accept_entity(entity, 1.0, &mut self.values)? {
                    return Ok(true);
                }
            } else {
                self.last = Some(key);
            }
        }
        Ok(false)
    }

    fn close(&mut self) {
        self.done = true;
        self.last = None;
        self.values.clear();
    }
}
