use std::ops::Bound;

use crate::types::{
    compare_values, EntityKind, IndexId, IndexValue, PropId, PropValue, Result, SombraError,
    ValueGroup,
};

/// Requested result order of an index or token scan.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IndexOrder {
    /// Any order.
    #[default]
    None,
    /// Ascending by value, then by entity id.
    Ascending,
    /// Descending by value, then by entity id.
    Descending,
}

impl IndexOrder {
    /// Whether an order was requested.
    pub fn is_ordered(self) -> bool {
        !matches!(self, IndexOrder::None)
    }
}

/// Predicate over one indexed property.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyPredicate {
    /// Property exists with any value.
    Exists {
        /// Property key.
        prop: PropId,
    },
    /// Property equals a value.
    Exact {
        /// Property key.
        prop: PropId,
        /// Required value.
        value: PropValue,
    },
    /// Property lies within a range of one value group.
    Range {
        /// Property key.
        prop: PropId,
        /// Lower bound.
        lower: Bound<PropValue>,
        /// Upper bound.
        upper: Bound<PropValue>,
    },
    /// String property starts with a prefix.
    StringPrefix {
        /// Property key.
        prop: PropId,
        /// Required prefix.
        prefix: String,
    },
}

impl PropertyPredicate {
    /// Shorthand for an exact predicate.
    pub fn exact(prop: PropId, value: impl Into<PropValue>) -> Self {
        PropertyPredicate::Exact {
            prop,
            value: value.into(),
        }
    }

    /// Shorthand for a range predicate.
    pub fn range(prop: PropId, lower: Bound<PropValue>, upper: Bound<PropValue>) -> Self {
        PropertyPredicate::Range { prop, lower, upper }
    }

    /// The property the predicate tests.
    pub fn prop(&self) -> PropId {
        match self {
            PropertyPredicate::Exists { prop }
            | PropertyPredicate::Exact { prop, .. }
            | PropertyPredicate::Range { prop, .. }
            | PropertyPredicate::StringPrefix { prop, .. } => *prop,
        }
    }

    /// Whether this is an exact-value predicate.
    pub fn is_exact(&self) -> bool {
        matches!(self, PropertyPredicate::Exact { .. })
    }

    /// Evaluates the predicate against a value; `Null` never matches.
    pub fn accepts(&self, value: &PropValue) -> bool {
        if value.is_null() {
            return false;
        }
        match self {
            PropertyPredicate::Exists { .. } => true,
            PropertyPredicate::Exact { value: expected, .. } => {
                compare_values(expected, value).is_eq()
            }
            PropertyPredicate::Range { lower, upper, .. } => {
                let group = match (lower, upper) {
                    (Bound::Included(v) | Bound::Excluded(v), _) => Some(v.group()),
                    (_, Bound::Included(v) | Bound::Excluded(v)) => Some(v.group()),
                    _ => None,
                };
                if let Some(group) = group {
                    if value.group() != group {
                        return false;
                    }
                }
                let above = match lower {
                    Bound::Unbounded => true,
                    Bound::Included(v) => compare_values(value, v).is_ge(),
                    Bound::Excluded(v) => compare_values(value, v).is_gt(),
                };
                let below = match upper {
                    Bound::Unbounded => true,
                    Bound::Included(v) => compare_values(value, v).is_le(),
                    Bound::Excluded(v) => compare_values(value, v).is_lt(),
                };
                above && below
            }
            PropertyPredicate::StringPrefix { prefix, .. } => {
                matches!(value, PropValue::Str(s) if s.starts_with(prefix.as_str()))
            }
        }
    }
}

/// What an index implementation can and cannot do.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexCapability {
    /// Whether ordered scans are supported.
    pub orderable: bool,
    /// Whether composite seeks match every predicate; otherwise only the first
    /// predicate is honoured and hits must be re-verified.
    pub composite_exact: bool,
    /// Strings longer than this are reported as unknown values.
    pub text_value_limit: Option<usize>,
    /// Whether floats are reproduced exactly.
    pub floats_lossless: bool,
}

impl Default for IndexCapability {
    fn default() -> Self {
        Self {
            orderable: true,
            composite_exact: true,
            text_value_limit: None,
            floats_lossless: true,
        }
    }
}

impl IndexCapability {
    /// Capability of an index that keeps only truncated strings and approximate
    /// floats, and matches composite seeks on their first property only.
    pub fn lossy(text_value_limit: usize) -> Self {
        Self {
            orderable: true,
            composite_exact: false,
            text_value_limit: Some(text_value_limit),
            floats_lossless: false,
        }
    }

    /// Whether the index reports `value` exactly.
    pub fn value_is_exact(&self, value: &PropValue) -> bool {
        match value {
            PropValue::Float(_) => self.floats_lossless,
            PropValue::Str(s) => self
                .text_value_limit
                .map_or(true, |limit| s.len() <= limit),
            _ => true,
        }
    }

    /// Converts a stored value into what the index reports.
    pub fn report(&self, value: &PropValue) -> IndexValue {
        if self.value_is_exact(value) {
            IndexValue::Known(value.clone())
        } else {
            IndexValue::Unknown
        }
    }

    /// Whether some values of `group` may come back unknown.
    pub fn group_may_be_lossy(&self, group: ValueGroup) -> bool {
        match group {
            ValueGroup::Number => !self.floats_lossless,
            ValueGroup::Text => self.text_value_limit.is_some(),
            _ => false,
        }
    }
}

/// Schema and capability of one value index.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexDescriptor {
    /// Index identifier.
    pub id: IndexId,
    /// Human readable name used in diagnostics.
    pub name: String,
    /// Entity kind the index covers.
    pub entity: EntityKind,
    /// Label or type tokens; more than one makes a multi-token index.
    pub tokens: Vec<u32>,
    /// Indexed properties, in key order of the index.
    pub props: Vec<PropId>,
    /// Whether the index backs a uniqueness constraint.
    pub unique: bool,
    /// Implementation capability.
    pub capability: IndexCapability,
}

impl IndexDescriptor {
    /// Whether an entity with `tokens` belongs to the index schema.
    pub fn matches_tokens(&self, tokens: impl IntoIterator<Item = u32>) -> bool {
        tokens.into_iter().any(|t| self.tokens.contains(&t))
    }

    /// Validates a query against the schema before any iteration begins.
    pub fn validate_query(
        &self,
        query: &[PropertyPredicate],
        constraints: &IndexQueryConstraints,
    ) -> Result<()> {
        if query.is_empty() {
            return Err(SombraError::Invalid("empty index query"));
        }
        if query.len() > self.props.len() {
            return Err(SombraError::IndexNotApplicable(format!(
                "index {} covers {} properties, query has {} predicates",
                self.name,
                self.props.len(),
                query.len()
            )));
        }
        for (pos, predicate) in query.iter().enumerate() {
            if predicate.prop() != self.props[pos] {
                return Err(SombraError::IndexNotApplicable(format!(
                    "predicate on property {} does not match index {} slot {}",
                    predicate.prop(),
                    self.name,
                    pos
                )));
            }
        }
        if constraints.order.is_ordered() && !self.capability.orderable {
            return Err(SombraError::IndexNotApplicable(format!(
                "index {} does not support ordered scans",
                self.name
            )));
        }
        Ok(())
    }
}

/// Ordering and value requirements of an index query.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IndexQueryConstraints {
    /// Requested order.
    pub order: IndexOrder,
    /// Whether the consumer reads values from the cursor.
    pub needs_values: bool,
}

impl IndexQueryConstraints {
    /// No order, no values.
    pub fn unconstrained() -> Self {
        Self::default()
    }

    /// Ordered scan with values.
    pub fn ordered(order: IndexOrder) -> Self {
        Self {
            order,
            needs_values: true,
        }
    }

    /// Sets whether values are needed.
    pub fn with_values(mut self, needs_values: bool) -> Self {
        self.needs_values = needs_values;
        self
    }

    /// Whether committed hits must carry exact values: the consumer reads
    /// them, or ordered results are merged on them.
    pub fn reports_values(&self) -> bool {
        self.needs_values || self.order.is_ordered()
    }
}
