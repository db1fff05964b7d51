use std::cmp::Ordering;
use std::fmt;

/// Property value as stored in records and transaction state.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    /// Null value; also used for "no value".
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point number.
    Float(f64),
    /// Owned string.
    Str(String),
    /// Owned byte vector.
    Bytes(Vec<u8>),
}

/// Coarse value category; values of different groups never compare equal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ValueGroup {
    /// Booleans.
    Bool,
    /// Integers and floats.
    Number,
    /// Strings.
    Text,
    /// Byte arrays.
    Bytes,
    /// Null sorts last.
    NoValue,
}

impl PropValue {
    /// Returns the comparison group of the value.
    pub fn group(&self) -> ValueGroup {
        match self {
            PropValue::Null => ValueGroup::NoValue,
            PropValue::Bool(_) => ValueGroup::Bool,
            PropValue::Int(_) | PropValue::Float(_) => ValueGroup::Number,
            PropValue::Str(_) => ValueGroup::Text,
            PropValue::Bytes(_) => ValueGroup::Bytes,
        }
    }

    /// Returns true when the value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, PropValue::Null)
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Null => write!(f, "null"),
            PropValue::Bool(v) => write!(f, "{v}"),
            PropValue::Int(v) => write!(f, "{v}"),
            PropValue::Float(v) => write!(f, "{v}"),
            PropValue::Str(v) => write!(f, "{v}"),
            PropValue::Bytes(v) => write!(f, "bytes(len={})", v.len()),
        }
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        PropValue::Int(value)
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        PropValue::Str(value.to_owned())
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        PropValue::Bool(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        PropValue::Float(value)
    }
}

/// A value as reported by an index. Some index implementations cannot return
/// certain value types losslessly and report them as `Unknown`.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexValue {
    /// Value reproduced exactly by the index.
    Known(PropValue),
    /// Value has to be read from the store.
    Unknown,
}

impl IndexValue {
    /// Returns the known value, if any.
    pub fn known(&self) -> Option<&PropValue> {
        match self {
            IndexValue::Known(value) => Some(value),
            IndexValue::Unknown => None,
        }
    }

    /// Returns true when the slot still needs a store read.
    pub fn is_unknown(&self) -> bool {
        matches!(self, IndexValue::Unknown)
    }
}

/// Total order over property values.
///
/// Groups compare first; integers and floats compare numerically with integers
/// first on exact ties; floats use `total_cmp` so NaN has a stable position.
pub fn compare_values(left: &PropValue, right: &PropValue) -> Ordering {
    let by_group = left.group().cmp(&right.group());
    if by_group != Ordering::Equal {
        return by_group;
    }
    match (left, right) {
        (PropValue::Null, PropValue::Null) => Ordering::Equal,
        (PropValue::Bool(a), PropValue::Bool(b)) => a.cmp(b),
        (PropValue::Int(a), PropValue::Int(b)) => a.cmp(b),
        (PropValue::Float(a), PropValue::Float(b)) => a.total_cmp(b),
        (PropValue::Int(a), PropValue::Float(b)) => {
            (*a as f64).total_cmp(b).then(Ordering::Less)
        }
        (PropValue::Float(a), PropValue::Int(b)) => {
            a.total_cmp(&(*b as f64)).then(Ordering::Greater)
        }
        (PropValue::Str(a), PropValue::Str(b)) => a.cmp(b),
        (PropValue::Bytes(a), PropValue::Bytes(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

/// Lexicographic comparison of two value tuples using [`compare_values`].
pub fn compare_tuples(left: &[PropValue], right: &[PropValue]) -> Ordering {
    for (a, b) in left.iter().zip(right.iter()) {
        let ord = compare_values(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    left.len().cmp(&right.len())
}
