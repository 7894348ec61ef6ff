use super::tuple::MultisetGroup;
use crate::engine::tracking::ViewRef;
use indexmap::{IndexMap, IndexSet};
use rustc_hash::{FxBuildHasher, FxHasher};
use serde_json::json;
use smol_str::SmolStr;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

pub type ValueSet = IndexSet<Value, FxBuildHasher>;
pub type ValueMap = IndexMap<Value, Value, FxBuildHasher>;

/// A materialized value: a raw slot value, a constructed view, or a collection.
///
/// Floats compare and hash by bit pattern so values can key sets and maps.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(SmolStr),
    /// Rows of a nested correlation embedded in a single slot.
    Multiset(MultisetGroup),
    View(ViewRef),
    List(Vec<Value>),
    Set(ValueSet),
    Map(ValueMap),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view of the value; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_view(&self) -> Option<&ViewRef> {
        match self {
            Value::View(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&ValueSet> {
        match self {
            Value::Set(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn as_multiset(&self) -> Option<&MultisetGroup> {
        match self {
            Value::Multiset(group) => Some(group),
            _ => None,
        }
    }

    /// Element count for collections, `None` for everything else.
    pub fn collection_len(&self) -> Option<usize> {
        match self {
            Value::List(items) => Some(items.len()),
            Value::Set(items) => Some(items.len()),
            Value::Map(entries) => Some(entries.len()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> SmolStr {
        match self {
            Value::Null => SmolStr::new_static("null"),
            Value::Bool(_) => SmolStr::new_static("bool"),
            Value::Int(_) => SmolStr::new_static("int"),
            Value::Float(_) => SmolStr::new_static("float"),
            Value::Str(_) => SmolStr::new_static("string"),
            Value::Multiset(_) => SmolStr::new_static("multiset"),
            Value::View(v) => SmolStr::new(format!("view<{}>", v.type_name())),
            Value::List(_) => SmolStr::new_static("list"),
            Value::Set(_) => SmolStr::new_static("set"),
            Value::Map(_) => SmolStr::new_static("map"),
        }
    }

    /// Copies collections and views recursively so the result shares no
    /// mutable state with `self`.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::View(v) => Value::View(v.deep_clone()),
            Value::List(items) => Value::List(items.iter().map(Value::deep_clone).collect()),
            Value::Set(items) => Value::Set(items.iter().map(Value::deep_clone).collect()),
            Value::Map(entries) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.deep_clone(), v.deep_clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Visits every view directly held by this value, descending into
    /// collections but not into the views themselves.
    pub fn for_each_view<F: FnMut(&ViewRef)>(&self, f: &mut F) {
        match self {
            Value::View(v) => f(v),
            Value::List(items) => items.iter().for_each(|item| item.for_each_view(f)),
            Value::Set(items) => items.iter().for_each(|item| item.for_each_view(f)),
            Value::Map(entries) => entries.iter().for_each(|(k, v)| {
                k.for_each_view(f);
                v.for_each_view(f);
            }),
            _ => {}
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => json!(b),
            Value::Int(i) => json!(i),
            Value::Float(f) => json!(f),
            Value::Str(s) => json!(s.as_str()),
            Value::Multiset(group) => serde_json::Value::Array(
                group
                    .rows()
                    .iter()
                    .map(|row| {
                        serde_json::Value::Array(row.values().iter().map(Value::to_json).collect())
                    })
                    .collect(),
            ),
            Value::View(v) => v.to_json(),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Set(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Value::Str(s) => s.to_string(),
                            other => other.to_string(),
                        };
                        (key, v.to_json())
                    })
                    .collect(),
            ),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Multiset(a), Value::Multiset(b)) => a == b,
            (Value::View(a), Value::View(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => state.write_u8(0),
            Value::Bool(b) => {
                state.write_u8(1);
                state.write_u8(*b as u8);
            }
            Value::Int(i) => {
                state.write_u8(2);
                state.write_i64(*i);
            }
            Value::Float(f) => {
                state.write_u8(3);
                state.write_u64(f.to_bits());
            }
            Value::Str(s) => {
                state.write_u8(4);
                state.write(s.as_bytes());
            }
            Value::Multiset(group) => {
                state.write_u8(5);
                group.hash(state);
            }
            Value::View(v) => {
                state.write_u8(6);
                v.hash(state);
            }
            Value::List(items) => {
                state.write_u8(7);
                items.hash(state);
            }
            // sets and maps compare without regard to order
            Value::Set(items) => {
                state.write_u8(8);
                state.write_u64(unordered_hash(items.iter()));
            }
            Value::Map(entries) => {
                state.write_u8(9);
                state.write_u64(unordered_hash(entries.iter()));
            }
        }
    }
}

fn unordered_hash<T: Hash>(items: impl Iterator<Item = T>) -> u64 {
    items
        .map(|item| {
            let mut hasher = FxHasher::default();
            item.hash(&mut hasher);
            hasher.finish()
        })
        .fold(0u64, u64::wrapping_add)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "'{}'", s),
            Value::Multiset(group) => write!(f, "multiset[{} rows]", group.rows().len()),
            Value::View(v) => write!(f, "{}", v),
            Value::List(items) => write_items(f, "[", "]", items.iter()),
            Value::Set(items) => write_items(f, "{", "}", items.iter()),
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
        }
    }
}

fn write_items<'a>(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    close: &str,
    items: impl Iterator<Item = &'a Value>,
) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    f.write_str(close)
}

/// Total order used for sorted collections and limiter ordering.
/// Mixed types order by type rank; integers and floats compare numerically.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).total_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.total_cmp(&(*y as f64)),
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        (Value::View(x), Value::View(y)) => x.compare(y),
        (Value::List(x), Value::List(y)) => {
            let len_cmp = x.len().cmp(&y.len());
            if len_cmp != Ordering::Equal {
                return len_cmp;
            }
            for (ix, iy) in x.iter().zip(y.iter()) {
                let cmp = compare_values(ix, iy);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            Ordering::Equal
        }
        (Value::Set(x), Value::Set(y)) => x.len().cmp(&y.len()),
        (Value::Map(x), Value::Map(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::Str(_) => 3,
        Value::View(_) => 4,
        Value::List(_) => 5,
        Value::Set(_) => 6,
        Value::Map(_) => 7,
        Value::Multiset(_) => 8,
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::Str(SmolStr::from(s)),
            serde_json::Value::Array(arr) => {
                Value::List(arr.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => Value::Map(
                obj.into_iter()
                    .map(|(k, v)| (Value::Str(SmolStr::from(k)), Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(SmolStr::new(s))
    }
}

impl From<SmolStr> for Value {
    fn from(s: SmolStr) -> Self {
        Value::Str(s)
    }
}

impl From<ViewRef> for Value {
    fn from(v: ViewRef) -> Self {
        Value::View(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
