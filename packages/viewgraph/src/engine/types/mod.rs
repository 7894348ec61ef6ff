mod path;
mod tuple;
mod value;

pub use path::AttributePath;
pub use tuple::{MultisetGroup, ResultTuple, SlotBinding, SlotRole, TupleShape, TupleSnapshot};
pub use value::{compare_values, Value, ValueMap, ValueSet};

use rustc_hash::FxHasher;
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::collections::{HashMap, HashSet};
use std::hash::BuildHasherDefault;

pub type FastMap<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher>>;
pub type FastSet<T> = HashSet<T, BuildHasherDefault<FxHasher>>;

/// Identity values of every enclosing view, outermost first.
pub type ParentKey = SmallVec<[Value; 4]>;

/// Optional parameters supplied with a view setting.
pub type OptionalParameters = FastMap<SmolStr, Value>;

pub(crate) fn render_key(key: &[Value]) -> String {
    key.iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("/")
}
