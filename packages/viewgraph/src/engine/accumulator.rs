//! Collection accumulation per parent.
//!
//! Elements arrive one at a time, tagged with the identity path of the view
//! that owns the collection. A parent's elements must arrive contiguously:
//! the accumulator holds one open parent at a time and rejects a parent key
//! that reappears after it was finished.
//!
//! On finish the elements go through, in order: null filtering, duplicate
//! handling, sorting, and index placement.

use super::metamodel::{AttributeMapping, InnerCollection, Plurality, SortSpec, Uniqueness};
use super::types::{
    compare_values, render_key, AttributePath, FastMap, FastSet, ParentKey, ResultTuple,
    TupleSnapshot, Value, ValueMap, ValueSet,
};
use crate::error::MaterializeError;
use indexmap::IndexMap;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerShape {
    List,
    Set,
    Map,
    MultiList(InnerCollection),
    MultiMap(InnerCollection),
}

impl ContainerShape {
    /// `None` for singular attributes.
    pub fn of(plurality: Plurality) -> Option<Self> {
        match plurality {
            Plurality::Singular => None,
            Plurality::List => Some(ContainerShape::List),
            Plurality::Set => Some(ContainerShape::Set),
            Plurality::Map => Some(ContainerShape::Map),
            Plurality::MultiList(inner) => Some(ContainerShape::MultiList(inner)),
            Plurality::MultiMap(inner) => Some(ContainerShape::MultiMap(inner)),
        }
    }

    pub fn empty_value(&self) -> Value {
        match self {
            ContainerShape::List | ContainerShape::MultiList(_) => Value::List(Vec::new()),
            ContainerShape::Set => Value::Set(ValueSet::default()),
            ContainerShape::Map | ContainerShape::MultiMap(_) => Value::Map(ValueMap::default()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccumulatorSpec {
    pub path: AttributePath,
    pub shape: ContainerShape,
    /// Lists only: elements carry their position.
    pub indexed: bool,
    pub sort: Option<SortSpec>,
    pub uniqueness: Uniqueness,
    pub filter_nulls: bool,
}

impl AccumulatorSpec {
    pub fn new(path: AttributePath, shape: ContainerShape) -> Self {
        AccumulatorSpec {
            path,
            shape,
            indexed: matches!(shape, ContainerShape::MultiList(_)),
            sort: None,
            uniqueness: Uniqueness::None,
            filter_nulls: true,
        }
    }

    /// `None` for singular attributes.
    pub fn from_mapping(
        path: AttributePath,
        mapping: &AttributeMapping,
        keep_null_elements: bool,
    ) -> Option<Self> {
        let shape = ContainerShape::of(mapping.plurality)?;
        let mut spec = AccumulatorSpec::new(path, shape);
        spec.indexed = match shape {
            ContainerShape::List => mapping.index.is_some(),
            ContainerShape::MultiList(_) => true,
            _ => false,
        };
        if let super::metamodel::CollectionOrdering::Sorted(sort) = &mapping.ordering {
            spec.sort = Some(sort.clone());
        }
        spec.uniqueness = mapping.uniqueness;
        spec.filter_nulls = !(keep_null_elements || mapping.keep_null_elements);
        Some(spec)
    }

    pub fn sorted(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn unique(mut self, uniqueness: Uniqueness) -> Self {
        self.uniqueness = uniqueness;
        self
    }

    pub fn keep_nulls(mut self) -> Self {
        self.filter_nulls = false;
        self
    }

    pub fn empty_value(&self) -> Value {
        self.shape.empty_value()
    }
}

/// One candidate element of a collection.
#[derive(Clone, Debug)]
pub struct Element<'r> {
    pub value: Value,
    /// List index or map key.
    pub key: Option<Value>,
    /// Position within a flattened multiset group.
    pub position: Option<usize>,
    /// Row the element was read from, for error reports.
    pub origin: Option<&'r ResultTuple>,
}

impl<'r> Element<'r> {
    pub fn new(value: Value) -> Self {
        Element {
            value,
            key: None,
            position: None,
            origin: None,
        }
    }

    pub fn keyed(value: Value, key: Value) -> Self {
        Element {
            key: Some(key),
            ..Element::new(value)
        }
    }

    pub fn at(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn from_row(mut self, origin: &'r ResultTuple) -> Self {
        self.origin = Some(origin);
        self
    }

    fn snapshot(&self) -> TupleSnapshot {
        self.origin.map(ResultTuple::snapshot).unwrap_or_default()
    }
}

/// Cumulative sizes of consecutive sub-collections in a flattened group.
/// Lookups resume from the last resolved segment, so ascending positions
/// resolve in amortized constant time.
#[derive(Clone, Debug, Default)]
pub struct SizeTable {
    ends: SmallVec<[usize; 8]>,
    last: usize,
}

impl SizeTable {
    pub fn new(sizes: &[usize]) -> Self {
        let mut total = 0;
        SizeTable {
            ends: sizes
                .iter()
                .map(|size| {
                    total += size;
                    total
                })
                .collect(),
            last: 0,
        }
    }

    pub fn segments(&self) -> usize {
        self.ends.len()
    }

    pub fn total(&self) -> usize {
        self.ends.last().copied().unwrap_or(0)
    }

    /// Segment holding the flat position, or `None` past the end.
    pub fn resolve(&mut self, position: usize) -> Option<usize> {
        if position >= self.total() {
            return None;
        }
        let start = if self.last == 0 {
            0
        } else {
            self.ends[self.last - 1]
        };
        if position < start {
            self.last = 0;
        }
        while self.ends[self.last] <= position {
            self.last += 1;
        }
        Some(self.last)
    }
}

struct OpenGroup<'r> {
    parent: ParentKey,
    elements: Vec<Element<'r>>,
    seen: FastSet<Value>,
    keyed: FastMap<Value, usize>,
    sizes: Option<SizeTable>,
}

impl<'r> OpenGroup<'r> {
    fn new(parent: ParentKey) -> Self {
        OpenGroup {
            parent,
            elements: Vec::new(),
            seen: FastSet::default(),
            keyed: FastMap::default(),
            sizes: None,
        }
    }
}

pub struct CollectionAccumulator<'s, 'r> {
    spec: &'s AccumulatorSpec,
    open: Option<OpenGroup<'r>>,
    finished: FastSet<ParentKey>,
}

impl<'s, 'r> CollectionAccumulator<'s, 'r> {
    pub fn new(spec: &'s AccumulatorSpec) -> Self {
        CollectionAccumulator {
            spec,
            open: None,
            finished: FastSet::default(),
        }
    }

    pub fn spec(&self) -> &AccumulatorSpec {
        self.spec
    }

    fn non_contiguous(&self, parent: &ParentKey) -> MaterializeError {
        MaterializeError::NonContiguousGroup {
            path: self.spec.path.clone(),
            key: render_key(parent),
        }
    }

    fn open_group(&mut self, parent: &ParentKey) -> Result<&mut OpenGroup<'r>, MaterializeError> {
        let current = matches!(&self.open, Some(group) if group.parent == *parent);
        if !current {
            if self.open.is_some() || self.finished.contains(parent) {
                return Err(self.non_contiguous(parent));
            }
            self.open = Some(OpenGroup::new(parent.clone()));
        }
        let spec = self.spec;
        self.open
            .as_mut()
            .ok_or_else(|| MaterializeError::NonContiguousGroup {
                path: spec.path.clone(),
                key: render_key(parent),
            })
    }

    /// Declares the sub-collection sizes of a flattened group; elements
    /// without a key are placed by their position.
    pub fn declare_sizes(&mut self, parent: &ParentKey, sizes: &[usize]) -> Result<(), MaterializeError> {
        self.open_group(parent)?.sizes = Some(SizeTable::new(sizes));
        Ok(())
    }

    pub fn add_tuple(&mut self, parent: &ParentKey, mut element: Element<'r>) -> Result<(), MaterializeError> {
        let spec = self.spec;
        let group = self.open_group(parent)?;
        if spec.filter_nulls && element.value.is_null() {
            return Ok(());
        }

        if element.key.is_none() {
            if let (Some(table), Some(position)) = (group.sizes.as_mut(), element.position) {
                let segment = table.resolve(position).ok_or_else(|| {
                    MaterializeError::IndexOutOfRange {
                        path: spec.path.clone(),
                        index: position.to_string(),
                        size: table.total(),
                        tuple: element.snapshot(),
                    }
                })?;
                element.key = Some(Value::Int(segment as i64));
            }
        }

        match spec.shape {
            ContainerShape::List if !spec.indexed => {
                if spec.uniqueness != Uniqueness::None && !group.seen.insert(element.value.clone()) {
                    return duplicate(spec, &element);
                }
            }
            ContainerShape::Set => {
                if !group.seen.insert(element.value.clone()) {
                    return duplicate(spec, &element);
                }
            }
            ContainerShape::List | ContainerShape::Map => {
                let key = require_key(spec, &element)?;
                if let Some(&at) = group.keyed.get(&key) {
                    if group.elements[at].value == element.value {
                        return Ok(());
                    }
                    return Err(MaterializeError::DuplicateKey {
                        path: spec.path.clone(),
                        key: key.to_string(),
                        tuple: element.snapshot(),
                    });
                }
                group.keyed.insert(key, group.elements.len());
            }
            ContainerShape::MultiList(_) | ContainerShape::MultiMap(_) => {
                require_key(spec, &element)?;
            }
        }
        group.elements.push(element);
        Ok(())
    }

    /// Closes the parent's group and returns its collection. A parent that
    /// never received elements gets an empty collection.
    pub fn finish(&mut self, parent: &ParentKey) -> Result<Value, MaterializeError> {
        let group = match self.open.take() {
            Some(group) if group.parent == *parent => group,
            other => {
                self.open = other;
                if !self.finished.insert(parent.clone()) {
                    return Err(self.non_contiguous(parent));
                }
                return Ok(self.spec.empty_value());
            }
        };
        self.finished.insert(group.parent.clone());
        build(self.spec, group)
    }
}

fn duplicate(spec: &AccumulatorSpec, element: &Element<'_>) -> Result<(), MaterializeError> {
    if spec.uniqueness == Uniqueness::Strict {
        return Err(MaterializeError::DuplicateElement {
            path: spec.path.clone(),
            element: element.value.to_string(),
            tuple: element.snapshot(),
        });
    }
    Ok(())
}

fn require_key(spec: &AccumulatorSpec, element: &Element<'_>) -> Result<Value, MaterializeError> {
    match &element.key {
        Some(key) if !key.is_null() => Ok(key.clone()),
        _ => Err(MaterializeError::IndexOutOfRange {
            path: spec.path.clone(),
            index: "null".to_string(),
            size: 0,
            tuple: element.snapshot(),
        }),
    }
}

fn position(spec: &AccumulatorSpec, element: &Element<'_>, size: usize) -> Result<usize, MaterializeError> {
    let key = element.key.as_ref();
    match key.and_then(Value::as_i64) {
        Some(i) if i >= 0 && (i as usize) < size => Ok(i as usize),
        _ => Err(MaterializeError::IndexOutOfRange {
            path: spec.path.clone(),
            index: key.map(|k| k.to_string()).unwrap_or_else(|| "null".to_string()),
            size,
            tuple: element.snapshot(),
        }),
    }
}

fn build(spec: &AccumulatorSpec, mut group: OpenGroup<'_>) -> Result<Value, MaterializeError> {
    if let Some(sort) = &spec.sort {
        let by_key = matches!(spec.shape, ContainerShape::Map | ContainerShape::MultiMap(_));
        group.elements.sort_by(|a, b| {
            if by_key {
                compare_sorted(sort, a.key.as_ref().unwrap_or(&a.value), b.key.as_ref().unwrap_or(&b.value))
            } else {
                compare_sorted(sort, &a.value, &b.value)
            }
        });
    }

    let elements = group.elements;
    let value = match spec.shape {
        ContainerShape::List if !spec.indexed => {
            Value::List(elements.into_iter().map(|e| e.value).collect())
        }
        ContainerShape::Set => Value::Set(elements.into_iter().map(|e| e.value).collect()),
        ContainerShape::List => {
            let size = elements.len();
            let mut slots: Vec<Option<Value>> = vec![None; size];
            for element in elements {
                let at = position(spec, &element, size)?;
                slots[at] = Some(element.value);
            }
            Value::List(slots.into_iter().map(Option::unwrap_or_default).collect())
        }
        ContainerShape::Map => Value::Map(
            elements
                .into_iter()
                .map(|e| (e.key.unwrap_or_default(), e.value))
                .collect(),
        ),
        ContainerShape::MultiList(inner) => {
            let size = match &group.sizes {
                Some(table) => table.segments(),
                None => {
                    let distinct: FastSet<&Value> = elements.iter().filter_map(|e| e.key.as_ref()).collect();
                    distinct.len()
                }
            };
            let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); size];
            for element in elements {
                let at = position(spec, &element, size)?;
                buckets[at].push(element.value);
            }
            Value::List(buckets.into_iter().map(|b| inner_collection(inner, b)).collect())
        }
        ContainerShape::MultiMap(inner) => {
            let mut buckets: IndexMap<Value, Vec<Value>, FxBuildHasher> = IndexMap::default();
            for element in elements {
                buckets
                    .entry(element.key.unwrap_or_default())
                    .or_default()
                    .push(element.value);
            }
            Value::Map(
                buckets
                    .into_iter()
                    .map(|(k, b)| (k, inner_collection(inner, b)))
                    .collect(),
            )
        }
    };
    Ok(value)
}

fn inner_collection(inner: InnerCollection, values: Vec<Value>) -> Value {
    match inner {
        InnerCollection::List => Value::List(values),
        InnerCollection::Set => Value::Set(values.into_iter().collect()),
    }
}

fn compare_sorted(sort: &SortSpec, a: &Value, b: &Value) -> Ordering {
    match sort {
        SortSpec::Natural => compare_values(a, b),
        SortSpec::Reverse => compare_values(b, a),
        SortSpec::Attribute {
            attribute,
            descending,
        } => {
            let field = AttributePath::new(attribute);
            let ordering = compare_values(&field_value(a, &field), &field_value(b, &field));
            if *descending {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}

/// Follows `field` through nested views; the empty path is the value itself.
pub fn field_value(value: &Value, field: &AttributePath) -> Value {
    let mut current = value.clone();
    for segment in field.segments() {
        current = match current.as_view().and_then(|view| view.get(segment)) {
            Some(next) => next,
            None => return Value::Null,
        };
    }
    current
}
