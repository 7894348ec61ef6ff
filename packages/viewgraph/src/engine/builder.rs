//! Turns the rows of one plan into view instances.
//!
//! Rows arrive grouped by root identity. Each group is assembled top-down:
//! singular subviews read the same rows as their parent, collections split
//! them by element identity, multiset slots carry their own nested rows.
//! Select-fetched correlations leave a placeholder and are filled in
//! batches once every root has been assembled.

use super::accumulator::{CollectionAccumulator, ContainerShape, Element};
use super::construct::{convert_basic, ConstructContext};
use super::correlation::{apply_limiter, CorrelationExecutor};
use super::providers::ProviderRegistry;
use super::template::{
    AttributeSource, BatchFetch, CollectionPlan, ElementPlan, MaterializationPlan, NestedPlan,
    NodePlan,
};
use super::tracking::ViewRef;
use super::transform::variant_of;
use super::types::{
    render_key, AttributePath, FastMap, FastSet, MultisetGroup, OptionalParameters, ParentKey,
    ResultTuple, Value,
};
use crate::error::MaterializeError;
use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxBuildHasher;
use smallvec::smallvec;
use smol_str::SmolStr;
use tracing::debug;

/// A select-fetched attribute waiting for its batch.
struct PendingFill {
    fetch: usize,
    target: ViewRef,
    attribute: usize,
    basis: Value,
}

/// One element read from the rows of a collection.
struct Gathered<'r> {
    key: Option<Value>,
    value: Value,
    position: usize,
    origin: &'r ResultTuple,
}

enum Resolved {
    Value(Value),
    /// Placeholder value; the real one arrives with batch `fetch`.
    Deferred { placeholder: Value, fetch: usize, basis: Value },
}

pub struct GraphBuilder<'p> {
    plan: &'p MaterializationPlan,
    providers: &'p ProviderRegistry,
    pending: Vec<PendingFill>,
}

fn is_absent(node: &NodePlan, row: &ResultTuple) -> bool {
    !node.identity.is_empty() && node.identity.iter().all(|slot| row.get(*slot).is_null())
}

fn identity_of(node: &NodePlan, row: &ResultTuple) -> ParentKey {
    node.identity.iter().map(|slot| row.get(*slot).clone()).collect()
}

fn prepare(
    row: &mut ResultTuple,
    nested: &NestedPlan,
    parameters: &OptionalParameters,
) -> Result<(), MaterializeError> {
    nested.shape.check(row)?;
    nested.pipeline.apply(row, parameters);
    Ok(())
}

/// Segment of each flattened row, expanded from declared sub-collection sizes.
fn row_segments(sizes: &[usize]) -> Vec<usize> {
    sizes
        .iter()
        .enumerate()
        .flat_map(|(segment, size)| std::iter::repeat(segment).take(*size))
        .collect()
}

/// Rows embedded in a multiset slot. Text is parsed as a JSON array of rows.
fn multiset_rows(
    value: &Value,
    path: &AttributePath,
    slot: usize,
    origin: &ResultTuple,
) -> Result<MultisetGroup, MaterializeError> {
    let mismatch = |found: SmolStr| MaterializeError::TypeMismatch {
        path: path.clone(),
        slot,
        expected: SmolStr::new_static("multiset"),
        found,
        tuple: origin.snapshot(),
    };
    match value {
        Value::Null => Ok(MultisetGroup::default()),
        Value::Multiset(group) => Ok(group.clone()),
        Value::List(items) => items
            .iter()
            .map(|item| match item {
                Value::List(values) => Ok(ResultTuple::new(values.clone())),
                other => Err(mismatch(other.type_name())),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(MultisetGroup::new),
        Value::Str(text) => {
            let parsed: serde_json::Value =
                serde_json::from_str(text).map_err(|_| mismatch(SmolStr::new_static("text")))?;
            let serde_json::Value::Array(rows) = parsed else {
                return Err(mismatch(SmolStr::new_static("text")));
            };
            rows.into_iter()
                .map(|row| ResultTuple::from_json(row).map_err(|_| mismatch(SmolStr::new_static("text"))))
                .collect::<Result<Vec<_>, _>>()
                .map(MultisetGroup::new)
        }
        other => Err(mismatch(other.type_name())),
    }
}

impl<'p> GraphBuilder<'p> {
    pub fn new(plan: &'p MaterializationPlan, providers: &'p ProviderRegistry) -> Self {
        GraphBuilder {
            plan,
            providers,
            pending: Vec::new(),
        }
    }

    /// Assembles one instance per root identity, in arrival order. Rows of
    /// a root must arrive contiguously; rows with a NULL root identity are
    /// skipped.
    pub fn build<I>(
        mut self,
        rows: I,
        executor: Option<&mut dyn CorrelationExecutor>,
    ) -> Result<Vec<ViewRef>, MaterializeError>
    where
        I: IntoIterator<Item = anyhow::Result<ResultTuple>>,
    {
        let plan = self.plan;
        let root = plan.root();
        let mut roots = Vec::new();
        let mut group: Vec<ResultTuple> = Vec::new();
        let mut current: Option<ParentKey> = None;
        let mut finished: FastSet<ParentKey> = FastSet::default();
        let mut row_count = 0usize;

        for row in rows {
            let mut row = row.map_err(MaterializeError::Source)?;
            plan.shape().check(&row)?;
            plan.pipeline().apply(&mut row, plan.parameters());
            row_count += 1;
            if is_absent(root, &row) {
                continue;
            }
            let key = identity_of(root, &row);
            if current.as_ref() != Some(&key) {
                if let Some(done) = current.take() {
                    roots.push(self.assemble_group(root, &group)?);
                    group.clear();
                    finished.insert(done);
                }
                if finished.contains(&key) {
                    return Err(MaterializeError::NonContiguousGroup {
                        path: root.path.clone(),
                        key: render_key(&key),
                    });
                }
                current = Some(key);
            }
            group.push(row);
        }
        if current.is_some() {
            roots.push(self.assemble_group(root, &group)?);
        }
        debug!(
            target: "viewgraph",
            view = %plan.view(),
            rows = row_count,
            roots = roots.len(),
            pending = self.pending.len(),
            "assembled root instances"
        );

        self.run_batches(executor)?;
        Ok(roots)
    }

    fn assemble_group(&mut self, root: &'p NodePlan, group: &[ResultTuple]) -> Result<ViewRef, MaterializeError> {
        let rows: Vec<&ResultTuple> = group.iter().collect();
        self.assemble(root, &rows, &ParentKey::new(), self.plan.fanout())
    }

    /// Builds the instance of `node` from rows that all belong to it.
    fn assemble(
        &mut self,
        node: &'p NodePlan,
        rows: &[&ResultTuple],
        parent: &ParentKey,
        fanout: bool,
    ) -> Result<ViewRef, MaterializeError> {
        let first = rows[0];
        let variant = node
            .discriminator
            .map(|slot| variant_of(first.get(slot)))
            .filter(|k| *k < node.variants.len())
            .unwrap_or(0);
        let variant = &node.variants[variant];

        let mut key = parent.clone();
        key.extend(node.identity.iter().map(|slot| first.get(*slot).clone()));

        let mut values = Vec::with_capacity(variant.attributes.len());
        let mut deferred = Vec::new();
        for (position, attribute) in variant.attributes.iter().enumerate() {
            match self.resolve(&attribute.source, &attribute.path, rows, &key, fanout)? {
                Resolved::Value(value) => values.push(value),
                Resolved::Deferred {
                    placeholder,
                    fetch,
                    basis,
                } => {
                    values.push(placeholder);
                    if !basis.is_null() {
                        deferred.push((variant.strategy.attribute_at(position), fetch, basis));
                    }
                }
            }
        }
        let mut arguments = Vec::with_capacity(variant.arguments.len());
        for argument in &variant.arguments {
            match self.resolve(&argument.source, &argument.path, rows, &key, fanout)? {
                Resolved::Value(value) => arguments.push(value),
                Resolved::Deferred { .. } => {
                    return Err(MaterializeError::Construction {
                        view: node.view_name().clone(),
                        path: argument.path.clone(),
                        message: "constructor argument is select-fetched".to_string(),
                        tuple: first.snapshot(),
                    })
                }
            }
        }

        let cx = ConstructContext {
            path: &node.path,
            slots: &variant.slots,
            tuple: first,
            providers: self.providers,
        };
        let instance = variant.strategy.construct(values, arguments, &cx)?;
        for (attribute, fetch, basis) in deferred {
            self.pending.push(PendingFill {
                fetch,
                target: instance.clone(),
                attribute,
                basis,
            });
        }
        Ok(instance)
    }

    fn resolve(
        &mut self,
        source: &'p AttributeSource,
        path: &AttributePath,
        rows: &[&ResultTuple],
        parent: &ParentKey,
        fanout: bool,
    ) -> Result<Resolved, MaterializeError> {
        let first = rows[0];
        let value = match source {
            AttributeSource::Slot { slot } => first.get(*slot).clone(),
            AttributeSource::Subview(node) => {
                if is_absent(node, first) {
                    Value::Null
                } else {
                    Value::View(self.assemble(node, rows, parent, fanout)?)
                }
            }
            AttributeSource::Collection(collection) => self.collection(collection, rows, parent, fanout)?,
            AttributeSource::Multiset { slot, nested } => {
                let group = multiset_rows(first.get(*slot), path, *slot, first)?;
                self.nested(nested, group, parent, path)?
            }
            AttributeSource::Batched { basis, fetch } => {
                let placeholder = self.plan.batches()[*fetch]
                    .nested
                    .collection
                    .as_ref()
                    .map(|spec| spec.empty_value())
                    .unwrap_or(Value::Null);
                return Ok(Resolved::Deferred {
                    placeholder,
                    fetch: *fetch,
                    basis: first.get(*basis).clone(),
                });
            }
            AttributeSource::Unfetched { container } => container
                .map(|shape| shape.empty_value())
                .unwrap_or(Value::Null),
        };
        Ok(Resolved::Value(value))
    }

    /// Reads the elements of a collection from `rows`. Joined rows may be
    /// padding for an empty collection and carry no element. With
    /// `segments`, rows of different sub-collections never merge.
    #[allow(clippy::too_many_arguments)]
    fn gather<'r>(
        &mut self,
        element: &'p ElementPlan,
        index: Option<usize>,
        rows: &[&'r ResultTuple],
        parent: &ParentKey,
        fanout: bool,
        joined: bool,
        segments: Option<&[usize]>,
        path: &AttributePath,
    ) -> Result<Vec<Gathered<'r>>, MaterializeError> {
        let segment_of = |position: usize| segments.and_then(|s| s.get(position).copied());
        let mut out = Vec::new();
        match element {
            ElementPlan::Basic { slot, ty, primitive } => {
                let mut seen: FastSet<(Option<usize>, Value, Value)> = FastSet::default();
                for (position, row) in rows.iter().enumerate() {
                    let key = index.map(|i| row.get(i).clone());
                    let raw = row.get(*slot);
                    if joined && raw.is_null() && key.as_ref().map_or(true, Value::is_null) {
                        continue;
                    }
                    if fanout
                        && !seen.insert((segment_of(position), key.clone().unwrap_or_default(), raw.clone()))
                    {
                        continue;
                    }
                    let value = convert_basic(raw.clone(), *ty, *primitive).map_err(|found| {
                        MaterializeError::TypeMismatch {
                            path: path.clone(),
                            slot: *slot,
                            expected: SmolStr::new_static(ty.name()),
                            found: found.type_name(),
                            tuple: row.snapshot(),
                        }
                    })?;
                    out.push(Gathered {
                        key,
                        value,
                        position,
                        origin: *row,
                    });
                }
            }
            ElementPlan::View(node) => {
                type GroupKey = (Option<usize>, Option<Value>, ParentKey);
                let mut groups: IndexMap<GroupKey, (usize, Vec<&'r ResultTuple>), FxBuildHasher> =
                    IndexMap::default();
                for (position, row) in rows.iter().enumerate() {
                    if is_absent(node, row) {
                        continue;
                    }
                    let key = index.map(|i| row.get(i).clone());
                    let identity = if node.identity.is_empty() {
                        smallvec![Value::Int(position as i64)]
                    } else {
                        identity_of(node, row)
                    };
                    groups
                        .entry((segment_of(position), key, identity))
                        .or_insert_with(|| (position, Vec::new()))
                        .1
                        .push(*row);
                }
                for ((_, key, _), (position, members)) in groups {
                    let view = self.assemble(node, &members, parent, fanout)?;
                    out.push(Gathered {
                        key,
                        value: Value::View(view),
                        position,
                        origin: members[0],
                    });
                }
            }
        }
        Ok(out)
    }

    fn collection(
        &mut self,
        plan: &'p CollectionPlan,
        rows: &[&ResultTuple],
        parent: &ParentKey,
        fanout: bool,
    ) -> Result<Value, MaterializeError> {
        let gathered = self.gather(&plan.element, plan.index, rows, parent, fanout, true, None, &plan.spec.path)?;
        let mut accumulator = CollectionAccumulator::new(&plan.spec);
        // unkeyed joined rows of one parent form a single sub-collection
        let segmented = plan.index.is_none() && matches!(plan.spec.shape, ContainerShape::MultiList(_));
        if segmented && !gathered.is_empty() {
            accumulator.declare_sizes(parent, &[gathered.len()])?;
        }
        for (position, item) in gathered.into_iter().enumerate() {
            let element = match item.key {
                Some(key) => Element::keyed(item.value, key),
                None if segmented => Element::new(item.value).at(position),
                None => Element::new(item.value),
            };
            accumulator.add_tuple(parent, element.from_row(item.origin))?;
        }
        accumulator.finish(parent)
    }

    fn nested(
        &mut self,
        nested: &'p NestedPlan,
        group: MultisetGroup,
        parent: &ParentKey,
        path: &AttributePath,
    ) -> Result<Value, MaterializeError> {
        let sizes: Option<Vec<usize>> = group.sizes().map(<[usize]>::to_vec);
        let mut rows: Vec<ResultTuple> = group.rows().to_vec();
        for row in rows.iter_mut() {
            prepare(row, nested, self.plan.parameters())?;
        }
        let refs: Vec<&ResultTuple> = rows.iter().collect();
        let multi_list = matches!(
            nested.collection.as_ref().map(|spec| spec.shape),
            Some(ContainerShape::MultiList(_))
        );
        let segments = match &sizes {
            Some(sizes) if multi_list => Some(row_segments(sizes)),
            _ => None,
        };
        let gathered = self.gather(
            &nested.element,
            None,
            &refs,
            parent,
            nested.fanout,
            false,
            segments.as_deref(),
            path,
        )?;

        let Some(spec) = &nested.collection else {
            return Ok(gathered.into_iter().next().map(|g| g.value).unwrap_or(Value::Null));
        };
        let mut accumulator = CollectionAccumulator::new(spec);
        if multi_list {
            // positions are row positions, so one undeclared segment spans every row
            match &sizes {
                Some(sizes) => accumulator.declare_sizes(parent, sizes)?,
                None if !gathered.is_empty() => accumulator.declare_sizes(parent, &[refs.len()])?,
                None => {}
            }
        }
        for item in gathered {
            accumulator.add_tuple(parent, Element::new(item.value).at(item.position).from_row(item.origin))?;
        }
        accumulator.finish(parent)
    }

    fn run_batches(&mut self, mut executor: Option<&mut dyn CorrelationExecutor>) -> Result<(), MaterializeError> {
        let plan = self.plan;
        while !self.pending.is_empty() {
            let mut by_fetch: IndexMap<usize, Vec<PendingFill>, FxBuildHasher> = IndexMap::default();
            for fill in std::mem::take(&mut self.pending) {
                by_fetch.entry(fill.fetch).or_default().push(fill);
            }
            for (fetch, fills) in by_fetch {
                let batch = &plan.batches()[fetch];
                let executor = executor
                    .as_deref_mut()
                    .ok_or_else(|| MaterializeError::MissingExecutor {
                        path: batch.path.clone(),
                    })?;
                self.run_batch(batch, fills, executor)?;
            }
        }
        Ok(())
    }

    fn run_batch(
        &mut self,
        batch: &'p BatchFetch,
        fills: Vec<PendingFill>,
        executor: &mut dyn CorrelationExecutor,
    ) -> Result<(), MaterializeError> {
        let nested = &batch.nested;
        let basis: IndexSet<Value, FxBuildHasher> = fills.iter().map(|f| f.basis.clone()).collect();
        let basis: Vec<Value> = basis.into_iter().collect();

        let mut results: FastMap<Value, Vec<ResultTuple>> = FastMap::default();
        for chunk in basis.chunks(batch.batch_size) {
            debug!(
                target: "viewgraph",
                path = %batch.path,
                entity = %nested.query.entity,
                basis = chunk.len(),
                "fetching correlated batch"
            );
            let rows = executor
                .execute(&nested.query, chunk)
                .map_err(MaterializeError::Source)?;
            for mut row in rows {
                prepare(&mut row, nested, self.plan.parameters())?;
                results.entry(row.get(0).clone()).or_default().push(row);
            }
        }

        for fill in fills {
            let rows: Vec<&ResultTuple> = results
                .get(&fill.basis)
                .map(|rows| rows.iter().collect())
                .unwrap_or_default();
            let parent: ParentKey = smallvec![fill.basis.clone()];
            let gathered = self.gather(
                &nested.element,
                None,
                &rows,
                &parent,
                nested.fanout,
                false,
                None,
                &batch.path,
            )?;
            let mut values: Vec<Value> = gathered.into_iter().map(|g| g.value).collect();
            if let Some(limiter) = &nested.query.limiter {
                apply_limiter(limiter, &mut values);
            }
            let value = match &nested.collection {
                Some(spec) => {
                    let mut accumulator = CollectionAccumulator::new(spec);
                    if let ContainerShape::MultiList(_) = spec.shape {
                        if !values.is_empty() {
                            accumulator.declare_sizes(&parent, &[values.len()])?;
                        }
                    }
                    for (position, value) in values.into_iter().enumerate() {
                        accumulator.add_tuple(&parent, Element::new(value).at(position))?;
                    }
                    accumulator.finish(&parent)?
                }
                None => values.into_iter().next().unwrap_or(Value::Null),
            };
            fill.target.fill_deferred(fill.attribute, value)?;
        }
        Ok(())
    }
}
