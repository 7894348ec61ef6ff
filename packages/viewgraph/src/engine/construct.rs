//! View construction strategies.
//!
//! A [`ConstructionStrategy`] is plain data computed once per view type and
//! constructor: the order in which assembled values arrive, how to move
//! them into declaration order, and which conversions apply on the way.
//! Strategies are cached process-wide in the [`StrategyRegistry`].

use super::accumulator::AccumulatorSpec;
use super::metamodel::{AttributeMapping, BasicType, ConstructorDescriptor, ElementType, ViewType};
use super::providers::ProviderRegistry;
use super::tracking::ViewRef;
use super::types::{AttributePath, ResultTuple, TupleSnapshot, Value};
use crate::error::{ConfigError, MaterializeError};
use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use rustc_hash::FxBuildHasher;
use smol_str::SmolStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Converts a raw slot value to a basic type. Returns the value unchanged
/// as the error when it can not be converted.
pub fn convert_basic(value: Value, ty: BasicType, primitive: bool) -> Result<Value, Value> {
    match (ty, value) {
        (ty, Value::Null) if primitive => Ok(zero(ty)),
        (_, Value::Null) => Ok(Value::Null),
        (BasicType::Any, value) => Ok(value),
        (BasicType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
        (BasicType::Bool, Value::Int(i)) if i == 0 || i == 1 => Ok(Value::Bool(i == 1)),
        (BasicType::Bool, Value::Str(s)) => match s.as_str() {
            "true" | "1" => Ok(Value::Bool(true)),
            "false" | "0" => Ok(Value::Bool(false)),
            _ => Err(Value::Str(s)),
        },
        (BasicType::Int, Value::Int(i)) => Ok(Value::Int(i)),
        (BasicType::Int, Value::Float(f)) if f.fract() == 0.0 && f.is_finite() => {
            Ok(Value::Int(f as i64))
        }
        (BasicType::Int, Value::Str(s)) => s.trim().parse().map(Value::Int).map_err(|_| Value::Str(s)),
        (BasicType::Float, Value::Float(f)) => Ok(Value::Float(f)),
        (BasicType::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
        (BasicType::Float, Value::Str(s)) => {
            s.trim().parse().map(Value::Float).map_err(|_| Value::Str(s))
        }
        (BasicType::String, Value::Str(s)) => Ok(Value::Str(s)),
        (_, other) => Err(other),
    }
}

fn zero(ty: BasicType) -> Value {
    match ty {
        BasicType::Bool => Value::Bool(false),
        BasicType::Int => Value::Int(0),
        BasicType::Float => Value::Float(0.0),
        BasicType::String => Value::Str(SmolStr::default()),
        BasicType::Any => Value::Null,
    }
}

/// Value of an attribute that was not fetched or had nothing to hold.
pub fn empty_attribute_value(mapping: &AttributeMapping) -> Value {
    match AccumulatorSpec::from_mapping(AttributePath::root(), mapping, false) {
        Some(spec) => spec.empty_value(),
        None => match mapping.element {
            ElementType::Basic {
                ty,
                primitive: true,
            } => zero(ty),
            _ => Value::Null,
        },
    }
}

fn basic_conversion(mapping: &AttributeMapping) -> Option<(BasicType, bool)> {
    match mapping.element {
        ElementType::Basic { ty, primitive } if !mapping.plurality.is_plural() => {
            Some((ty, primitive))
        }
        _ => None,
    }
}

/// Attribute positions of `view` in the order values are assembled: the id
/// first, then the attributes `base` declares, then the rest.
pub fn layout(view: &ViewType, base: Option<&ViewType>) -> Vec<usize> {
    let mut order: Vec<usize> = view.id_index().into_iter().collect();
    if let Some(base) = base {
        for attribute in &base.attributes {
            if let Some(i) = view.attribute_index(&attribute.name) {
                if !order.contains(&i) {
                    order.push(i);
                }
            }
        }
    }
    for i in 0..view.attributes.len() {
        if !order.contains(&i) {
            order.push(i);
        }
    }
    order
}

/// Picks the constructor a plan uses. Several constructors need a name
/// unless one of them is called `init`.
pub fn select_constructor<'v>(
    view: &'v ViewType,
    name: Option<&str>,
) -> Result<Option<&'v ConstructorDescriptor>, ConfigError> {
    match (name, view.constructors.len()) {
        (Some(name), _) => view
            .constructor(name)
            .map(Some)
            .ok_or_else(|| ConfigError::UnknownConstructor {
                view: view.name.clone(),
                name: SmolStr::new(name),
            }),
        (None, 0) => Ok(None),
        (None, 1) => Ok(view.constructors.first()),
        (None, count) => view
            .constructor("init")
            .map(Some)
            .ok_or_else(|| ConfigError::AmbiguousConstructor {
                view: view.name.clone(),
                count,
            }),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConstructionKind {
    /// Values arrive in declaration order, except that the id may have been
    /// moved to the front.
    Positional { id_position: Option<usize> },
    /// `permutation[p]` is the attribute index of the value at position `p`.
    Assignment { permutation: Vec<usize> },
    /// Arranged like `Assignment`, then passed through a named factory.
    Factory {
        name: SmolStr,
        permutation: Vec<usize>,
    },
    /// Built from an instance of another view type; `sources[i]` is the
    /// source attribute feeding target attribute `i`.
    Conversion { sources: Vec<Option<usize>> },
}

/// Where the values being constructed came from, for error reports.
pub struct ConstructContext<'a> {
    pub path: &'a AttributePath,
    /// Slot of each value followed by each argument, when it has one.
    pub slots: &'a [Option<usize>],
    pub tuple: &'a ResultTuple,
    pub providers: &'a ProviderRegistry,
}

#[derive(Debug)]
pub struct ConstructionStrategy {
    view_type: Arc<ViewType>,
    kind: ConstructionKind,
    layout: Vec<usize>,
    /// By assembly position.
    conversions: Vec<Option<(BasicType, bool)>>,
    arguments: Vec<(SmolStr, Option<(BasicType, bool)>)>,
    copies: Vec<usize>,
}

impl ConstructionStrategy {
    pub fn generate(
        view_type: &Arc<ViewType>,
        base: Option<&ViewType>,
        constructor: Option<&ConstructorDescriptor>,
    ) -> Self {
        let order = layout(view_type, base);
        let id_first = view_type.id_index().map(|id| {
            order[0] == id
                && order[1..]
                    .iter()
                    .copied()
                    .eq((0..order.len()).filter(|i| *i != id))
        });
        let kind = match constructor.and_then(|c| c.factory.clone()) {
            Some(name) => ConstructionKind::Factory {
                name,
                permutation: order.clone(),
            },
            None if order.iter().enumerate().all(|(p, i)| p == *i) => {
                ConstructionKind::Positional { id_position: None }
            }
            None if id_first == Some(true) => ConstructionKind::Positional {
                id_position: view_type.id_index(),
            },
            None => ConstructionKind::Assignment {
                permutation: order.clone(),
            },
        };

        ConstructionStrategy {
            conversions: order
                .iter()
                .map(|i| basic_conversion(&view_type.attributes[*i]))
                .collect(),
            arguments: constructor
                .map(|c| {
                    c.parameters
                        .iter()
                        .map(|p| (p.name.clone(), basic_conversion(p)))
                        .collect()
                })
                .unwrap_or_default(),
            copies: copies(view_type),
            view_type: view_type.clone(),
            kind,
            layout: order,
        }
    }

    pub fn conversion(source: &ViewType, target: &Arc<ViewType>) -> Self {
        let sources = target
            .attributes
            .iter()
            .map(|attribute| {
                source.attribute_index(&attribute.name).filter(|i| {
                    source.attributes[*i].plurality.is_plural() == attribute.plurality.is_plural()
                })
            })
            .collect();
        ConstructionStrategy {
            conversions: target.attributes.iter().map(basic_conversion).collect(),
            arguments: Vec::new(),
            copies: Vec::new(),
            view_type: target.clone(),
            kind: ConstructionKind::Conversion { sources },
            layout: (0..target.attributes.len()).collect(),
        }
    }

    pub fn kind(&self) -> &ConstructionKind {
        &self.kind
    }

    pub fn view_type(&self) -> &Arc<ViewType> {
        &self.view_type
    }

    /// Attribute positions in assembly order.
    pub fn layout(&self) -> &[usize] {
        &self.layout
    }

    /// Attribute index of the value assembled at `position`.
    pub fn attribute_at(&self, position: usize) -> usize {
        self.layout[position]
    }

    fn failure(&self, cx: &ConstructContext<'_>, message: String) -> MaterializeError {
        MaterializeError::Construction {
            view: self.view_type.name.clone(),
            path: cx.path.clone(),
            message,
            tuple: cx.tuple.snapshot(),
        }
    }

    fn convert(
        &self,
        cx: &ConstructContext<'_>,
        position: usize,
        name: &str,
        value: &mut Value,
        conversion: Option<(BasicType, bool)>,
    ) -> Result<(), MaterializeError> {
        if let Some((ty, primitive)) = conversion {
            *value = convert_basic(std::mem::take(value), ty, primitive).map_err(|found| {
                MaterializeError::TypeMismatch {
                    path: cx.path.child(name),
                    slot: cx.slots.get(position).copied().flatten().unwrap_or(position),
                    expected: SmolStr::new_static(ty.name()),
                    found: found.type_name(),
                    tuple: cx.tuple.snapshot(),
                }
            })?;
        }
        Ok(())
    }

    fn arrange(&self, mut values: Vec<Value>) -> Vec<Value> {
        match &self.kind {
            ConstructionKind::Positional { id_position: None }
            | ConstructionKind::Conversion { .. } => values,
            ConstructionKind::Positional {
                id_position: Some(position),
            } => {
                if !values.is_empty() {
                    let id = values.remove(0);
                    values.insert(*position, id);
                }
                values
            }
            ConstructionKind::Assignment { permutation }
            | ConstructionKind::Factory { permutation, .. } => {
                let mut arranged = vec![Value::Null; values.len()];
                for (position, value) in values.into_iter().enumerate() {
                    arranged[permutation[position]] = value;
                }
                arranged
            }
        }
    }

    /// Builds an instance from values in assembly order.
    pub fn construct(
        &self,
        mut values: Vec<Value>,
        mut arguments: Vec<Value>,
        cx: &ConstructContext<'_>,
    ) -> Result<ViewRef, MaterializeError> {
        let view = &self.view_type;
        if values.len() != self.layout.len() || arguments.len() != self.arguments.len() {
            return Err(self.failure(
                cx,
                format!(
                    "expected {} values and {} arguments, got {} and {}",
                    self.layout.len(),
                    self.arguments.len(),
                    values.len(),
                    arguments.len()
                ),
            ));
        }
        for (position, value) in values.iter_mut().enumerate() {
            let name = &view.attributes[self.layout[position]].name;
            self.convert(cx, position, name, value, self.conversions[position])?;
        }
        let offset = values.len();
        for (i, argument) in arguments.iter_mut().enumerate() {
            let (name, conversion) = &self.arguments[i];
            self.convert(cx, offset + i, name, argument, *conversion)?;
        }

        let mut values = self.arrange(values);
        if let ConstructionKind::Factory { name, .. } = &self.kind {
            let factory = cx
                .providers
                .factory(name)
                .ok_or_else(|| ConfigError::UnknownFactory {
                    view: view.name.clone(),
                    name: name.clone(),
                })?;
            values = factory
                .create(view, values, &arguments)
                .map_err(|e| self.failure(cx, format!("factory '{}' failed: {:#}", name, e)))?;
            if values.len() != view.attributes.len() {
                return Err(self.failure(
                    cx,
                    format!(
                        "factory '{}' returned {} values for {} attributes",
                        name,
                        values.len(),
                        view.attributes.len()
                    ),
                ));
            }
        }
        for &i in &self.copies {
            values[i] = values[i].deep_clone();
        }

        let instance = ViewRef::new(view.clone(), values, arguments);
        instance.adopt_children()?;
        Ok(instance)
    }

    /// Builds an instance of the target type from `source`, deep-copying
    /// every nested value.
    pub fn convert_from(&self, source: &ViewRef) -> Result<ViewRef, MaterializeError> {
        let ConstructionKind::Conversion { sources } = &self.kind else {
            return Err(MaterializeError::Construction {
                view: self.view_type.name.clone(),
                path: AttributePath::root(),
                message: "strategy does not convert between view types".to_string(),
                tuple: TupleSnapshot::default(),
            });
        };
        let source_values = source.values();
        let origin = ResultTuple::new(source_values.clone());
        let root = AttributePath::root();
        let providers = ProviderRegistry::default();
        let cx = ConstructContext {
            path: &root,
            slots: &[],
            tuple: &origin,
            providers: &providers,
        };

        let mut values = Vec::with_capacity(sources.len());
        for (i, (source_index, attribute)) in sources
            .iter()
            .zip(self.view_type.attributes.iter())
            .enumerate()
        {
            let mut value = match source_index {
                Some(s) => source_values[*s].deep_clone(),
                None => empty_attribute_value(attribute),
            };
            self.convert(&cx, i, &attribute.name, &mut value, self.conversions[i])?;
            values.push(value);
        }

        let instance = ViewRef::new(self.view_type.clone(), values, source.arguments());
        instance.adopt_children()?;
        Ok(instance)
    }
}

fn copies(view_type: &ViewType) -> Vec<usize> {
    view_type
        .attributes
        .iter()
        .enumerate()
        .filter(|(_, a)| a.copy_on_construct)
        .map(|(i, _)| i)
        .collect()
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StrategyKey {
    View {
        metamodel: u64,
        view: SmolStr,
        /// Declared type of the node the view is assembled in.
        base: Option<SmolStr>,
        constructor: Option<SmolStr>,
    },
    Conversion {
        metamodel: u64,
        source: SmolStr,
        target: SmolStr,
    },
}

/// Get-or-create cache of construction strategies. Reads take no lock;
/// generation for a missing key runs at most once.
pub struct StrategyRegistry {
    strategies: DashMap<StrategyKey, Arc<ConstructionStrategy>, FxBuildHasher>,
    generation: Mutex<()>,
    generated: AtomicUsize,
}

lazy_static! {
    static ref STRATEGIES: StrategyRegistry = StrategyRegistry::new();
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        StrategyRegistry {
            strategies: DashMap::with_hasher(FxBuildHasher),
            generation: Mutex::new(()),
            generated: AtomicUsize::new(0),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static StrategyRegistry {
        &STRATEGIES
    }

    pub fn get_or_create<F>(
        &self,
        key: StrategyKey,
        generate: F,
    ) -> Result<Arc<ConstructionStrategy>, ConfigError>
    where
        F: FnOnce() -> Result<ConstructionStrategy, ConfigError>,
    {
        if let Some(strategy) = self.strategies.get(&key) {
            return Ok(strategy.value().clone());
        }
        let _guard = self.generation.lock();
        if let Some(strategy) = self.strategies.get(&key) {
            return Ok(strategy.value().clone());
        }
        let strategy = Arc::new(generate()?);
        self.generated.fetch_add(1, Ordering::Relaxed);
        debug!(target: "viewgraph", ?key, kind = ?strategy.kind(), "generated construction strategy");
        self.strategies.insert(key, strategy.clone());
        Ok(strategy)
    }

    /// Number of strategies generated so far.
    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
