//! Plan building.
//!
//! A [`MaterializationPlan`] is derived once per view setting. It fixes the
//! tuple shape, the query fragments the query engine needs to fill it, the
//! per-row transform pipeline, and a tree of [`NodePlan`]s telling the
//! graph builder where every attribute of every nested view is read from.
//! Every configuration problem surfaces here, never while rows are read.

use super::accumulator::{AccumulatorSpec, ContainerShape};
use super::construct::{select_constructor, ConstructionStrategy, StrategyKey, StrategyRegistry};
use super::correlation::{resolve_correlation, CorrelatedQuery, BATCH_BASIS_PARAMETER};
use super::mapping::{
    attribute_alias, element_expression, index_expression, is_plain_path, key_alias,
    prefix_expression, textual, JoinFragment, QueryFragments, SlotMapper,
};
use super::metamodel::{
    AttributeMapping, BasicType, ConstructorDescriptor, ElementType, FetchStrategy, MappingKind,
    Metamodel, ViewType,
};
use super::providers::ProviderRegistry;
use super::transform::{Candidate, TuplePipeline, TupleTransform};
use super::types::{
    AttributePath, FastMap, OptionalParameters, SlotBinding, SlotRole, TupleShape, Value,
};
use crate::config::MaterializerConfig;
use crate::error::ConfigError;
use indexmap::IndexMap;
use smallvec::{smallvec, SmallVec};
use smol_str::SmolStr;
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::debug;

/// What to materialize: a view type, optionally restricted to some
/// attribute paths, with the parameters its mappings may refer to.
#[derive(Clone, Debug, Default)]
pub struct ViewSetting {
    pub view: SmolStr,
    pub constructor: Option<SmolStr>,
    /// Attribute paths to fetch; empty fetches everything.
    pub fetches: Vec<AttributePath>,
    pub parameters: OptionalParameters,
}

impl ViewSetting {
    pub fn new(view: &str) -> Self {
        ViewSetting {
            view: SmolStr::new(view),
            ..ViewSetting::default()
        }
    }

    pub fn with_constructor(mut self, name: &str) -> Self {
        self.constructor = Some(SmolStr::new(name));
        self
    }

    pub fn fetching(mut self, paths: &[&str]) -> Self {
        self.fetches.extend(paths.iter().map(|p| AttributePath::new(p)));
        self
    }

    pub fn with_parameter(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.parameters.insert(SmolStr::new(name), value.into());
        self
    }
}

/// Attribute paths still to fetch below the current view.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchFilter {
    paths: Vec<AttributePath>,
}

impl FetchFilter {
    pub fn new(paths: Vec<AttributePath>) -> Self {
        FetchFilter { paths }
    }

    pub fn all() -> Self {
        FetchFilter::default()
    }

    pub fn allows(&self, attribute: &str) -> bool {
        self.paths.is_empty()
            || self
                .paths
                .iter()
                .any(|p| p.segments().first().is_some_and(|s| s == attribute))
    }

    /// Filter for the view behind `attribute`. Naming the attribute itself
    /// fetches what the attribute declares.
    pub fn descend(&self, attribute: &str, declared: &[AttributePath]) -> FetchFilter {
        let mut nested = Vec::new();
        for path in &self.paths {
            if let Some((head, rest)) = path.segments().split_first() {
                if head != attribute {
                    continue;
                }
                if rest.is_empty() {
                    return FetchFilter::new(declared.to_vec());
                }
                nested.push(AttributePath(rest.to_vec()));
            }
        }
        if nested.is_empty() {
            FetchFilter::new(declared.to_vec())
        } else {
            FetchFilter::new(nested)
        }
    }
}

#[derive(Clone, Debug)]
pub enum ElementPlan {
    Basic {
        slot: usize,
        ty: BasicType,
        primitive: bool,
    },
    View(Box<NodePlan>),
}

/// Plural attribute merged from the rows of its parent.
#[derive(Clone, Debug)]
pub struct CollectionPlan {
    pub spec: AccumulatorSpec,
    pub element: ElementPlan,
    /// Slot holding the list index or map key.
    pub index: Option<usize>,
}

/// Rows of a correlated query, nested into one slot or fetched in batches.
#[derive(Clone, Debug)]
pub struct NestedPlan {
    pub query: CorrelatedQuery,
    pub shape: TupleShape,
    pub pipeline: TuplePipeline,
    pub element: ElementPlan,
    /// `None` for singular attributes, which take the first element.
    pub collection: Option<AccumulatorSpec>,
    pub fanout: bool,
}

#[derive(Clone, Debug)]
pub struct BatchFetch {
    pub path: AttributePath,
    pub nested: NestedPlan,
    pub batch_size: usize,
}

#[derive(Clone, Debug)]
pub enum AttributeSource {
    Slot { slot: usize },
    Subview(Box<NodePlan>),
    Collection(Box<CollectionPlan>),
    Multiset { slot: usize, nested: Box<NestedPlan> },
    /// Filled after the outer rows are assembled; `fetch` indexes
    /// [`MaterializationPlan::batches`].
    Batched { basis: usize, fetch: usize },
    /// Not fetched: NULL, or an empty collection of this shape.
    Unfetched { container: Option<ContainerShape> },
}

#[derive(Clone, Debug)]
pub struct AttributePlan {
    pub name: SmolStr,
    pub path: AttributePath,
    pub source: AttributeSource,
}

/// How one concrete view type of a node is assembled.
#[derive(Clone, Debug)]
pub struct VariantPlan {
    pub strategy: Arc<ConstructionStrategy>,
    /// In the strategy's layout order.
    pub attributes: Vec<AttributePlan>,
    pub arguments: Vec<AttributePlan>,
    /// Slot of each attribute followed by each argument, when it has one.
    pub slots: Vec<Option<usize>>,
}

#[derive(Clone, Debug)]
pub struct NodePlan {
    pub path: AttributePath,
    /// Slots whose values identify one instance. All NULL means no instance.
    pub identity: Vec<usize>,
    pub discriminator: Option<usize>,
    /// The declared type first, then its subtypes.
    pub variants: Vec<VariantPlan>,
}

impl NodePlan {
    pub fn view_name(&self) -> &SmolStr {
        &self.variants[0].strategy.view_type().name
    }
}

#[derive(Clone, Debug)]
pub struct MaterializationPlan {
    view: SmolStr,
    root: NodePlan,
    shape: TupleShape,
    fragments: QueryFragments,
    pipeline: TuplePipeline,
    fanout: bool,
    batches: Vec<BatchFetch>,
    parameters: OptionalParameters,
}

impl MaterializationPlan {
    pub fn build(
        metamodel: &Metamodel,
        providers: &ProviderRegistry,
        config: &MaterializerConfig,
        strategies: &StrategyRegistry,
        setting: &ViewSetting,
    ) -> Result<Self, ConfigError> {
        metamodel.view(&setting.view, "view setting")?;
        let mut builder = PlanBuilder {
            metamodel,
            providers,
            config,
            strategies,
            parameters: &setting.parameters,
            root_alias: config.root_alias.to_string(),
            batches: Vec::new(),
        };
        let mut sb = ShapeBuilder::new(&setting.parameters, false);
        let root = builder.plan_node(
            &mut sb,
            &NodeContext {
                view: setting.view.clone(),
                path: AttributePath::root(),
                prefix: config.root_alias.to_string(),
                alias: None,
                fetches: FetchFilter::new(setting.fetches.clone()),
                constructor: setting.constructor.clone(),
            },
        )?;
        let (shape, mut fragments, pipeline, fanout) = sb.finish();
        bind_parameters(&mut fragments, &setting.parameters);
        let batches = builder.batches;

        debug!(
            target: "viewgraph",
            view = %setting.view,
            slots = shape.len(),
            joins = fragments.joins.len(),
            batches = batches.len(),
            fanout,
            "built materialization plan"
        );
        Ok(MaterializationPlan {
            view: setting.view.clone(),
            root,
            shape,
            fragments,
            pipeline,
            fanout,
            batches,
            parameters: setting.parameters.clone(),
        })
    }

    pub fn view(&self) -> &SmolStr {
        &self.view
    }

    pub fn root(&self) -> &NodePlan {
        &self.root
    }

    pub fn shape(&self) -> &TupleShape {
        &self.shape
    }

    pub fn fragments(&self) -> &QueryFragments {
        &self.fragments
    }

    pub fn pipeline(&self) -> &TuplePipeline {
        &self.pipeline
    }

    /// Two independent plural joins multiply the rows of a parent.
    pub fn fanout(&self) -> bool {
        self.fanout
    }

    pub fn batches(&self) -> &[BatchFetch] {
        &self.batches
    }

    pub fn parameters(&self) -> &OptionalParameters {
        &self.parameters
    }
}

fn bind_parameters(fragments: &mut QueryFragments, parameters: &OptionalParameters) {
    let required: Vec<SmolStr> = fragments.parameters.required().cloned().collect();
    for name in required {
        if let Some(value) = parameters.get(&name) {
            fragments.parameters.bind(name, value.clone());
        }
    }
}

/// Accumulates the slots of one tuple shape.
struct ShapeBuilder<'p> {
    shape: TupleShape,
    fragments: QueryFragments,
    parameters: &'p OptionalParameters,
    parameter_slots: Vec<(usize, SmolStr)>,
    consumed: Vec<(usize, usize)>,
    constraints: Vec<TupleTransform>,
    /// Projected expression (or `:parameter`) to its first slot.
    projected: FastMap<String, usize>,
    plural_joins: Vec<AttributePath>,
    textual: bool,
}

impl<'p> ShapeBuilder<'p> {
    fn new(parameters: &'p OptionalParameters, textual: bool) -> Self {
        ShapeBuilder {
            shape: TupleShape::default(),
            fragments: QueryFragments::default(),
            parameters,
            parameter_slots: Vec::new(),
            consumed: Vec::new(),
            constraints: Vec::new(),
            projected: FastMap::default(),
            plural_joins: Vec::new(),
            textual,
        }
    }

    fn project(&mut self, binding: SlotBinding, mapper: SlotMapper) -> Result<usize, ConfigError> {
        mapper.apply(&mut self.fragments, self.parameters)?;
        Ok(self.shape.push(binding))
    }

    /// Projects a duplicate as a consumed slot and hands out the first one.
    fn reuse(&mut self, key: &str) -> Result<Option<usize>, ConfigError> {
        let Some(&canonical) = self.projected.get(key) else {
            return Ok(None);
        };
        let slot = self.project(SlotBinding::Consumed { into: canonical }, SlotMapper::Consumed)?;
        self.consumed.push((slot, canonical));
        Ok(Some(canonical))
    }

    fn expression(
        &mut self,
        path: &AttributePath,
        role: SlotRole,
        expression: String,
        ty: Option<BasicType>,
        alias: SmolStr,
    ) -> Result<usize, ConfigError> {
        let expression = match ty {
            Some(ty) if self.textual => textual(ty, expression),
            _ => expression,
        };
        if let Some(slot) = self.reuse(&expression)? {
            return Ok(slot);
        }
        let slot = self.project(
            SlotBinding::Attribute {
                path: path.clone(),
                role,
            },
            SlotMapper::Expression {
                expression: expression.clone(),
                alias: Some(alias),
            },
        )?;
        self.projected.insert(expression, slot);
        Ok(slot)
    }

    fn placeholder(
        &mut self,
        path: &AttributePath,
        role: SlotRole,
        alias: SmolStr,
    ) -> Result<usize, ConfigError> {
        self.project(
            SlotBinding::Attribute {
                path: path.clone(),
                role,
            },
            SlotMapper::Placeholder { alias: Some(alias) },
        )
    }

    fn parameter(&mut self, name: &SmolStr, alias: SmolStr) -> Result<usize, ConfigError> {
        let key = format!(":{}", name);
        if let Some(slot) = self.reuse(&key)? {
            return Ok(slot);
        }
        let slot = self.project(
            SlotBinding::Parameter { name: name.clone() },
            SlotMapper::Parameter {
                name: name.clone(),
                alias: Some(alias),
            },
        )?;
        self.parameter_slots.push((slot, name.clone()));
        self.projected.insert(key, slot);
        Ok(slot)
    }

    fn finish(self) -> (TupleShape, QueryFragments, TuplePipeline, bool) {
        let mut pipeline = TuplePipeline::default();
        if !self.parameter_slots.is_empty() {
            pipeline.push(TupleTransform::Parameters {
                slots: self.parameter_slots,
            });
        }
        for constraint in self.constraints {
            pipeline.push(constraint);
        }
        if !self.consumed.is_empty() {
            pipeline.push(TupleTransform::Consuming {
                slots: self.consumed,
            });
        }
        let joins = &self.plural_joins;
        let fanout = joins.iter().enumerate().any(|(i, a)| {
            joins[i + 1..]
                .iter()
                .any(|b| !a.starts_with(b) && !b.starts_with(a))
        });
        (self.shape, self.fragments, pipeline, fanout)
    }
}

struct NodeContext {
    view: SmolStr,
    path: AttributePath,
    /// Expression the view's mappings are resolved against.
    prefix: String,
    alias: Option<SmolStr>,
    fetches: FetchFilter,
    constructor: Option<SmolStr>,
}

struct PlanBuilder<'a> {
    metamodel: &'a Metamodel,
    providers: &'a ProviderRegistry,
    config: &'a MaterializerConfig,
    strategies: &'a StrategyRegistry,
    parameters: &'a OptionalParameters,
    root_alias: String,
    batches: Vec<BatchFetch>,
}

type Sources = IndexMap<SmolStr, Vec<Option<AttributeSource>>>;

fn is_scalar(mapping: &AttributeMapping) -> bool {
    !mapping.plurality.is_plural() && mapping.element.view_name().is_none() && !mapping.is_correlated()
}

fn basic_type(mapping: &AttributeMapping) -> Option<BasicType> {
    match mapping.element {
        ElementType::Basic { ty, .. } => Some(ty),
        ElementType::View { .. } => None,
    }
}

fn location(view: &ViewType, attribute: &str) -> String {
    format!("{}.{}", view.name, attribute)
}

impl<'a> PlanBuilder<'a> {
    fn resolve(&self, location: &str, expression: &str, prefix: &str) -> Result<String, ConfigError> {
        prefix_expression(Some(prefix), Some(&self.root_alias), expression).map_err(|reason| {
            ConfigError::UnresolvablePath {
                location: location.to_string(),
                mapping: expression.to_string(),
                reason,
            }
        })
    }

    fn plan_node(&mut self, sb: &mut ShapeBuilder<'_>, cx: &NodeContext) -> Result<NodePlan, ConfigError> {
        let variants = self.metamodel.variants(&cx.view);
        let Some(declared) = variants.first().cloned() else {
            return Err(ConfigError::UnknownViewType {
                location: cx.path.to_string(),
                name: cx.view.clone(),
            });
        };
        let discriminator = if variants.len() > 1 {
            Some(self.discriminator(sb, cx, &variants)?)
        } else {
            None
        };

        let mut names: Vec<SmolStr> = Vec::new();
        for view in &variants {
            for attribute in &view.attributes {
                if !names.contains(&attribute.name) {
                    names.push(attribute.name.clone());
                }
            }
        }

        let mut sources: Sources = IndexMap::new();
        for name in &names {
            let planned = self.plan_union(sb, cx, &variants, name, discriminator)?;
            sources.insert(name.clone(), planned);
        }

        let mut plans = Vec::with_capacity(variants.len());
        for k in 0..variants.len() {
            plans.push(self.plan_variant(sb, cx, &variants, k, &sources)?);
        }

        let identity = match &declared.id_attribute {
            Some(id) => match sources.get(id).and_then(|s| s[0].as_ref()) {
                Some(AttributeSource::Slot { slot }) => vec![*slot],
                _ => {
                    return Err(ConfigError::InvalidIdAttribute {
                        view: declared.name.clone(),
                        attribute: id.clone(),
                    })
                }
            },
            None => {
                let mut slots: Vec<usize> = sources
                    .values()
                    .flatten()
                    .filter_map(|s| match s {
                        Some(AttributeSource::Slot { slot }) => Some(*slot),
                        _ => None,
                    })
                    .chain(discriminator)
                    .collect();
                slots.sort_unstable();
                slots.dedup();
                slots
            }
        };

        Ok(NodePlan {
            path: cx.path.clone(),
            identity,
            discriminator,
            variants: plans,
        })
    }

    /// `CASE WHEN .. THEN k .. ELSE 0 END`, most specific subtype first.
    fn discriminator(
        &self,
        sb: &mut ShapeBuilder<'_>,
        cx: &NodeContext,
        variants: &[Arc<ViewType>],
    ) -> Result<usize, ConfigError> {
        let mut order: Vec<usize> = (1..variants.len()).collect();
        order.sort_by_key(|k| Reverse(self.metamodel.depth(&variants[*k].name)));
        let mut expression = String::from("CASE");
        for k in order {
            let view = &variants[k];
            if let Some(condition) = &view.inheritance_mapping {
                let condition = self.resolve(&view.name, condition, &cx.prefix)?;
                expression.push_str(&format!(" WHEN {} THEN {}", condition, k));
            }
        }
        expression.push_str(" ELSE 0 END");
        sb.expression(
            &cx.path,
            SlotRole::Discriminator,
            expression,
            None,
            attribute_alias(cx.alias.as_deref(), "type"),
        )
    }

    /// Plans one attribute name across all variants of a node. Variants
    /// with identical mappings share a source.
    fn plan_union(
        &mut self,
        sb: &mut ShapeBuilder<'_>,
        cx: &NodeContext,
        variants: &[Arc<ViewType>],
        name: &SmolStr,
        discriminator: Option<usize>,
    ) -> Result<Vec<Option<AttributeSource>>, ConfigError> {
        let mut groups: Vec<(&AttributeMapping, SmallVec<[usize; 4]>)> = Vec::new();
        for (k, view) in variants.iter().enumerate() {
            if let Some(mapping) = view.attribute(name) {
                match groups.iter_mut().find(|(m, _)| *m == mapping) {
                    Some((_, members)) => members.push(k),
                    None => groups.push((mapping, smallvec![k])),
                }
            }
        }
        let mut out: Vec<Option<AttributeSource>> = vec![None; variants.len()];
        let Some((first, _)) = groups.first() else {
            return Ok(out);
        };

        let is_id = variants
            .iter()
            .any(|v| v.id_attribute.as_deref() == Some(name.as_str()));
        if !is_id && !cx.fetches.allows(name) {
            let container = ContainerShape::of(first.plurality);
            for (_, members) in &groups {
                for k in members {
                    out[*k] = Some(AttributeSource::Unfetched { container });
                }
            }
            return Ok(out);
        }
        let role = if is_id { SlotRole::Identity } else { SlotRole::Value };

        let scalar = groups.iter().all(|(m, _)| is_scalar(m));
        match discriminator {
            Some(discriminator) if groups.len() > 1 && scalar => {
                let depth = |members: &SmallVec<[usize; 4]>| {
                    members
                        .iter()
                        .map(|k| self.metamodel.depth(&variants[*k].name))
                        .max()
                        .unwrap_or(0)
                };
                let mut ordered: Vec<_> = groups.iter().collect();
                ordered.sort_by_key(|(_, members)| Reverse(depth(members)));

                let mut candidates: SmallVec<[Candidate; 4]> = SmallVec::new();
                let mut default = None;
                for (mapping, members) in ordered {
                    let owner = &variants[members[0]];
                    let slot = self.plan_scalar(sb, cx, owner, mapping, SlotRole::Candidate)?;
                    if members.contains(&0) {
                        default = Some(slot);
                    } else {
                        candidates.push(Candidate {
                            variants: members.clone(),
                            slot,
                        });
                    }
                }
                let path = cx.path.child(name);
                let target = sb.placeholder(&path, role, attribute_alias(cx.alias.as_deref(), name))?;
                sb.constraints.push(TupleTransform::SubtypeConstraint {
                    discriminator,
                    target,
                    candidates,
                    default,
                });
                for (_, members) in &groups {
                    for k in members {
                        out[*k] = Some(AttributeSource::Slot { slot: target });
                    }
                }
            }
            _ => {
                for (mapping, members) in &groups {
                    let owner = &variants[members[0]];
                    let source = self.plan_attribute(sb, cx, owner, mapping, role)?;
                    for k in members {
                        out[*k] = Some(source.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    fn plan_variant(
        &mut self,
        sb: &mut ShapeBuilder<'_>,
        cx: &NodeContext,
        variants: &[Arc<ViewType>],
        k: usize,
        sources: &Sources,
    ) -> Result<VariantPlan, ConfigError> {
        let view = &variants[k];
        let (strategy, constructor) = self.strategy(variants, k, cx.constructor.as_ref())?;

        let mut attributes = Vec::with_capacity(strategy.layout().len());
        for &i in strategy.layout() {
            let name = &view.attributes[i].name;
            let source = sources
                .get(name)
                .and_then(|s| s[k].clone())
                .ok_or_else(|| ConfigError::Invalid {
                    location: location(view, name),
                    message: "attribute was not planned".to_string(),
                })?;
            attributes.push(AttributePlan {
                name: name.clone(),
                path: cx.path.child(name),
                source,
            });
        }

        let mut arguments = Vec::new();
        if let Some(constructor) = &constructor {
            for parameter in &constructor.parameters {
                let argument_cx = NodeContext {
                    alias: Some(attribute_alias(cx.alias.as_deref(), &constructor.name)),
                    view: cx.view.clone(),
                    path: cx.path.clone(),
                    prefix: cx.prefix.clone(),
                    fetches: FetchFilter::all(),
                    constructor: None,
                };
                let source = self.plan_attribute(sb, &argument_cx, view, parameter, SlotRole::Value)?;
                if let AttributeSource::Batched { .. } = source {
                    return Err(ConfigError::Invalid {
                        location: location(view, &parameter.name),
                        message: "constructor parameters can not be select-fetched".to_string(),
                    });
                }
                arguments.push(AttributePlan {
                    name: parameter.name.clone(),
                    path: cx.path.child(&parameter.name),
                    source,
                });
            }
        }

        let slots = attributes
            .iter()
            .chain(arguments.iter())
            .map(|a| match a.source {
                AttributeSource::Slot { slot } => Some(slot),
                _ => None,
            })
            .collect();
        Ok(VariantPlan {
            strategy,
            attributes,
            arguments,
            slots,
        })
    }

    fn strategy(
        &self,
        variants: &[Arc<ViewType>],
        k: usize,
        constructor: Option<&SmolStr>,
    ) -> Result<(Arc<ConstructionStrategy>, Option<ConstructorDescriptor>), ConfigError> {
        let view = &variants[k];
        let name = match constructor {
            Some(name) if k == 0 || view.constructor(name).is_some() => Some(name.as_str()),
            _ => None,
        };
        let selected = select_constructor(view, name)?;
        if let Some(factory) = selected.and_then(|c| c.factory.as_ref()) {
            if self.providers.factory(factory).is_none() {
                return Err(ConfigError::UnknownFactory {
                    view: view.name.clone(),
                    name: factory.clone(),
                });
            }
        }
        let base = (k > 0).then(|| variants[0].clone());
        let key = StrategyKey::View {
            metamodel: self.metamodel.id(),
            view: view.name.clone(),
            base: base.as_ref().map(|b| b.name.clone()),
            constructor: selected.map(|c| c.name.clone()),
        };
        let strategy = self.strategies.get_or_create(key, || {
            Ok(ConstructionStrategy::generate(view, base.as_deref(), selected))
        })?;
        Ok((strategy, selected.cloned()))
    }

    fn plan_attribute(
        &mut self,
        sb: &mut ShapeBuilder<'_>,
        cx: &NodeContext,
        view: &ViewType,
        mapping: &AttributeMapping,
        role: SlotRole,
    ) -> Result<AttributeSource, ConfigError> {
        if let MappingKind::Correlated { .. } = mapping.kind {
            return self.plan_correlated(sb, cx, view, mapping);
        }
        if mapping.plurality.is_plural() {
            return self.plan_collection(sb, cx, view, mapping);
        }
        let Some(element) = mapping.element.view_name() else {
            let slot = self.plan_scalar(sb, cx, view, mapping, role)?;
            return Ok(AttributeSource::Slot { slot });
        };

        let location = location(view, &mapping.name);
        let expression = match &mapping.kind {
            MappingKind::Basic { mapping: path } => {
                self.check_path(&location, path)?;
                path
            }
            MappingKind::Expression { expression } => expression,
            _ => {
                return Err(ConfigError::Invalid {
                    location,
                    message: "only path and expression mappings can hold a view".to_string(),
                })
            }
        };
        let node = self.plan_node(
            sb,
            &NodeContext {
                view: element.clone(),
                path: cx.path.child(&mapping.name),
                prefix: self.resolve(&location, expression, &cx.prefix)?,
                alias: Some(attribute_alias(cx.alias.as_deref(), &mapping.name)),
                fetches: cx.fetches.descend(&mapping.name, &mapping.fetches),
                constructor: None,
            },
        )?;
        Ok(AttributeSource::Subview(Box::new(node)))
    }

    fn check_path(&self, location: &str, path: &str) -> Result<(), ConfigError> {
        if is_plain_path(path) {
            return Ok(());
        }
        Err(ConfigError::UnresolvablePath {
            location: location.to_string(),
            mapping: path.to_string(),
            reason: "a path mapping must be a plain attribute path".to_string(),
        })
    }

    fn plan_scalar(
        &mut self,
        sb: &mut ShapeBuilder<'_>,
        cx: &NodeContext,
        view: &ViewType,
        mapping: &AttributeMapping,
        role: SlotRole,
    ) -> Result<usize, ConfigError> {
        let location = location(view, &mapping.name);
        let path = cx.path.child(&mapping.name);
        let alias = attribute_alias(cx.alias.as_deref(), &mapping.name);
        match &mapping.kind {
            MappingKind::Basic { mapping: expression } => {
                self.check_path(&location, expression)?;
                let expression = self.resolve(&location, expression, &cx.prefix)?;
                sb.expression(&path, role, expression, basic_type(mapping), alias)
            }
            MappingKind::Expression { expression } => {
                let expression = self.resolve(&location, expression, &cx.prefix)?;
                sb.expression(&path, role, expression, basic_type(mapping), alias)
            }
            MappingKind::Subquery {
                provider,
                expression,
                alias: subquery_alias,
            } => {
                let provider_impl =
                    self.providers
                        .subquery(provider)
                        .ok_or_else(|| ConfigError::UnknownProvider {
                            location: location.clone(),
                            name: provider.clone(),
                        })?;
                sb.project(
                    SlotBinding::Attribute { path, role },
                    SlotMapper::Subquery {
                        location,
                        provider_name: provider.clone(),
                        provider: provider_impl.clone(),
                        outer: Some(cx.prefix.clone()),
                        wrapper: expression.clone().zip(subquery_alias.clone()),
                        alias: Some(alias),
                    },
                )
            }
            MappingKind::Parameter { parameter } => sb.parameter(parameter, alias),
            MappingKind::Correlated { .. } => Err(ConfigError::Invalid {
                location,
                message: "correlated attributes do not map to a single slot".to_string(),
            }),
        }
    }

    fn plan_element(
        &mut self,
        sb: &mut ShapeBuilder<'_>,
        mapping: &AttributeMapping,
        path: &AttributePath,
        expression: String,
        alias: SmolStr,
        fetches: FetchFilter,
    ) -> Result<ElementPlan, ConfigError> {
        match &mapping.element {
            ElementType::View { name } => {
                let node = self.plan_node(
                    sb,
                    &NodeContext {
                        view: name.clone(),
                        path: path.clone(),
                        prefix: expression,
                        alias: Some(alias),
                        fetches,
                        constructor: None,
                    },
                )?;
                Ok(ElementPlan::View(Box::new(node)))
            }
            ElementType::Basic { ty, primitive } => {
                let slot = sb.expression(path, SlotRole::Value, expression, Some(*ty), alias)?;
                Ok(ElementPlan::Basic {
                    slot,
                    ty: *ty,
                    primitive: *primitive,
                })
            }
        }
    }

    fn collection_spec(&self, path: &AttributePath, view: &ViewType, mapping: &AttributeMapping) -> Result<AccumulatorSpec, ConfigError> {
        AccumulatorSpec::from_mapping(path.clone(), mapping, !self.config.filter_null_elements).ok_or_else(|| {
            ConfigError::Invalid {
                location: location(view, &mapping.name),
                message: "expected a plural attribute".to_string(),
            }
        })
    }

    fn plan_collection(
        &mut self,
        sb: &mut ShapeBuilder<'_>,
        cx: &NodeContext,
        view: &ViewType,
        mapping: &AttributeMapping,
    ) -> Result<AttributeSource, ConfigError> {
        let location = location(view, &mapping.name);
        let MappingKind::Basic { mapping: collection } = &mapping.kind else {
            return Err(ConfigError::Invalid {
                location,
                message: "plural attributes need a path or correlated mapping".to_string(),
            });
        };
        self.check_path(&location, collection)?;
        let path = cx.path.child(&mapping.name);
        let alias = attribute_alias(cx.alias.as_deref(), &mapping.name);
        let collection = self.resolve(&location, collection, &cx.prefix)?;

        let index = match &mapping.index {
            Some(index) => {
                let expression =
                    index_expression(mapping.plurality, index, &collection, Some(&self.root_alias))
                        .map_err(|reason| ConfigError::UnresolvablePath {
                            location: location.clone(),
                            mapping: format!("{:?}", index),
                            reason,
                        })?;
                Some(sb.expression(&path, SlotRole::Index, expression, None, key_alias(&alias))?)
            }
            None => None,
        };
        sb.plural_joins.push(path.clone());

        let expression = element_expression(mapping.plurality, mapping.index.as_ref(), &collection);
        let fetches = cx.fetches.descend(&mapping.name, &mapping.fetches);
        let element = self.plan_element(sb, mapping, &path, expression, alias, fetches)?;
        Ok(AttributeSource::Collection(Box::new(CollectionPlan {
            spec: self.collection_spec(&path, view, mapping)?,
            element,
            index,
        })))
    }

    fn plan_correlated(
        &mut self,
        sb: &mut ShapeBuilder<'_>,
        cx: &NodeContext,
        view: &ViewType,
        mapping: &AttributeMapping,
    ) -> Result<AttributeSource, ConfigError> {
        let location = location(view, &mapping.name);
        let MappingKind::Correlated {
            basis,
            result,
            provider,
            strategy,
        } = &mapping.kind
        else {
            return Err(ConfigError::Invalid {
                location,
                message: "expected a correlated mapping".to_string(),
            });
        };
        let provider_impl = self
            .providers
            .correlation(provider)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProvider {
                location: location.clone(),
                name: provider.clone(),
            })?;
        let path = cx.path.child(&mapping.name);
        let alias = attribute_alias(cx.alias.as_deref(), &mapping.name);
        let fetches = cx.fetches.descend(&mapping.name, &mapping.fetches);
        let basis = self.resolve(&location, basis, &cx.prefix)?;
        let plural = mapping.plurality.is_plural();

        match strategy {
            FetchStrategy::Join => {
                let query = resolve_correlation(
                    &location,
                    provider,
                    provider_impl.as_ref(),
                    basis,
                    FetchStrategy::Join,
                    mapping.limiter.as_ref(),
                )?;
                if sb.fragments.joins.iter().any(|j| j.alias == query.alias) {
                    return Err(ConfigError::Invalid {
                        location,
                        message: format!("correlation alias '{}' is already joined", query.alias),
                    });
                }
                let expression = self.resolve(&location, result, &query.alias)?;
                sb.fragments.joins.push(JoinFragment {
                    entity: query.entity,
                    alias: query.alias,
                    condition: query.condition,
                    limiter: query.limiter,
                });
                if plural {
                    sb.plural_joins.push(path.clone());
                    let element = self.plan_element(sb, mapping, &path, expression, alias, fetches)?;
                    return Ok(AttributeSource::Collection(Box::new(CollectionPlan {
                        spec: self.collection_spec(&path, view, mapping)?,
                        element,
                        index: None,
                    })));
                }
                match self.plan_element(sb, mapping, &path, expression, alias, fetches)? {
                    ElementPlan::View(node) => Ok(AttributeSource::Subview(node)),
                    ElementPlan::Basic { slot, .. } => Ok(AttributeSource::Slot { slot }),
                }
            }
            FetchStrategy::Multiset => {
                let mut query = resolve_correlation(
                    &location,
                    provider,
                    provider_impl.as_ref(),
                    basis,
                    FetchStrategy::Multiset,
                    mapping.limiter.as_ref(),
                )?;
                let mut nested_sb = ShapeBuilder::new(self.parameters, self.config.textual_multisets);
                let expression = self.resolve(&location, result, &query.alias)?;
                let element = self.plan_element(
                    &mut nested_sb,
                    mapping,
                    &path,
                    expression,
                    mapping.name.clone(),
                    fetches,
                )?;
                let (shape, fragments, pipeline, fanout) = nested_sb.finish();
                query.fragments = fragments;
                let slot = sb.project(
                    SlotBinding::Attribute {
                        path: path.clone(),
                        role: SlotRole::Multiset,
                    },
                    SlotMapper::Multiset {
                        query: Box::new(query.clone()),
                        alias: Some(alias),
                    },
                )?;
                let collection = if plural {
                    Some(self.collection_spec(&path, view, mapping)?)
                } else {
                    None
                };
                Ok(AttributeSource::Multiset {
                    slot,
                    nested: Box::new(NestedPlan {
                        query,
                        shape,
                        pipeline,
                        element,
                        collection,
                        fanout,
                    }),
                })
            }
            FetchStrategy::Select => {
                let basis_slot = sb.expression(
                    &path,
                    SlotRole::CorrelationBasis,
                    basis,
                    None,
                    attribute_alias(cx.alias.as_deref(), &format!("{}_basis", mapping.name)),
                )?;
                let mut query = resolve_correlation(
                    &location,
                    provider,
                    provider_impl.as_ref(),
                    format!(":{}", BATCH_BASIS_PARAMETER),
                    FetchStrategy::Select,
                    mapping.limiter.as_ref(),
                )?;
                let mut nested_sb = ShapeBuilder::new(self.parameters, false);
                nested_sb.placeholder(
                    &AttributePath::root(),
                    SlotRole::CorrelationKey,
                    SmolStr::new_static(BATCH_BASIS_PARAMETER),
                )?;
                let expression = self.resolve(&location, result, &query.alias)?;
                let element = self.plan_element(
                    &mut nested_sb,
                    mapping,
                    &path,
                    expression,
                    mapping.name.clone(),
                    fetches,
                )?;
                let (shape, mut fragments, pipeline, fanout) = nested_sb.finish();
                fragments
                    .parameters
                    .require(SmolStr::new_static(BATCH_BASIS_PARAMETER));
                query.fragments = fragments;

                let batch_size = self
                    .config
                    .batch_size_for(&path)
                    .or(mapping.batch_size)
                    .or(view.default_batch_size)
                    .unwrap_or(self.config.default_batch_size)
                    .max(1);
                let fetch = self.batches.len();
                self.batches.push(BatchFetch {
                    path: path.clone(),
                    nested: NestedPlan {
                        query,
                        shape,
                        pipeline,
                        element,
                        collection: if plural {
                            Some(self.collection_spec(&path, view, mapping)?)
                        } else {
                            None
                        },
                        fanout,
                    },
                    batch_size,
                });
                Ok(AttributeSource::Batched {
                    basis: basis_slot,
                    fetch,
                })
            }
        }
    }
}

#[cfg(test)]
mod template_tests {
    use super::*;
    use crate::engine::correlation::CorrelationBuilder;
    use crate::engine::mapping::{Projection, SubqueryBuilder};
    use crate::engine::metamodel::{IndexMapping, Plurality};

    fn documents(builder: &mut CorrelationBuilder, basis: &str) {
        builder
            .correlate("Document", "d")
            .on(format!("d.owner.id = {}", basis));
    }

    fn count_documents(builder: &mut SubqueryBuilder, _: &OptionalParameters) {
        let owner = builder.outer("id");
        builder
            .from("Document", "d")
            .select("COUNT(d.id)")
            .restrict(format!("d.owner.id = {}", owner));
    }

    fn providers() -> ProviderRegistry {
        ProviderRegistry::new()
            .with_correlation("documents", documents)
            .with_subquery("documentCount", count_documents)
    }

    fn model() -> Metamodel {
        let person = ViewType::new(
            "Person",
            vec![
                AttributeMapping::basic("id", "id").typed(BasicType::Int),
                AttributeMapping::basic("name", "name").typed(BasicType::String),
                AttributeMapping::basic("tags", "tags")
                    .plural(Plurality::List)
                    .indexed(IndexMapping::Implicit),
                AttributeMapping::basic("friend", "friend").of_view("Friend"),
                AttributeMapping::subquery("documentCount", "documentCount"),
                AttributeMapping::correlated("documents", "id", "documents", FetchStrategy::Select)
                    .plural(Plurality::Set)
                    .with_result("name")
                    .with_batch_size(3),
                AttributeMapping::parameter("tenant", "tenant"),
            ],
        )
        .with_id("id");
        let friend = ViewType::new(
            "Friend",
            vec![
                AttributeMapping::basic("id", "id"),
                AttributeMapping::basic("name", "name"),
            ],
        )
        .with_id("id");
        Metamodel::new(vec![person, friend]).unwrap()
    }

    fn plan(model: &Metamodel, setting: &ViewSetting) -> Result<MaterializationPlan, ConfigError> {
        MaterializationPlan::build(
            model,
            &providers(),
            &MaterializerConfig::default(),
            &StrategyRegistry::new(),
            setting,
        )
    }

    fn expressions(plan: &MaterializationPlan) -> Vec<Option<String>> {
        plan.fragments()
            .projections
            .iter()
            .map(|p| p.expression().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_person_plan_projects_every_attribute() {
        let model = model();
        let plan = plan(&model, &ViewSetting::new("Person")).unwrap();
        let exprs = expressions(&plan);
        assert_eq!(exprs[0].as_deref(), Some("e.id"));
        assert_eq!(exprs[1].as_deref(), Some("e.name"));
        assert_eq!(exprs[2].as_deref(), Some("INDEX(e.tags)"));
        assert_eq!(exprs[3].as_deref(), Some("e.tags"));
        // friend.id, friend.name
        assert_eq!(exprs[4].as_deref(), Some("e.friend.id"));
        assert_eq!(exprs[5].as_deref(), Some("e.friend.name"));
        assert_eq!(
            exprs[6].as_deref(),
            Some("(SELECT COUNT(d.id) FROM Document d WHERE d.owner.id = e.id)")
        );
        // documents basis repeats e.id and is folded into slot 0
        assert_eq!(plan.shape().slot(7), Some(&SlotBinding::Consumed { into: 0 }));
        assert_eq!(plan.shape().slot(8), Some(&SlotBinding::Parameter { name: "tenant".into() }));
        assert_eq!(plan.shape().len(), 9);
        assert_eq!(plan.root().identity, vec![0]);
        assert!(plan.fragments().parameters.is_required("tenant"));
        assert!(!plan.fanout());
    }

    #[test]
    fn test_aliases_follow_nesting() {
        let model = model();
        let plan = plan(&model, &ViewSetting::new("Person")).unwrap();
        let aliases: Vec<_> = plan
            .fragments()
            .projections
            .iter()
            .map(|p| p.alias().map(|a| a.to_string()))
            .collect();
        assert_eq!(aliases[2].as_deref(), Some("tags_KEY"));
        assert_eq!(aliases[5].as_deref(), Some("friend_name"));
    }

    #[test]
    fn test_select_correlation_becomes_batch_fetch() {
        let model = model();
        let plan = plan(&model, &ViewSetting::new("Person")).unwrap();
        assert_eq!(plan.batches().len(), 1);
        let batch = &plan.batches()[0];
        assert_eq!(batch.batch_size, 3);
        assert_eq!(batch.path, AttributePath::new("documents"));
        assert_eq!(batch.nested.query.condition, "d.owner.id = :basis");
        assert_eq!(
            batch.nested.shape.slot(0),
            Some(&SlotBinding::Attribute {
                path: AttributePath::root(),
                role: SlotRole::CorrelationKey
            })
        );
        assert!(batch.nested.query.fragments.parameters.is_required("basis"));
    }

    #[test]
    fn test_config_batch_size_override_wins() {
        let model = model();
        let mut config = MaterializerConfig::default();
        config.batch_sizes.insert("documents".into(), 7);
        let plan = MaterializationPlan::build(
            &model,
            &providers(),
            &config,
            &StrategyRegistry::new(),
            &ViewSetting::new("Person"),
        )
        .unwrap();
        assert_eq!(plan.batches()[0].batch_size, 7);
    }

    #[test]
    fn test_fetch_restriction_skips_projection() {
        let model = model();
        let plan = plan(&model, &ViewSetting::new("Person").fetching(&["name", "friend.name"])).unwrap();
        let exprs = expressions(&plan);
        assert_eq!(
            exprs.iter().flatten().cloned().collect::<Vec<_>>(),
            vec!["e.id", "e.name", "e.friend.id", "e.friend.name"]
        );
        let tags = plan
            .root()
            .variants[0]
            .attributes
            .iter()
            .find(|a| a.name == "tags")
            .unwrap();
        assert!(matches!(
            tags.source,
            AttributeSource::Unfetched {
                container: Some(ContainerShape::List)
            }
        ));
        assert!(plan.batches().is_empty());
    }

    #[test]
    fn test_unknown_provider_fails_at_plan_time() {
        let model = model();
        let err = MaterializationPlan::build(
            &model,
            &ProviderRegistry::new(),
            &MaterializerConfig::default(),
            &StrategyRegistry::new(),
            &ViewSetting::new("Person"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider { .. }));
    }

    #[test]
    fn test_unknown_root_view() {
        let model = model();
        let err = plan(&model, &ViewSetting::new("Nobody")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownViewType { .. }));
    }

    #[test]
    fn test_non_path_basic_mapping_rejected() {
        let view = ViewType::new("Odd", vec![AttributeMapping::basic("x", "a + b")]);
        let model = Metamodel::new(vec![view]).unwrap();
        let err = plan(&model, &ViewSetting::new("Odd")).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvablePath { .. }));
    }

    #[test]
    fn test_subtype_candidates_and_discriminator() {
        let animal = ViewType::new(
            "Animal",
            vec![
                AttributeMapping::basic("id", "id"),
                AttributeMapping::expression("sound", "'...'"),
            ],
        )
        .with_id("id")
        .with_subtypes(&["Dog"]);
        let dog = ViewType::new(
            "Dog",
            vec![
                AttributeMapping::basic("id", "id"),
                AttributeMapping::expression("sound", "'woof'"),
                AttributeMapping::basic("breed", "breed"),
            ],
        )
        .with_id("id")
        .extending("Animal", "kind = 'dog'");
        let model = Metamodel::new(vec![animal, dog]).unwrap();
        let plan = plan(&model, &ViewSetting::new("Animal")).unwrap();

        let exprs = expressions(&plan);
        assert_eq!(exprs[0].as_deref(), Some("CASE WHEN e.kind = 'dog' THEN 1 ELSE 0 END"));
        assert_eq!(plan.root().discriminator, Some(0));
        assert_eq!(plan.root().variants.len(), 2);
        let constraint = plan
            .pipeline()
            .transforms()
            .iter()
            .find(|t| matches!(t, TupleTransform::SubtypeConstraint { .. }))
            .unwrap();
        let TupleTransform::SubtypeConstraint { candidates, default, .. } = constraint else {
            unreachable!()
        };
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].variants.as_slice(), &[1]);
        assert!(default.is_some());
        assert!(plan
            .fragments()
            .projections
            .iter()
            .any(|p| matches!(p, Projection::Null { alias: Some(a) } if a == "sound")));
    }

    #[test]
    fn test_independent_plural_joins_fan_out() {
        let view = ViewType::new(
            "Tagged",
            vec![
                AttributeMapping::basic("id", "id"),
                AttributeMapping::basic("tags", "tags").plural(Plurality::Set),
                AttributeMapping::basic("labels", "labels").plural(Plurality::List),
            ],
        )
        .with_id("id");
        let model = Metamodel::new(vec![view]).unwrap();
        let plan = plan(&model, &ViewSetting::new("Tagged")).unwrap();
        assert!(plan.fanout());
    }

    #[test]
    fn test_fetch_filter_descend() {
        let filter = FetchFilter::new(vec![AttributePath::new("friend.name"), AttributePath::new("id")]);
        assert!(filter.allows("friend"));
        assert!(!filter.allows("tags"));
        let nested = filter.descend("friend", &[]);
        assert!(nested.allows("name"));
        assert!(!nested.allows("age"));
        let whole = FetchFilter::new(vec![AttributePath::new("friend")]).descend("friend", &[]);
        assert!(whole.allows("age"));
    }
}
