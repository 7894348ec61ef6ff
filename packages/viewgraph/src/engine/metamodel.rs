//! Static descriptors of view types.
//!
//! A [`Metamodel`] is built once from [`ViewType`] descriptors (in code or
//! from JSON), validated, and shared read-only by every plan built from it.

use super::types::{AttributePath, FastMap};
use crate::error::ConfigError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_METAMODEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BasicType {
    Bool,
    Int,
    Float,
    String,
    #[default]
    Any,
}

impl BasicType {
    pub fn name(&self) -> &'static str {
        match self {
            BasicType::Bool => "bool",
            BasicType::Int => "int",
            BasicType::Float => "float",
            BasicType::String => "string",
            BasicType::Any => "any",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ElementType {
    Basic {
        #[serde(default)]
        ty: BasicType,
        /// Primitive values materialize NULL as the zero value.
        #[serde(default)]
        primitive: bool,
    },
    View { name: SmolStr },
}

impl ElementType {
    pub fn any() -> Self {
        ElementType::Basic {
            ty: BasicType::Any,
            primitive: false,
        }
    }

    pub fn view_name(&self) -> Option<&SmolStr> {
        match self {
            ElementType::View { name } => Some(name),
            ElementType::Basic { .. } => None,
        }
    }
}

impl Default for ElementType {
    fn default() -> Self {
        ElementType::any()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    /// Joined into the main query.
    #[default]
    Join,
    /// Nested rows embedded in one slot of the main row.
    Multiset,
    /// Separate batched queries after the main result is assembled.
    Select,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MappingKind {
    /// Plain path relative to the owning view.
    Basic { mapping: String },
    Expression { expression: String },
    /// Scalar subquery; `expression` may wrap it, referring to it by `alias`.
    Subquery {
        provider: SmolStr,
        #[serde(default)]
        expression: Option<String>,
        #[serde(default)]
        alias: Option<SmolStr>,
    },
    Correlated {
        basis: String,
        #[serde(default)]
        result: String,
        provider: SmolStr,
        #[serde(default)]
        strategy: FetchStrategy,
    },
    /// Bound from the optional parameters of the view setting.
    Parameter { parameter: SmolStr },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InnerCollection {
    #[default]
    List,
    Set,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Plurality {
    #[default]
    Singular,
    List,
    Set,
    Map,
    MultiList(InnerCollection),
    MultiMap(InnerCollection),
}

impl Plurality {
    pub fn is_plural(&self) -> bool {
        !matches!(self, Plurality::Singular)
    }

    pub fn is_list_like(&self) -> bool {
        matches!(self, Plurality::List | Plurality::MultiList(_))
    }

    pub fn is_map_like(&self) -> bool {
        matches!(self, Plurality::Map | Plurality::MultiMap(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Plurality::Singular => "singular value",
            Plurality::List => "list",
            Plurality::Set => "set",
            Plurality::Map => "map",
            Plurality::MultiList(_) => "multi-list",
            Plurality::MultiMap(_) => "multi-map",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(tag = "by", rename_all = "lowercase")]
pub enum SortSpec {
    Natural,
    Reverse,
    Attribute {
        attribute: SmolStr,
        #[serde(default)]
        descending: bool,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CollectionOrdering {
    #[default]
    Unordered,
    /// Arrival order is preserved.
    Ordered,
    Sorted(SortSpec),
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Uniqueness {
    #[default]
    None,
    /// Later duplicates are dropped.
    Forced,
    /// Duplicates are an error.
    Strict,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexMapping {
    /// `INDEX(...)` for lists, `KEY(...)` for maps.
    Implicit,
    Expression { expression: String },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderSpec {
    /// Attribute of the element; empty orders by the element itself.
    pub field: AttributePath,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Limiter {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub order_by: Vec<OrderSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttributeMapping {
    pub name: SmolStr,
    #[serde(flatten)]
    pub kind: MappingKind,
    #[serde(default)]
    pub plurality: Plurality,
    #[serde(default)]
    pub element: ElementType,
    #[serde(default)]
    pub ordering: CollectionOrdering,
    #[serde(default)]
    pub uniqueness: Uniqueness,
    #[serde(default)]
    pub index: Option<IndexMapping>,
    /// Nested paths to fetch below this attribute; empty fetches everything.
    #[serde(default)]
    pub fetches: Vec<AttributePath>,
    #[serde(default)]
    pub limiter: Option<Limiter>,
    #[serde(default)]
    pub updatable: bool,
    #[serde(default)]
    pub copy_on_construct: bool,
    #[serde(default)]
    pub keep_null_elements: bool,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl AttributeMapping {
    fn with_kind(name: &str, kind: MappingKind) -> Self {
        AttributeMapping {
            name: SmolStr::new(name),
            kind,
            plurality: Plurality::Singular,
            element: ElementType::any(),
            ordering: CollectionOrdering::Unordered,
            uniqueness: Uniqueness::None,
            index: None,
            fetches: Vec::new(),
            limiter: None,
            updatable: false,
            copy_on_construct: false,
            keep_null_elements: false,
            batch_size: None,
        }
    }

    pub fn basic(name: &str, mapping: &str) -> Self {
        Self::with_kind(
            name,
            MappingKind::Basic {
                mapping: mapping.to_string(),
            },
        )
    }

    pub fn expression(name: &str, expression: &str) -> Self {
        Self::with_kind(
            name,
            MappingKind::Expression {
                expression: expression.to_string(),
            },
        )
    }

    pub fn subquery(name: &str, provider: &str) -> Self {
        Self::with_kind(
            name,
            MappingKind::Subquery {
                provider: SmolStr::new(provider),
                expression: None,
                alias: None,
            },
        )
    }

    pub fn correlated(
        name: &str,
        basis: &str,
        provider: &str,
        strategy: FetchStrategy,
    ) -> Self {
        Self::with_kind(
            name,
            MappingKind::Correlated {
                basis: basis.to_string(),
                result: String::new(),
                provider: SmolStr::new(provider),
                strategy,
            },
        )
    }

    pub fn parameter(name: &str, parameter: &str) -> Self {
        Self::with_kind(
            name,
            MappingKind::Parameter {
                parameter: SmolStr::new(parameter),
            },
        )
    }

    pub fn typed(mut self, ty: BasicType) -> Self {
        self.element = ElementType::Basic {
            ty,
            primitive: false,
        };
        self
    }

    pub fn primitive(mut self, ty: BasicType) -> Self {
        self.element = ElementType::Basic {
            ty,
            primitive: true,
        };
        self
    }

    pub fn of_view(mut self, name: &str) -> Self {
        self.element = ElementType::View {
            name: SmolStr::new(name),
        };
        self
    }

    pub fn plural(mut self, plurality: Plurality) -> Self {
        self.plurality = plurality;
        self
    }

    pub fn ordered(mut self) -> Self {
        self.ordering = CollectionOrdering::Ordered;
        self
    }

    pub fn sorted(mut self, spec: SortSpec) -> Self {
        self.ordering = CollectionOrdering::Sorted(spec);
        self
    }

    pub fn unique(mut self, uniqueness: Uniqueness) -> Self {
        self.uniqueness = uniqueness;
        self
    }

    pub fn indexed(mut self, index: IndexMapping) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_result(mut self, expression: &str) -> Self {
        if let MappingKind::Correlated { result, .. } = &mut self.kind {
            *result = expression.to_string();
        }
        self
    }

    pub fn with_subquery_expression(mut self, wrapper: &str, subquery_alias: &str) -> Self {
        if let MappingKind::Subquery {
            expression, alias, ..
        } = &mut self.kind
        {
            *expression = Some(wrapper.to_string());
            *alias = Some(SmolStr::new(subquery_alias));
        }
        self
    }

    pub fn with_fetches(mut self, fetches: &[&str]) -> Self {
        self.fetches = fetches.iter().map(|f| AttributePath::new(f)).collect();
        self
    }

    pub fn with_limiter(mut self, limiter: Limiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn updatable(mut self) -> Self {
        self.updatable = true;
        self
    }

    pub fn copy_on_construct(mut self) -> Self {
        self.copy_on_construct = true;
        self
    }

    pub fn keep_null_elements(mut self) -> Self {
        self.keep_null_elements = true;
        self
    }

    pub fn is_correlated(&self) -> bool {
        matches!(self.kind, MappingKind::Correlated { .. })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConstructorDescriptor {
    pub name: SmolStr,
    #[serde(default)]
    pub parameters: Vec<AttributeMapping>,
    /// Named factory used instead of direct construction.
    #[serde(default)]
    pub factory: Option<SmolStr>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mutability {
    #[default]
    ReadOnly,
    Updatable,
    Creatable,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ViewType {
    pub name: SmolStr,
    #[serde(default)]
    pub id_attribute: Option<SmolStr>,
    pub attributes: Vec<AttributeMapping>,
    #[serde(default)]
    pub constructors: Vec<ConstructorDescriptor>,
    #[serde(default)]
    pub mutability: Mutability,
    #[serde(default)]
    pub super_type: Option<SmolStr>,
    /// Predicate selecting rows of this subtype, relative to the view.
    #[serde(default)]
    pub inheritance_mapping: Option<String>,
    #[serde(default)]
    pub subtypes: Vec<SmolStr>,
    #[serde(default)]
    pub default_batch_size: Option<usize>,

    #[serde(skip)]
    dirty_indices: Vec<Option<usize>>,
    #[serde(skip)]
    dirty_attributes: Vec<usize>,
    #[serde(skip)]
    id_index: Option<usize>,
}

impl ViewType {
    pub fn new(name: &str, attributes: Vec<AttributeMapping>) -> Self {
        ViewType {
            name: SmolStr::new(name),
            id_attribute: None,
            attributes,
            constructors: Vec::new(),
            mutability: Mutability::ReadOnly,
            super_type: None,
            inheritance_mapping: None,
            subtypes: Vec::new(),
            default_batch_size: None,
            dirty_indices: Vec::new(),
            dirty_attributes: Vec::new(),
            id_index: None,
        }
    }

    pub fn with_id(mut self, attribute: &str) -> Self {
        self.id_attribute = Some(SmolStr::new(attribute));
        self
    }

    pub fn with_mutability(mut self, mutability: Mutability) -> Self {
        self.mutability = mutability;
        self
    }

    pub fn with_constructor(mut self, constructor: ConstructorDescriptor) -> Self {
        self.constructors.push(constructor);
        self
    }

    pub fn extending(mut self, super_type: &str, inheritance_mapping: &str) -> Self {
        self.super_type = Some(SmolStr::new(super_type));
        self.inheritance_mapping = Some(inheritance_mapping.to_string());
        self
    }

    pub fn with_subtypes(mut self, subtypes: &[&str]) -> Self {
        self.subtypes = subtypes.iter().map(|s| SmolStr::new(s)).collect();
        self
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeMapping> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn id_index(&self) -> Option<usize> {
        self.id_index
    }

    pub fn is_mutable(&self) -> bool {
        self.mutability != Mutability::ReadOnly
    }

    /// Position of the attribute in the dirty bitset, if it is updatable.
    pub fn dirty_index(&self, attribute_index: usize) -> Option<usize> {
        self.dirty_indices.get(attribute_index).copied().flatten()
    }

    /// Attribute positions of updatable attributes, by dirty index.
    pub fn dirty_attributes(&self) -> &[usize] {
        &self.dirty_attributes
    }

    pub fn updatable_count(&self) -> usize {
        self.dirty_attributes.len()
    }

    pub fn constructor(&self, name: &str) -> Option<&ConstructorDescriptor> {
        self.constructors.iter().find(|c| c.name == name)
    }

    fn location(&self, attribute: &str) -> String {
        format!("{}.{}", self.name, attribute)
    }

    fn prepare(&mut self) -> Result<(), ConfigError> {
        let mut seen = FastMap::default();
        for (i, attribute) in self.attributes.iter().enumerate() {
            if seen.insert(attribute.name.clone(), i).is_some() {
                return Err(ConfigError::DuplicateAttribute {
                    view: self.name.clone(),
                    attribute: attribute.name.clone(),
                });
            }
            self.validate_attribute(attribute)?;
        }
        for constructor in &self.constructors {
            for parameter in &constructor.parameters {
                self.validate_attribute(parameter)?;
            }
        }

        self.id_index = match &self.id_attribute {
            Some(id) => {
                let index = self.attribute_index(id).ok_or_else(|| {
                    ConfigError::InvalidIdAttribute {
                        view: self.name.clone(),
                        attribute: id.clone(),
                    }
                })?;
                let attribute = &self.attributes[index];
                let basic_path = matches!(attribute.kind, MappingKind::Basic { .. });
                if attribute.plurality.is_plural()
                    || attribute.element.view_name().is_some()
                    || !basic_path
                {
                    return Err(ConfigError::InvalidIdAttribute {
                        view: self.name.clone(),
                        attribute: id.clone(),
                    });
                }
                Some(index)
            }
            None => None,
        };

        let mutable = self.is_mutable();
        self.dirty_indices = Vec::with_capacity(self.attributes.len());
        self.dirty_attributes.clear();
        for (i, attribute) in self.attributes.iter().enumerate() {
            if attribute.updatable && mutable {
                self.dirty_indices.push(Some(self.dirty_attributes.len()));
                self.dirty_attributes.push(i);
            } else {
                self.dirty_indices.push(None);
            }
        }
        Ok(())
    }

    fn validate_attribute(&self, attribute: &AttributeMapping) -> Result<(), ConfigError> {
        let location = self.location(&attribute.name);
        let plurality = attribute.plurality;

        if attribute.updatable && !self.is_mutable() {
            return Err(ConfigError::UpdatableOnReadOnly {
                location,
                view: self.name.clone(),
            });
        }
        if attribute.index.is_some() && attribute.is_correlated() {
            return Err(ConfigError::IndexedCorrelation { location });
        }
        match (plurality, &attribute.index) {
            (Plurality::Singular | Plurality::Set, Some(_)) => {
                return Err(ConfigError::IllegalIndexMapping {
                    location,
                    plurality: SmolStr::new_static(plurality.name()),
                });
            }
            (Plurality::Map | Plurality::MultiMap(_), None) => {
                return Err(ConfigError::MissingKeyMapping { location });
            }
            (Plurality::MultiList(_), None) if !attribute.is_correlated() => {
                return Err(ConfigError::MissingKeyMapping { location });
            }
            _ => {}
        }
        if plurality.is_list_like() {
            if let CollectionOrdering::Sorted(_) = attribute.ordering {
                return Err(ConfigError::SortedList { location });
            }
        }
        if !plurality.is_plural()
            && (attribute.uniqueness != Uniqueness::None
                || !matches!(attribute.ordering, CollectionOrdering::Unordered))
        {
            return Err(ConfigError::Invalid {
                location,
                message: "ordering and uniqueness only apply to collections".to_string(),
            });
        }
        match &attribute.kind {
            MappingKind::Subquery { .. } | MappingKind::Parameter { .. }
                if plurality.is_plural() || attribute.element.view_name().is_some() =>
            {
                Err(ConfigError::Invalid {
                    location,
                    message: "subquery and parameter mappings must be singular basic values"
                        .to_string(),
                })
            }
            MappingKind::Subquery {
                expression: Some(_),
                alias: None,
                ..
            } => Err(ConfigError::Invalid {
                location,
                message: "a wrapping subquery expression needs an alias".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Deserialize)]
struct MetamodelFile {
    views: Vec<ViewType>,
}

/// Validated set of view types. Immutable once built.
#[derive(Debug)]
pub struct Metamodel {
    id: u64,
    types: FastMap<SmolStr, Arc<ViewType>>,
    order: Vec<SmolStr>,
}

impl Metamodel {
    pub fn new(types: Vec<ViewType>) -> Result<Self, ConfigError> {
        let mut prepared = FastMap::default();
        let mut order = Vec::with_capacity(types.len());
        for mut view in types {
            view.prepare()?;
            order.push(view.name.clone());
            prepared.insert(view.name.clone(), view);
        }

        for view in prepared.values() {
            let references = view
                .attributes
                .iter()
                .chain(view.constructors.iter().flat_map(|c| c.parameters.iter()));
            for attribute in references {
                if let Some(name) = attribute.element.view_name() {
                    if !prepared.contains_key(name) {
                        return Err(ConfigError::UnknownViewType {
                            location: view.location(&attribute.name),
                            name: name.clone(),
                        });
                    }
                }
            }
            for subtype in &view.subtypes {
                let extends = prepared
                    .get(subtype)
                    .map(|s| extends(&prepared, s, &view.name))
                    .unwrap_or(false);
                if !extends {
                    return Err(ConfigError::InvalidSubtype {
                        view: view.name.clone(),
                        subtype: subtype.clone(),
                    });
                }
            }
            if let Some(super_type) = &view.super_type {
                if !prepared.contains_key(super_type) {
                    return Err(ConfigError::UnknownViewType {
                        location: view.name.to_string(),
                        name: super_type.clone(),
                    });
                }
            }
        }

        Ok(Metamodel {
            id: NEXT_METAMODEL_ID.fetch_add(1, Ordering::Relaxed),
            types: prepared
                .into_iter()
                .map(|(name, view)| (name, Arc::new(view)))
                .collect(),
            order,
        })
    }

    /// Parses `{"views": [...]}`.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let file: MetamodelFile =
            serde_json::from_str(json).context("Failed to parse metamodel JSON")?;
        Ok(Metamodel::new(file.views)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read metamodel file: {:?}", path))?;
        Self::from_json(&content)
    }

    /// Unique per instance; keys cached construction strategies.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ViewType>> {
        self.types.get(name)
    }

    pub fn view(&self, name: &str, location: &str) -> Result<&Arc<ViewType>, ConfigError> {
        self.types
            .get(name)
            .ok_or_else(|| ConfigError::UnknownViewType {
                location: location.to_string(),
                name: SmolStr::new(name),
            })
    }

    pub fn view_names(&self) -> impl Iterator<Item = &SmolStr> {
        self.order.iter()
    }

    /// Length of the super-type chain; deeper types are more specific.
    pub fn depth(&self, name: &str) -> usize {
        let mut depth = 0;
        let mut current = self.types.get(name).and_then(|v| v.super_type.clone());
        while let Some(parent) = current {
            depth += 1;
            if depth > self.types.len() {
                break;
            }
            current = self.types.get(&parent).and_then(|v| v.super_type.clone());
        }
        depth
    }

    /// The type and all of its transitive subtypes, declared type first.
    pub fn variants(&self, name: &str) -> Vec<Arc<ViewType>> {
        let mut out: Vec<Arc<ViewType>> = Vec::new();
        let mut queue = vec![SmolStr::new(name)];
        while let Some(next) = queue.pop() {
            if out.iter().any(|v| v.name == next) {
                continue;
            }
            if let Some(view) = self.types.get(&next) {
                out.push(view.clone());
                queue.extend(view.subtypes.iter().rev().cloned());
            }
        }
        out
    }
}

fn extends(types: &FastMap<SmolStr, ViewType>, view: &ViewType, ancestor: &str) -> bool {
    let mut current = view.super_type.as_ref();
    let mut hops = 0;
    while let Some(name) = current {
        if name == ancestor {
            return true;
        }
        hops += 1;
        if hops > types.len() {
            return false;
        }
        current = types.get(name).and_then(|v| v.super_type.as_ref());
    }
    false
}

#[cfg(test)]
mod metamodel_tests {
    use super::*;

    fn person() -> ViewType {
        ViewType::new(
            "Person",
            vec![
                AttributeMapping::basic("id", "id").typed(BasicType::Int),
                AttributeMapping::basic("name", "name")
                    .typed(BasicType::String)
                    .updatable(),
                AttributeMapping::basic("age", "age").typed(BasicType::Int),
                AttributeMapping::basic("nickname", "nickname").updatable(),
            ],
        )
        .with_id("id")
        .with_mutability(Mutability::Updatable)
    }

    #[test]
    fn test_dirty_indices_follow_declaration_order() {
        let model = Metamodel::new(vec![person()]).unwrap();
        let view = model.get("Person").unwrap();
        assert_eq!(view.id_index(), Some(0));
        assert_eq!(view.dirty_index(0), None);
        assert_eq!(view.dirty_index(1), Some(0));
        assert_eq!(view.dirty_index(3), Some(1));
        assert_eq!(view.dirty_attributes(), &[1, 3]);
        assert_eq!(view.updatable_count(), 2);
    }

    #[test]
    fn test_metamodel_ids_are_unique() {
        let a = Metamodel::new(vec![person()]).unwrap();
        let b = Metamodel::new(vec![person()]).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_updatable_on_read_only_rejected() {
        let view = person().with_mutability(Mutability::ReadOnly);
        let err = Metamodel::new(vec![view]).unwrap_err();
        assert!(matches!(err, ConfigError::UpdatableOnReadOnly { .. }));
    }

    #[test]
    fn test_sorted_list_rejected() {
        let view = ViewType::new(
            "Tagged",
            vec![AttributeMapping::basic("tags", "tags")
                .plural(Plurality::List)
                .sorted(SortSpec::Natural)],
        );
        let err = Metamodel::new(vec![view]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::SortedList {
                location: "Tagged.tags".to_string()
            }
        );
    }

    #[test]
    fn test_map_without_key_rejected() {
        let view = ViewType::new(
            "Tagged",
            vec![AttributeMapping::basic("labels", "labels").plural(Plurality::Map)],
        );
        assert!(matches!(
            Metamodel::new(vec![view]).unwrap_err(),
            ConfigError::MissingKeyMapping { .. }
        ));
    }

    #[test]
    fn test_indexed_correlation_rejected() {
        let view = ViewType::new(
            "Owner",
            vec![AttributeMapping::correlated("docs", "id", "docs", FetchStrategy::Join)
                .plural(Plurality::List)
                .indexed(IndexMapping::Implicit)],
        );
        assert!(matches!(
            Metamodel::new(vec![view]).unwrap_err(),
            ConfigError::IndexedCorrelation { .. }
        ));
    }

    #[test]
    fn test_unknown_element_view_rejected() {
        let view = ViewType::new(
            "Owner",
            vec![AttributeMapping::basic("pet", "pet").of_view("Pet")],
        );
        assert!(matches!(
            Metamodel::new(vec![view]).unwrap_err(),
            ConfigError::UnknownViewType { .. }
        ));
    }

    #[test]
    fn test_variants_and_depth() {
        let animal = ViewType::new("Animal", vec![AttributeMapping::basic("id", "id")])
            .with_id("id")
            .with_subtypes(&["Cat", "Dog"]);
        let cat = ViewType::new("Cat", vec![AttributeMapping::basic("id", "id")])
            .with_id("id")
            .extending("Animal", "kind = 'cat'");
        let dog = ViewType::new("Dog", vec![AttributeMapping::basic("id", "id")])
            .with_id("id")
            .extending("Animal", "kind = 'dog'");
        let model = Metamodel::new(vec![animal, cat, dog]).unwrap();
        let names: Vec<_> = model
            .variants("Animal")
            .iter()
            .map(|v| v.name.to_string())
            .collect();
        assert_eq!(names, vec!["Animal", "Cat", "Dog"]);
        assert_eq!(model.depth("Animal"), 0);
        assert_eq!(model.depth("Dog"), 1);
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "views": [{
                "name": "Person",
                "id_attribute": "id",
                "mutability": "updatable",
                "attributes": [
                    {"name": "id", "kind": "basic", "mapping": "id",
                     "element": {"kind": "basic", "ty": "int"}},
                    {"name": "tags", "kind": "basic", "mapping": "tags",
                     "plurality": "set", "updatable": true},
                    {"name": "scores", "kind": "basic", "mapping": "scores",
                     "plurality": {"multi_list": "set"}, "index": {"kind": "implicit"}}
                ]
            }]
        }"#;
        let model = Metamodel::from_json(json).unwrap();
        let view = model.get("Person").unwrap();
        assert_eq!(view.attributes.len(), 3);
        assert_eq!(view.attributes[2].plurality, Plurality::MultiList(InnerCollection::Set));
        assert_eq!(view.dirty_index(1), Some(0));
    }
}
