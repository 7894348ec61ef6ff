use super::expression::{check_expression, prefix_expression};
use crate::engine::correlation::CorrelatedQuery;
use crate::engine::metamodel::{BasicType, IndexMapping, Limiter, Plurality};
use crate::engine::types::{OptionalParameters, Value};
use crate::error::ConfigError;
use indexmap::{IndexMap, IndexSet};
use regex::{NoExpand, Regex};
use smol_str::SmolStr;
use std::fmt;
use std::sync::Arc;

/// One entry of the select clause, in slot order.
#[derive(Clone, Debug, PartialEq)]
pub enum Projection {
    Expression {
        expression: String,
        alias: Option<SmolStr>,
    },
    /// Slot filled after the row is read (parameters, duplicates).
    Null { alias: Option<SmolStr> },
    /// Rows of a correlated query nested into a single slot.
    Multiset {
        query: Box<CorrelatedQuery>,
        alias: Option<SmolStr>,
    },
}

impl Projection {
    pub fn alias(&self) -> Option<&SmolStr> {
        match self {
            Projection::Expression { alias, .. }
            | Projection::Null { alias }
            | Projection::Multiset { alias, .. } => alias.as_ref(),
        }
    }

    pub fn expression(&self) -> Option<&str> {
        match self {
            Projection::Expression { expression, .. } => Some(expression),
            _ => None,
        }
    }
}

/// Correlated entity joined into the query that owns it.
#[derive(Clone, Debug, PartialEq)]
pub struct JoinFragment {
    pub entity: SmolStr,
    pub alias: SmolStr,
    pub condition: String,
    /// Applies per joined parent row.
    pub limiter: Option<Limiter>,
}

/// Parameters a plan binds itself and those it expects at execution time.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterRegistry {
    values: IndexMap<SmolStr, Value>,
    required: IndexSet<SmolStr>,
}

impl ParameterRegistry {
    pub fn bind(&mut self, name: SmolStr, value: Value) {
        self.values.insert(name, value);
    }

    pub fn require(&mut self, name: SmolStr) {
        self.required.insert(name);
    }

    pub fn values(&self) -> &IndexMap<SmolStr, Value> {
        &self.values
    }

    pub fn required(&self) -> impl Iterator<Item = &SmolStr> {
        self.required.iter()
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.contains(name)
    }
}

/// Everything the query engine needs to produce rows of one shape.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryFragments {
    pub projections: Vec<Projection>,
    pub joins: Vec<JoinFragment>,
    pub parameters: ParameterRegistry,
}

/// Builds scalar subqueries on behalf of a [`SubqueryProvider`].
#[derive(Clone, Debug, Default)]
pub struct SubqueryBuilder {
    outer: Option<String>,
    from: Vec<(SmolStr, SmolStr)>,
    select: Option<String>,
    predicates: Vec<String>,
    parameters: OptionalParameters,
}

impl SubqueryBuilder {
    pub fn new(outer: Option<String>) -> Self {
        SubqueryBuilder {
            outer,
            ..SubqueryBuilder::default()
        }
    }

    /// Resolves `path` against the view that owns the attribute.
    pub fn outer(&self, path: &str) -> String {
        match &self.outer {
            Some(prefix) => prefix_expression(Some(prefix), None, path)
                .unwrap_or_else(|_| format!("{}.{}", prefix, path)),
            None => path.to_string(),
        }
    }

    pub fn from(&mut self, entity: &str, alias: &str) -> &mut Self {
        self.from.push((SmolStr::new(entity), SmolStr::new(alias)));
        self
    }

    pub fn select(&mut self, expression: &str) -> &mut Self {
        self.select = Some(expression.to_string());
        self
    }

    pub fn restrict(&mut self, predicate: impl Into<String>) -> &mut Self {
        self.predicates.push(predicate.into());
        self
    }

    pub fn set_parameter(&mut self, name: &str, value: Value) -> &mut Self {
        self.parameters.insert(SmolStr::new(name), value);
        self
    }

    pub fn render(&self) -> Result<String, String> {
        let select = self
            .select
            .as_deref()
            .ok_or_else(|| "subquery provider selected nothing".to_string())?;
        if self.from.is_empty() {
            return Err("subquery provider declared no FROM entity".to_string());
        }
        let from = self
            .from
            .iter()
            .map(|(entity, alias)| format!("{} {}", entity, alias))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!("(SELECT {} FROM {}", select, from);
        if !self.predicates.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.predicates.join(" AND "));
        }
        sql.push(')');
        Ok(sql)
    }
}

/// Contributes a scalar subquery for an attribute.
pub trait SubqueryProvider: Send + Sync {
    fn create_subquery(&self, builder: &mut SubqueryBuilder, parameters: &OptionalParameters);
}

impl<F> SubqueryProvider for F
where
    F: Fn(&mut SubqueryBuilder, &OptionalParameters) + Send + Sync,
{
    fn create_subquery(&self, builder: &mut SubqueryBuilder, parameters: &OptionalParameters) {
        self(builder, parameters)
    }
}

/// Replaces whole-word occurrences of `alias` in `wrapper`.
pub fn substitute_alias(wrapper: &str, alias: &str, subquery: &str) -> Result<String, String> {
    let pattern = Regex::new(&format!(r"\b{}\b", regex::escape(alias)))
        .map_err(|e| format!("invalid subquery alias '{}': {}", alias, e))?;
    if !pattern.is_match(wrapper) {
        return Err(format!("expression does not reference alias '{}'", alias));
    }
    Ok(pattern.replace_all(wrapper, NoExpand(subquery)).into_owned())
}

/// Produces the projection for one slot and registers its parameters.
#[derive(Clone)]
pub enum SlotMapper {
    Expression {
        expression: String,
        alias: Option<SmolStr>,
    },
    Subquery {
        location: String,
        provider_name: SmolStr,
        provider: Arc<dyn SubqueryProvider>,
        outer: Option<String>,
        /// Wrapping expression and the alias it uses for the subquery.
        wrapper: Option<(String, SmolStr)>,
        alias: Option<SmolStr>,
    },
    Parameter {
        name: SmolStr,
        alias: Option<SmolStr>,
    },
    Multiset {
        query: Box<CorrelatedQuery>,
        alias: Option<SmolStr>,
    },
    /// NULL slot filled after the row is read.
    Placeholder {
        alias: Option<SmolStr>,
    },
    Consumed,
}

impl fmt::Debug for SlotMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotMapper::Expression { expression, alias } => f
                .debug_struct("Expression")
                .field("expression", expression)
                .field("alias", alias)
                .finish(),
            SlotMapper::Subquery {
                provider_name,
                alias,
                ..
            } => f
                .debug_struct("Subquery")
                .field("provider", provider_name)
                .field("alias", alias)
                .finish(),
            SlotMapper::Parameter { name, .. } => {
                f.debug_struct("Parameter").field("name", name).finish()
            }
            SlotMapper::Multiset { query, .. } => f
                .debug_struct("Multiset")
                .field("entity", &query.entity)
                .finish(),
            SlotMapper::Placeholder { alias } => {
                f.debug_struct("Placeholder").field("alias", alias).finish()
            }
            SlotMapper::Consumed => f.write_str("Consumed"),
        }
    }
}

impl SlotMapper {
    pub fn apply(
        &self,
        fragments: &mut QueryFragments,
        parameters: &OptionalParameters,
    ) -> Result<(), ConfigError> {
        let projection = match self {
            SlotMapper::Expression { expression, alias } => Projection::Expression {
                expression: expression.clone(),
                alias: alias.clone(),
            },
            SlotMapper::Subquery {
                location,
                provider_name,
                provider,
                outer,
                wrapper,
                alias,
            } => {
                let mut builder = SubqueryBuilder::new(outer.clone());
                provider.create_subquery(&mut builder, parameters);
                let unresolvable = |reason: String| ConfigError::UnresolvablePath {
                    location: location.clone(),
                    mapping: provider_name.to_string(),
                    reason,
                };
                let subquery = builder.render().map_err(unresolvable)?;
                for (name, value) in builder.parameters {
                    fragments.parameters.bind(name, value);
                }
                let expression = match wrapper {
                    Some((wrapper, subquery_alias)) => {
                        check_expression(wrapper).map_err(unresolvable)?;
                        substitute_alias(wrapper, subquery_alias, &subquery).map_err(unresolvable)?
                    }
                    None => subquery,
                };
                Projection::Expression {
                    expression,
                    alias: alias.clone(),
                }
            }
            SlotMapper::Parameter { name, alias } => {
                fragments.parameters.require(name.clone());
                Projection::Null {
                    alias: alias.clone(),
                }
            }
            SlotMapper::Multiset { query, alias } => Projection::Multiset {
                query: query.clone(),
                alias: alias.clone(),
            },
            SlotMapper::Placeholder { alias } => Projection::Null {
                alias: alias.clone(),
            },
            SlotMapper::Consumed => Projection::Null { alias: None },
        };
        fragments.projections.push(projection);
        Ok(())
    }
}

/// Alias of an attribute's slot under an alias prefix.
pub fn attribute_alias(prefix: Option<&str>, attribute: &str) -> SmolStr {
    match prefix {
        Some(prefix) if !prefix.is_empty() => SmolStr::new(format!("{}_{}", prefix, attribute)),
        _ => SmolStr::new(attribute),
    }
}

/// Alias of the index or key slot that belongs to `alias`.
pub fn key_alias(alias: &str) -> SmolStr {
    SmolStr::new(format!("{}_KEY", alias))
}

/// Expression projecting the list index or map key of a collection element.
pub fn index_expression(
    plurality: Plurality,
    index: &IndexMapping,
    collection: &str,
    root: Option<&str>,
) -> Result<String, String> {
    match index {
        IndexMapping::Implicit if plurality.is_map_like() => Ok(format!("KEY({})", collection)),
        IndexMapping::Implicit => Ok(format!("INDEX({})", collection)),
        IndexMapping::Expression { expression } => {
            prefix_expression(Some(collection), root, expression)
        }
    }
}

/// Expression projecting the element of a collection; implicit map keys
/// pair with `VALUE(..)`.
pub fn element_expression(plurality: Plurality, index: Option<&IndexMapping>, collection: &str) -> String {
    match index {
        Some(IndexMapping::Implicit) if plurality.is_map_like() => format!("VALUE({})", collection),
        _ => collection.to_string(),
    }
}

/// Wraps typed expressions so nested rows can travel as text.
pub fn textual(ty: BasicType, expression: String) -> String {
    match ty {
        BasicType::String | BasicType::Any => expression,
        _ => format!("CAST_STRING({})", expression),
    }
}
