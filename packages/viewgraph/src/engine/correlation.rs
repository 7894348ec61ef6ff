//! Correlated attributes.
//!
//! A correlated attribute takes its value from a related entity scoped to a
//! basis expression of the enclosing view. The [`CorrelationProvider`]
//! registered for the attribute describes the relation; the attribute's
//! fetch strategy decides whether the related rows are joined into the main
//! query, embedded as a multiset, or fetched afterwards in batches through
//! a [`CorrelationExecutor`].

use super::accumulator::field_value;
use super::mapping::{check_expression, QueryFragments};
use super::metamodel::{Direction, FetchStrategy, Limiter};
use super::types::{compare_values, ResultTuple, Value};
use crate::error::ConfigError;
use smol_str::SmolStr;
use std::cmp::Ordering;

/// Parameter a select-fetched correlation binds to the batch of basis values.
pub const BATCH_BASIS_PARAMETER: &str = "basis";

/// Collects what a provider declares about a correlation.
#[derive(Clone, Debug, Default)]
pub struct CorrelationBuilder {
    basis: String,
    correlated: Option<(SmolStr, SmolStr)>,
    condition: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl CorrelationBuilder {
    pub fn new(basis: String) -> Self {
        CorrelationBuilder {
            basis,
            ..CorrelationBuilder::default()
        }
    }

    /// The basis expression, or `:basis` for batch fetches.
    pub fn basis(&self) -> &str {
        &self.basis
    }

    pub fn correlate(&mut self, entity: &str, alias: &str) -> &mut Self {
        self.correlated = Some((SmolStr::new(entity), SmolStr::new(alias)));
        self
    }

    pub fn on(&mut self, condition: impl Into<String>) -> &mut Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn limit(&mut self, limit: usize) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(&mut self, offset: usize) -> &mut Self {
        self.offset = Some(offset);
        self
    }
}

/// Describes the relation behind a correlated attribute.
pub trait CorrelationProvider: Send + Sync {
    fn apply_correlation(&self, builder: &mut CorrelationBuilder, basis: &str);
}

impl<F> CorrelationProvider for F
where
    F: Fn(&mut CorrelationBuilder, &str) + Send + Sync,
{
    fn apply_correlation(&self, builder: &mut CorrelationBuilder, basis: &str) {
        self(builder, basis)
    }
}

/// A resolved correlation, ready to be joined, nested or executed.
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelatedQuery {
    pub entity: SmolStr,
    pub alias: SmolStr,
    pub condition: String,
    pub strategy: FetchStrategy,
    pub limiter: Option<Limiter>,
    /// Select list of the nested rows; empty for joined correlations.
    pub fragments: QueryFragments,
}

/// Runs the provider for an attribute and validates what it declared.
pub fn resolve_correlation(
    location: &str,
    provider_name: &SmolStr,
    provider: &dyn CorrelationProvider,
    basis: String,
    strategy: FetchStrategy,
    limiter: Option<&Limiter>,
) -> Result<CorrelatedQuery, ConfigError> {
    let mut builder = CorrelationBuilder::new(basis.clone());
    provider.apply_correlation(&mut builder, &basis);

    let unresolvable = |reason: String| ConfigError::UnresolvablePath {
        location: location.to_string(),
        mapping: provider_name.to_string(),
        reason,
    };
    let (entity, alias) = builder
        .correlated
        .ok_or_else(|| unresolvable("provider declared no correlated entity".to_string()))?;
    let condition = builder
        .condition
        .ok_or_else(|| unresolvable("provider declared no correlation condition".to_string()))?;
    check_expression(&condition).map_err(unresolvable)?;

    let own_limit = builder.limit.is_some() || builder.offset.is_some();
    let limiter = match limiter {
        Some(_) if own_limit => {
            return Err(ConfigError::ConflictingLimiter {
                location: location.to_string(),
                provider: provider_name.clone(),
            })
        }
        Some(limiter) => Some(limiter.clone()),
        None if own_limit => Some(Limiter {
            limit: builder.limit,
            offset: builder.offset,
            order_by: Vec::new(),
        }),
        None => None,
    };

    Ok(CorrelatedQuery {
        entity,
        alias,
        condition,
        strategy,
        limiter,
        fragments: QueryFragments::default(),
    })
}

/// Executes select-fetched correlations for a batch of basis values.
/// Every returned row carries the basis value it belongs to in slot 0.
///
/// The query's limiter applies per basis value and is applied in memory
/// after execution; executors must return every related row.
pub trait CorrelationExecutor {
    fn execute(&mut self, query: &CorrelatedQuery, basis: &[Value]) -> anyhow::Result<Vec<ResultTuple>>;
}

impl<F> CorrelationExecutor for F
where
    F: FnMut(&CorrelatedQuery, &[Value]) -> anyhow::Result<Vec<ResultTuple>>,
{
    fn execute(&mut self, query: &CorrelatedQuery, basis: &[Value]) -> anyhow::Result<Vec<ResultTuple>> {
        self(query, basis)
    }
}

/// Orders, skips and caps elements of one basis value in memory.
pub fn apply_limiter(limiter: &Limiter, elements: &mut Vec<Value>) {
    if !limiter.order_by.is_empty() {
        elements.sort_by(|a, b| {
            for order in &limiter.order_by {
                let ordering = compare_values(&field_value(a, &order.field), &field_value(b, &order.field));
                let ordering = match order.direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }
    let offset = limiter.offset.unwrap_or(0).min(elements.len());
    elements.drain(..offset);
    if let Some(limit) = limiter.limit {
        elements.truncate(limit);
    }
}

#[cfg(test)]
mod correlation_tests {
    use super::*;
    use crate::engine::metamodel::OrderSpec;
    use crate::engine::types::AttributePath;

    fn documents(builder: &mut CorrelationBuilder, basis: &str) {
        builder
            .correlate("Document", "d")
            .on(format!("d.owner.id = {}", basis));
    }

    fn capped(builder: &mut CorrelationBuilder, basis: &str) {
        documents(builder, basis);
        builder.limit(2);
    }

    #[test]
    fn test_resolves_join_correlation() {
        let query = resolve_correlation(
            "Person.documents",
            &"documents".into(),
            &documents,
            "e.id".to_string(),
            FetchStrategy::Join,
            None,
        )
        .unwrap();
        assert_eq!(query.entity, "Document");
        assert_eq!(query.alias, "d");
        assert_eq!(query.condition, "d.owner.id = e.id");
        assert_eq!(query.limiter, None);
    }

    #[test]
    fn test_conflicting_limiter_fails() {
        let limiter = Limiter {
            limit: Some(5),
            ..Limiter::default()
        };
        let err = resolve_correlation(
            "Person.documents",
            &"capped".into(),
            &capped,
            "e.id".to_string(),
            FetchStrategy::Multiset,
            Some(&limiter),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::ConflictingLimiter {
                location: "Person.documents".to_string(),
                provider: "capped".into(),
            }
        );
    }

    #[test]
    fn test_provider_limit_becomes_limiter() {
        let query = resolve_correlation(
            "Person.documents",
            &"capped".into(),
            &capped,
            ":basis".to_string(),
            FetchStrategy::Select,
            None,
        )
        .unwrap();
        assert_eq!(query.limiter.and_then(|l| l.limit), Some(2));
    }

    #[test]
    fn test_provider_without_entity_fails() {
        let empty = |_: &mut CorrelationBuilder, _: &str| {};
        let err = resolve_correlation(
            "Person.documents",
            &"empty".into(),
            &empty,
            "e.id".to_string(),
            FetchStrategy::Join,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvablePath { .. }));
    }

    #[test]
    fn test_apply_limiter() {
        let limiter = Limiter {
            limit: Some(2),
            offset: Some(1),
            order_by: vec![OrderSpec {
                field: AttributePath::root(),
                direction: Direction::Desc,
            }],
        };
        let mut elements: Vec<Value> = [3, 9, 1, 7].into_iter().map(Value::from).collect();
        apply_limiter(&limiter, &mut elements);
        assert_eq!(elements, vec![Value::from(7), Value::from(3)]);
    }

    #[test]
    fn test_offset_past_end_empties() {
        let limiter = Limiter {
            offset: Some(10),
            ..Limiter::default()
        };
        let mut elements = vec![Value::from(1)];
        apply_limiter(&limiter, &mut elements);
        assert!(elements.is_empty());
    }
}
