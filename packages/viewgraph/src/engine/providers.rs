use super::correlation::CorrelationProvider;
use super::mapping::SubqueryProvider;
use super::metamodel::ViewType;
use super::types::{FastMap, Value};
use smol_str::SmolStr;
use std::fmt;
use std::sync::Arc;

/// Builds the final attribute values of a view from its assembled values
/// and constructor arguments. Must return one value per attribute.
pub trait ViewFactory: Send + Sync {
    fn create(
        &self,
        view: &ViewType,
        attributes: Vec<Value>,
        arguments: &[Value],
    ) -> anyhow::Result<Vec<Value>>;
}

impl<F> ViewFactory for F
where
    F: Fn(&ViewType, Vec<Value>, &[Value]) -> anyhow::Result<Vec<Value>> + Send + Sync,
{
    fn create(
        &self,
        view: &ViewType,
        attributes: Vec<Value>,
        arguments: &[Value],
    ) -> anyhow::Result<Vec<Value>> {
        self(view, attributes, arguments)
    }
}

/// Named collaborators referenced from mappings and constructors.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    subqueries: FastMap<SmolStr, Arc<dyn SubqueryProvider>>,
    correlations: FastMap<SmolStr, Arc<dyn CorrelationProvider>>,
    factories: FastMap<SmolStr, Arc<dyn ViewFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subquery(mut self, name: &str, provider: impl SubqueryProvider + 'static) -> Self {
        self.subqueries.insert(SmolStr::new(name), Arc::new(provider));
        self
    }

    pub fn with_correlation(
        mut self,
        name: &str,
        provider: impl CorrelationProvider + 'static,
    ) -> Self {
        self.correlations.insert(SmolStr::new(name), Arc::new(provider));
        self
    }

    pub fn with_factory(mut self, name: &str, factory: impl ViewFactory + 'static) -> Self {
        self.factories.insert(SmolStr::new(name), Arc::new(factory));
        self
    }

    pub fn subquery(&self, name: &str) -> Option<&Arc<dyn SubqueryProvider>> {
        self.subqueries.get(name)
    }

    pub fn correlation(&self, name: &str) -> Option<&Arc<dyn CorrelationProvider>> {
        self.correlations.get(name)
    }

    pub fn factory(&self, name: &str) -> Option<&Arc<dyn ViewFactory>> {
        self.factories.get(name)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |keys: Vec<&SmolStr>| {
            let mut names: Vec<String> = keys.into_iter().map(|n| n.to_string()).collect();
            names.sort();
            names
        };
        f.debug_struct("ProviderRegistry")
            .field("subqueries", &names(self.subqueries.keys().collect()))
            .field("correlations", &names(self.correlations.keys().collect()))
            .field("factories", &names(self.factories.keys().collect()))
            .finish()
    }
}
