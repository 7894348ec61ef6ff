use crate::config::MaterializerConfig;
use crate::debug_log;
use crate::engine::builder::GraphBuilder;
use crate::engine::construct::{ConstructionStrategy, StrategyKey, StrategyRegistry};
use crate::engine::correlation::CorrelationExecutor;
use crate::engine::metamodel::Metamodel;
use crate::engine::providers::ProviderRegistry;
use crate::engine::template::{MaterializationPlan, ViewSetting};
use crate::engine::tracking::ViewRef;
use crate::engine::types::{AttributePath, ResultTuple, Value};
use crate::error::{ConfigError, MaterializeError};
use anyhow::{anyhow, Result};
use smol_str::SmolStr;
use std::sync::Arc;
use tracing::instrument;

/// Entry point tying a metamodel, its providers and the materializer
/// config together. Plans are built once per view setting and reused for
/// every result set of that setting.
pub struct ViewMaterializer {
    metamodel: Arc<Metamodel>,
    providers: ProviderRegistry,
    config: MaterializerConfig,
    strategies: &'static StrategyRegistry,
}

impl ViewMaterializer {
    pub fn new(metamodel: Arc<Metamodel>, providers: ProviderRegistry, config: MaterializerConfig) -> Self {
        ViewMaterializer {
            metamodel,
            providers,
            config,
            strategies: StrategyRegistry::global(),
        }
    }

    /// Uses `strategies` instead of the process-wide strategy cache.
    pub fn with_strategies(mut self, strategies: &'static StrategyRegistry) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.metamodel
    }

    pub fn config(&self) -> &MaterializerConfig {
        &self.config
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    #[instrument(skip(self), fields(view = %setting.view))]
    pub fn plan(&self, setting: &ViewSetting) -> Result<MaterializationPlan, ConfigError> {
        MaterializationPlan::build(
            &self.metamodel,
            &self.providers,
            &self.config,
            self.strategies,
            setting,
        )
    }

    /// Turns the rows of one result set into root view instances.
    #[instrument(skip_all, fields(view = %plan.view()))]
    pub fn materialize<I>(
        &self,
        plan: &MaterializationPlan,
        rows: I,
        executor: Option<&mut dyn CorrelationExecutor>,
    ) -> Result<Vec<ViewRef>, MaterializeError>
    where
        I: IntoIterator<Item = ResultTuple>,
    {
        GraphBuilder::new(plan, &self.providers).build(rows.into_iter().map(Ok), executor)
    }

    /// Like [`materialize`](Self::materialize) for a fallible row source;
    /// the first source error aborts materialization.
    #[instrument(skip_all, fields(view = %plan.view()))]
    pub fn materialize_fallible<I>(
        &self,
        plan: &MaterializationPlan,
        rows: I,
        executor: Option<&mut dyn CorrelationExecutor>,
    ) -> Result<Vec<ViewRef>, MaterializeError>
    where
        I: IntoIterator<Item = Result<ResultTuple>>,
    {
        GraphBuilder::new(plan, &self.providers).build(rows, executor)
    }

    /// Copies `source` into a new instance of `target`. Attributes are
    /// matched by name; unmatched target attributes start empty.
    #[instrument(skip(self, source), fields(source = %source.type_name()))]
    pub fn convert(&self, source: &ViewRef, target: &str) -> Result<ViewRef, MaterializeError> {
        let source_name = source.type_name();
        let source_type = self.metamodel.view(&source_name, "conversion source")?.clone();
        let target_type = self.metamodel.view(target, "conversion target")?.clone();
        let key = StrategyKey::Conversion {
            metamodel: self.metamodel.id(),
            source: source_name.clone(),
            target: SmolStr::new(target),
        };
        let strategy = self.strategies.get_or_create(key, || {
            Ok(ConstructionStrategy::conversion(&source_type, &target_type))
        })?;
        debug_log!("converting {} into {}", source_name, target);
        strategy.convert_from(source)
    }
}

pub mod setting {
    use super::*;
    use serde_json::Value as JsonValue;

    /// Parses a view setting from its JSON form, e.g.
    /// `{"view": "Person", "fetches": ["documents"], "params": {"tenant": 1}}`.
    #[instrument(skip(config))]
    pub fn prepare_setting(config: JsonValue) -> Result<ViewSetting> {
        let view = config
            .get("view")
            .or_else(|| config.get("viewType"))
            .or_else(|| config.get("view_type"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing or invalid 'view'"))?;
        let mut setting = ViewSetting::new(view);

        match config.get("constructor") {
            None | Some(JsonValue::Null) => {}
            Some(JsonValue::String(name)) => setting.constructor = Some(SmolStr::new(name)),
            Some(_) => return Err(anyhow!("Missing or invalid 'constructor'")),
        }

        if let Some(fetches) = config.get("fetches").or_else(|| config.get("fetch")) {
            let fetches = fetches
                .as_array()
                .ok_or_else(|| anyhow!("Missing or invalid 'fetches'"))?;
            for fetch in fetches {
                let path = fetch
                    .as_str()
                    .ok_or_else(|| anyhow!("Fetch paths must be strings, got {}", fetch))?;
                setting.fetches.push(AttributePath::new(path));
            }
        }

        if let Some(params) = config
            .get("parameters")
            .or_else(|| config.get("params"))
            .filter(|v| !v.is_null())
        {
            let params = params
                .as_object()
                .ok_or_else(|| anyhow!("Missing or invalid 'params'"))?;
            for (name, value) in params {
                setting
                    .parameters
                    .insert(SmolStr::new(name), Value::from(value.clone()));
            }
        }

        Ok(setting)
    }
}

pub mod rows {
    use super::*;
    use serde_json::Value as JsonValue;

    /// Parses a result set given as a JSON array of row arrays.
    #[instrument(skip(rows))]
    pub fn prepare_rows(rows: JsonValue) -> Result<Vec<ResultTuple>> {
        match rows {
            JsonValue::Array(rows) => rows.into_iter().map(ResultTuple::from_json).collect(),
            other => Err(anyhow!("Expected an array of result rows, got {}", other)),
        }
    }
}

#[cfg(test)]
mod service_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prepare_setting_accepts_aliases() {
        let setting = setting::prepare_setting(json!({
            "viewType": "Person",
            "constructor": "withName",
            "fetch": ["documents", "documents.owner"],
            "params": {"tenant": 7}
        }))
        .unwrap();
        assert_eq!(setting.view, "Person");
        assert_eq!(setting.constructor.as_deref(), Some("withName"));
        assert_eq!(
            setting.fetches,
            vec![AttributePath::new("documents"), AttributePath::new("documents.owner")]
        );
        assert_eq!(setting.parameters.get("tenant"), Some(&Value::from(7)));
    }

    #[test]
    fn test_prepare_setting_requires_view() {
        let err = setting::prepare_setting(json!({"fetches": []})).unwrap_err();
        assert!(err.to_string().contains("'view'"));
    }

    #[test]
    fn test_prepare_setting_rejects_non_string_fetch() {
        let err = setting::prepare_setting(json!({"view": "Person", "fetches": [1]})).unwrap_err();
        assert!(err.to_string().contains("Fetch paths"));
    }

    #[test]
    fn test_prepare_rows() {
        let rows = rows::prepare_rows(json!([[1, "a"], [2, null]])).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get(1), &Value::Null);
        assert!(rows::prepare_rows(json!({"id": 1})).is_err());
        assert!(rows::prepare_rows(json!([{"id": 1}])).is_err());
    }
}
