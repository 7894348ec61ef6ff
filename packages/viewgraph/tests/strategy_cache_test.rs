//! Construction strategy cache under concurrent plan building
//!
//! Plans built from many threads against one metamodel generate each
//! strategy exactly once.

mod common;

use common::*;
use std::sync::Arc;
use viewgraph::engine::construct::StrategyRegistry;
use viewgraph::{MaterializationPlan, MaterializerConfig, ProviderRegistry, ViewMaterializer, ViewSetting};

#[test]
fn test_strategies_generated_once_across_threads() {
    init_logging();
    let registry = StrategyRegistry::new();
    let model = catalog();
    let providers = ProviderRegistry::new();
    let config = MaterializerConfig::default();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..20 {
                    let plan = MaterializationPlan::build(
                        &model,
                        &providers,
                        &config,
                        &registry,
                        &ViewSetting::new("Author"),
                    );
                    assert!(plan.is_ok());
                }
            });
        }
    });

    println!("[TEST] generated: {}", registry.generated());
    // Author and Book
    assert_eq!(registry.generated(), 2);
    assert_eq!(registry.len(), 2);
}

#[test]
fn test_materializer_reuses_cached_strategies() {
    let registry: &'static StrategyRegistry = Box::leak(Box::new(StrategyRegistry::new()));
    let materializer = ViewMaterializer::new(
        Arc::new(catalog()),
        ProviderRegistry::new(),
        MaterializerConfig::default(),
    )
    .with_strategies(registry);

    materializer.plan(&ViewSetting::new("Author")).unwrap();
    materializer.plan(&ViewSetting::new("Author")).unwrap();
    materializer.plan(&ViewSetting::new("Tagged")).unwrap();
    assert_eq!(registry.generated(), 3);
}

#[test]
fn test_separate_metamodels_do_not_share_strategies() {
    let registry: &'static StrategyRegistry = Box::leak(Box::new(StrategyRegistry::new()));
    for _ in 0..2 {
        let materializer = ViewMaterializer::new(
            Arc::new(catalog()),
            ProviderRegistry::new(),
            MaterializerConfig::default(),
        )
        .with_strategies(registry);
        materializer.plan(&ViewSetting::new("Tagged")).unwrap();
    }
    assert_eq!(registry.generated(), 2);
}
