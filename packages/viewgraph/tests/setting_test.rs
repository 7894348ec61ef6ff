//! View settings, configuration and plan-time errors
//!
//! - Settings parsed from JSON, fetch restriction and parameters
//! - Materializer config and metamodels loaded from files
//! - Configuration errors surface when the plan is built, never per row

mod common;

use common::*;
use serde_json::json;
use std::io::Write;
use viewgraph::engine::correlation::CorrelationBuilder;
use viewgraph::engine::metamodel::{
    AttributeMapping, ConstructorDescriptor, FetchStrategy, IndexMapping, Limiter, Plurality, ViewType,
};
use viewgraph::engine::types::Value;
use viewgraph::service::setting::prepare_setting;
use viewgraph::{ConfigError, MaterializerConfig, Metamodel, ProviderRegistry, ViewSetting};

// ============================================================================
// SETTINGS
// ============================================================================

#[test]
fn test_setting_from_json_drives_the_plan() {
    init_logging();
    let setting = prepare_setting(json!({
        "view": "Author",
        "fetches": ["name"]
    }))
    .unwrap();
    let materializer = materializer(catalog(), Default::default());
    let plan = materializer.plan(&setting).unwrap();
    // id is always fetched
    assert_eq!(plan.shape().len(), 2);

    let authors = materializer
        .materialize(&plan, vec![row(vec![1.into(), "Ann".into()])], None)
        .unwrap();
    assert_eq!(authors[0].get("name"), Some(Value::from("Ann")));
    assert_eq!(authors[0].get("books"), Some(Value::List(vec![])));
}

#[test]
fn test_parameters_fill_their_slots() {
    let view = ViewType::new(
        "Scoped",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::parameter("tenant", "tenant"),
        ],
    )
    .with_id("id");
    let materializer = materializer(Metamodel::new(vec![view]).unwrap(), Default::default());

    let setting = ViewSetting::new("Scoped").with_parameter("tenant", 7);
    let plan = materializer.plan(&setting).unwrap();
    let scoped = materializer
        .materialize(&plan, vec![row(vec![1.into(), Value::Null])], None)
        .unwrap();
    assert_eq!(scoped[0].get("tenant"), Some(Value::from(7)));

    let plan = materializer.plan(&ViewSetting::new("Scoped")).unwrap();
    let scoped = materializer
        .materialize(&plan, vec![row(vec![1.into(), Value::Null])], None)
        .unwrap();
    assert_eq!(scoped[0].get("tenant"), Some(Value::Null));
}

#[test]
fn test_setting_parser_rejects_bad_params() {
    let err = prepare_setting(json!({"view": "Author", "params": [1, 2]})).unwrap_err();
    assert!(err.to_string().contains("params"));
}

// ============================================================================
// FILES
// ============================================================================

#[test]
fn test_config_file_sets_batch_size() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"batch_sizes": {{"docs": 3}}}}"#).unwrap();
    let config = MaterializerConfig::load(file.path()).unwrap();

    let materializer = viewgraph::ViewMaterializer::new(
        std::sync::Arc::new(owners()),
        document_providers(),
        config,
    );
    let plan = materializer.plan(&ViewSetting::new("BatchedOwner")).unwrap();
    assert_eq!(plan.batches()[0].batch_size, 3);
}

#[test]
fn test_metamodel_loaded_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"views": [{{
            "name": "Note",
            "id_attribute": "id",
            "attributes": [
                {{"name": "id", "kind": "basic", "mapping": "id"}},
                {{"name": "words", "kind": "basic", "mapping": "words", "plurality": "list"}}
            ]
        }}]}}"#
    )
    .unwrap();
    let model = Metamodel::load(file.path()).unwrap();
    let materializer = materializer(model, Default::default());
    let plan = materializer.plan(&ViewSetting::new("Note")).unwrap();

    let rows = vec![row(vec![1.into(), "hi".into()]), row(vec![1.into(), "there".into()])];
    let notes = materializer.materialize(&plan, rows, None).unwrap();
    assert_eq!(notes[0].get("words"), Some(Value::List(strs(&["hi", "there"]))));
}

#[test]
fn test_missing_metamodel_file() {
    let err = Metamodel::load("/no/such/metamodel.json").unwrap_err();
    assert!(err.to_string().contains("Failed to read metamodel file"));
}

// ============================================================================
// CONFIGURATION ERRORS
// ============================================================================

#[test]
fn test_index_on_set_is_rejected_at_build() {
    let view = ViewType::new(
        "Bad",
        vec![AttributeMapping::basic("tags", "tags")
            .plural(Plurality::Set)
            .indexed(IndexMapping::Implicit)],
    );
    let err = Metamodel::new(vec![view]).unwrap_err();
    println!("[TEST] error: {}", err);
    assert!(matches!(err, ConfigError::IllegalIndexMapping { .. }));
    assert!(err.to_string().contains("Bad.tags"));
}

#[test]
fn test_conflicting_limiter_is_rejected_at_plan() {
    let capped = |builder: &mut CorrelationBuilder, basis: &str| {
        documents(builder, basis);
        builder.limit(1);
    };
    let view = ViewType::new(
        "Capped",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::correlated("docs", "id", "capped", FetchStrategy::Multiset)
                .plural(Plurality::List)
                .with_limiter(Limiter {
                    limit: Some(3),
                    ..Limiter::default()
                }),
        ],
    )
    .with_id("id");
    let providers = ProviderRegistry::new().with_correlation("capped", capped);
    let materializer = materializer(Metamodel::new(vec![view]).unwrap(), providers);

    let err = materializer.plan(&ViewSetting::new("Capped")).unwrap_err();
    assert!(matches!(err, ConfigError::ConflictingLimiter { .. }));
}

#[test]
fn test_unresolvable_path_is_rejected_at_plan() {
    let view = ViewType::new("Broken", vec![AttributeMapping::expression("x", "LOWER(name")]);
    let materializer = materializer(Metamodel::new(vec![view]).unwrap(), Default::default());
    let err = materializer.plan(&ViewSetting::new("Broken")).unwrap_err();
    assert!(matches!(err, ConfigError::UnresolvablePath { .. }));
}

#[test]
fn test_missing_provider_is_rejected_at_plan() {
    let materializer = materializer(owners(), ProviderRegistry::new());
    let err = materializer.plan(&ViewSetting::new("JoinedOwner")).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownProvider { .. }));
}

#[test]
fn test_constructor_must_be_named_when_ambiguous() {
    let mut view = ViewType::new("Multi", vec![AttributeMapping::basic("id", "id")]).with_id("id");
    for name in ["fromRow", "fromCache"] {
        view = view.with_constructor(ConstructorDescriptor {
            name: name.into(),
            parameters: vec![],
            factory: None,
        });
    }
    let materializer = materializer(Metamodel::new(vec![view]).unwrap(), Default::default());

    let err = materializer.plan(&ViewSetting::new("Multi")).unwrap_err();
    assert!(matches!(err, ConfigError::AmbiguousConstructor { count: 2, .. }));
    let err = materializer
        .plan(&ViewSetting::new("Multi").with_constructor("fromDisk"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::UnknownConstructor { .. }));
    assert!(materializer
        .plan(&ViewSetting::new("Multi").with_constructor("fromCache"))
        .is_ok());
}

#[test]
fn test_constructor_arguments_reach_the_instance() {
    let view = ViewType::new("Greeting", vec![AttributeMapping::basic("id", "id")])
        .with_id("id")
        .with_constructor(ConstructorDescriptor {
            name: "init".into(),
            parameters: vec![AttributeMapping::basic("salutation", "salutation")],
            factory: None,
        });
    let materializer = materializer(Metamodel::new(vec![view]).unwrap(), Default::default());
    let plan = materializer.plan(&ViewSetting::new("Greeting")).unwrap();
    assert_eq!(plan.shape().len(), 2);

    let greetings = materializer
        .materialize(&plan, vec![row(vec![1.into(), "hello".into()])], None)
        .unwrap();
    assert_eq!(greetings[0].arguments(), vec![Value::from("hello")]);
}
