//! Shared fixtures for viewgraph integration tests
//!
//! Metamodel builders, correlation providers and row helpers. Slot layouts
//! are listed next to each view so tests can build rows by hand.

#![allow(dead_code)]

use std::sync::Arc;
use viewgraph::engine::correlation::CorrelationBuilder;
use viewgraph::engine::metamodel::{
    AttributeMapping, BasicType, Direction, FetchStrategy, IndexMapping, InnerCollection, Limiter,
    Mutability, OrderSpec, Plurality, SortSpec, Uniqueness, ViewType,
};
use viewgraph::engine::types::{ResultTuple, Value};
use viewgraph::{AttributePath, MaterializerConfig, Metamodel, ProviderRegistry, ViewMaterializer, ViewRef};

/// Routes `tracing` output to the test harness. Honors `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn row(values: Vec<Value>) -> ResultTuple {
    ResultTuple::new(values)
}

pub fn ids(values: &Value) -> Vec<Value> {
    values
        .as_list()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_view().and_then(ViewRef::id))
                .collect()
        })
        .unwrap_or_default()
}

pub fn strs(values: &[&str]) -> Vec<Value> {
    values.iter().map(|s| Value::from(*s)).collect()
}

/// Collection views, one plural attribute each.
///
/// | view       | slots                                         |
/// |------------|-----------------------------------------------|
/// | Author     | id, name, books.id, books.title               |
/// | Tagged     | id, INDEX(tags), tags                         |
/// | Labelled   | id, labels                                    |
/// | Ranked     | id, scores                                    |
/// | Coded      | id, codes                                     |
/// | Glossary   | id, KEY(terms), terms                         |
pub fn catalog() -> Metamodel {
    let author = ViewType::new(
        "Author",
        vec![
            AttributeMapping::basic("id", "id").typed(BasicType::Int),
            AttributeMapping::basic("name", "name").typed(BasicType::String),
            AttributeMapping::basic("books", "books")
                .plural(Plurality::List)
                .ordered()
                .of_view("Book"),
        ],
    )
    .with_id("id");
    let book = ViewType::new(
        "Book",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("title", "title").typed(BasicType::String),
        ],
    )
    .with_id("id");
    let tagged = ViewType::new(
        "Tagged",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("tags", "tags")
                .plural(Plurality::List)
                .indexed(IndexMapping::Implicit),
        ],
    )
    .with_id("id");
    let labelled = ViewType::new(
        "Labelled",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("labels", "labels").plural(Plurality::Set),
        ],
    )
    .with_id("id");
    let ranked = ViewType::new(
        "Ranked",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("scores", "scores")
                .plural(Plurality::Set)
                .typed(BasicType::Int)
                .sorted(SortSpec::Natural),
        ],
    )
    .with_id("id");
    let coded = ViewType::new(
        "Coded",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("codes", "codes")
                .plural(Plurality::List)
                .unique(Uniqueness::Forced),
        ],
    )
    .with_id("id");
    let glossary = ViewType::new(
        "Glossary",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("terms", "terms")
                .plural(Plurality::Map)
                .indexed(IndexMapping::Implicit)
                .sorted(SortSpec::Natural),
        ],
    )
    .with_id("id");
    Metamodel::new(vec![author, book, tagged, labelled, ranked, coded, glossary])
        .expect("catalog metamodel")
}

pub fn documents(builder: &mut CorrelationBuilder, basis: &str) {
    builder
        .correlate("Document", "d")
        .on(format!("d.owner.id = {}", basis));
}

pub fn document_providers() -> ProviderRegistry {
    ProviderRegistry::new().with_correlation("documents", documents)
}

/// Owners fetching their document titles with each strategy.
///
/// | view          | slots                                 | nested slots        |
/// |---------------|---------------------------------------|---------------------|
/// | JoinedOwner   | id, d.title                           |                     |
/// | NestedOwner   | id, multiset                          | d.title             |
/// | BatchedOwner  | id, consumed basis (folds into id)    | basis key, d.title  |
/// | LatestOwner   | id, consumed basis                    | basis key, d.title  |
/// | ChapterOwner  | id, multiset                          | d.title             |
/// | ShelfOwner    | id, multiset                          | d.id, d.title       |
/// | VolumeOwner   | id, d.title                           |                     |
pub fn owners() -> Metamodel {
    let titles = |strategy| {
        AttributeMapping::correlated("docs", "id", "documents", strategy)
            .plural(Plurality::List)
            .with_result("title")
    };
    let joined = ViewType::new(
        "JoinedOwner",
        vec![AttributeMapping::basic("id", "id"), titles(FetchStrategy::Join)],
    )
    .with_id("id");
    let nested = ViewType::new(
        "NestedOwner",
        vec![AttributeMapping::basic("id", "id"), titles(FetchStrategy::Multiset)],
    )
    .with_id("id");
    let batched = ViewType::new(
        "BatchedOwner",
        vec![
            AttributeMapping::basic("id", "id"),
            titles(FetchStrategy::Select).with_batch_size(2),
        ],
    )
    .with_id("id");
    let mut latest = ViewType::new(
        "LatestOwner",
        vec![
            AttributeMapping::basic("id", "id"),
            titles(FetchStrategy::Select).with_limiter(Limiter {
                limit: Some(1),
                offset: None,
                order_by: vec![OrderSpec {
                    field: AttributePath::root(),
                    direction: Direction::Desc,
                }],
            }),
        ],
    )
    .with_id("id");
    latest.default_batch_size = Some(10);
    let chapters = ViewType::new(
        "ChapterOwner",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::correlated("docs", "id", "documents", FetchStrategy::Multiset)
                .plural(Plurality::MultiList(InnerCollection::List))
                .with_result("title"),
        ],
    )
    .with_id("id");
    let doc = ViewType::new(
        "Doc",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("title", "title"),
        ],
    )
    .with_id("id");
    let shelves = ViewType::new(
        "ShelfOwner",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::correlated("docs", "id", "documents", FetchStrategy::Multiset)
                .plural(Plurality::MultiList(InnerCollection::List))
                .of_view("Doc"),
        ],
    )
    .with_id("id");
    let volumes = ViewType::new(
        "VolumeOwner",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::correlated("docs", "id", "documents", FetchStrategy::Join)
                .plural(Plurality::MultiList(InnerCollection::List))
                .with_result("title"),
        ],
    )
    .with_id("id");
    Metamodel::new(vec![joined, nested, batched, latest, chapters, doc, shelves, volumes])
        .expect("owner metamodel")
}

/// Mutable keeper owning a mutable pet, plus a read-only summary type.
///
/// Keeper slots: id, name, pet.id, pet.name
pub fn keepers() -> Metamodel {
    let keeper = ViewType::new(
        "Keeper",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("name", "name").updatable(),
            AttributeMapping::basic("pet", "pet").of_view("Pet").updatable(),
        ],
    )
    .with_id("id")
    .with_mutability(Mutability::Updatable);
    let pet = ViewType::new(
        "Pet",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("name", "name").updatable(),
        ],
    )
    .with_id("id")
    .with_mutability(Mutability::Updatable);
    let summary = ViewType::new(
        "KeeperSummary",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("name", "name"),
            AttributeMapping::basic("nicknames", "nicknames").plural(Plurality::List),
        ],
    )
    .with_id("id");
    Metamodel::new(vec![keeper, pet, summary]).expect("keeper metamodel")
}

/// Animal with a Dog subtype.
///
/// Slots: CASE discriminator, id, sound (Dog candidate), sound (Animal
/// default), sound target, breed
pub fn zoo() -> Metamodel {
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
    Metamodel::new(vec![animal, dog]).expect("zoo metamodel")
}

pub fn materializer(model: Metamodel, providers: ProviderRegistry) -> ViewMaterializer {
    ViewMaterializer::new(Arc::new(model), providers, MaterializerConfig::default())
}
