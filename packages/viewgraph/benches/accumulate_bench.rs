use divan::{black_box, AllocProfiler, Bencher};
use std::sync::Arc;
use viewgraph::engine::metamodel::{AttributeMapping, Plurality, ViewType};
use viewgraph::engine::types::{ResultTuple, Value};
use viewgraph::{MaterializerConfig, Metamodel, ProviderRegistry, ViewMaterializer, ViewSetting};

#[global_allocator]
static ALLOC: AllocProfiler = AllocProfiler::system();

fn main() {
    divan::main();
}

// --------------------------------------------------------------------------
// Fixtures
// --------------------------------------------------------------------------

fn materializer() -> ViewMaterializer {
    let thread = ViewType::new(
        "Thread",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("title", "title"),
            AttributeMapping::basic("comments", "comments")
                .plural(Plurality::List)
                .ordered()
                .of_view("Comment"),
        ],
    )
    .with_id("id");
    let comment = ViewType::new(
        "Comment",
        vec![
            AttributeMapping::basic("id", "id"),
            AttributeMapping::basic("content", "content"),
        ],
    )
    .with_id("id");
    let model = Metamodel::new(vec![thread, comment]).expect("bench metamodel");
    ViewMaterializer::new(Arc::new(model), ProviderRegistry::new(), MaterializerConfig::default())
}

/// `threads` parents with `comments` child rows each, already grouped.
fn rows(threads: usize, comments: usize) -> Vec<ResultTuple> {
    let mut out = Vec::with_capacity(threads * comments);
    for t in 0..threads {
        for c in 0..comments {
            out.push(ResultTuple::new(vec![
                Value::Int(t as i64),
                Value::from("thread title"),
                Value::Int((t * comments + c) as i64),
                Value::from("comment body"),
            ]));
        }
    }
    out
}

// --------------------------------------------------------------------------
// Benchmarks
// --------------------------------------------------------------------------

#[divan::bench(args = [1, 10, 100])]
fn materialize_threads(bencher: Bencher, comments: usize) {
    let materializer = materializer();
    let plan = materializer
        .plan(&ViewSetting::new("Thread"))
        .expect("thread plan");
    let input = rows(100, comments);

    bencher.bench_local(|| {
        let threads = materializer
            .materialize(&plan, black_box(input.clone()), None)
            .expect("materialize");
        black_box(threads.len())
    });
}

#[divan::bench]
fn build_plan(bencher: Bencher) {
    let materializer = materializer();
    bencher.bench_local(|| black_box(materializer.plan(&ViewSetting::new("Thread")).is_ok()));
}
