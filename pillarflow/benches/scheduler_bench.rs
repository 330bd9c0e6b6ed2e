//! Benchmarks for scheduling decisions and aggregation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pillarflow::aggregate::Aggregator;
use pillarflow::core::{StageId, StageOutput, StageResult};
use pillarflow::pipeline::{RegistryBuilder, StageRegistry, StageSpec};
use pillarflow::testing::StaticOperation;
use pillarflow::utils::now_utc;
use std::collections::HashSet;
use std::sync::Arc;

const LAYERS: usize = 8;
const WIDTH: usize = 16;

/// Each stage depends on every stage of the previous layer.
fn layered_registry() -> StageRegistry {
    let op = Arc::new(StaticOperation::score(0.5));
    let mut builder = RegistryBuilder::new("layered");
    for layer in 0..LAYERS {
        for i in 0..WIDTH {
            let mut spec = StageSpec::new(format!("s{layer}_{i}"), op.clone());
            if layer > 0 {
                spec = spec.with_dependencies((0..WIDTH).map(|j| format!("s{}_{j}", layer - 1)));
            }
            builder.add_stage(spec);
        }
    }
    builder.build().unwrap()
}

fn scheduler_benchmark(c: &mut Criterion) {
    let registry = Arc::new(layered_registry());
    let half: HashSet<StageId> = registry
        .topological_order()
        .iter()
        .take(LAYERS * WIDTH / 2)
        .cloned()
        .collect();

    c.bench_function("ready_stages_half_done", |b| {
        b.iter(|| black_box(registry.ready_stages(black_box(&half))))
    });

    let now = now_utc();
    let results: Vec<StageResult> = registry
        .topological_order()
        .iter()
        .map(|id| StageResult::succeeded(id.clone(), StageOutput::score(0.5), Vec::new(), now, now))
        .collect();
    let aggregator = Aggregator::new(registry.clone());

    c.bench_function("aggregate_full_run", |b| {
        b.iter(|| black_box(aggregator.aggregate(black_box(&results)).unwrap()))
    });
}

criterion_group!(benches, scheduler_benchmark);
criterion_main!(benches);
