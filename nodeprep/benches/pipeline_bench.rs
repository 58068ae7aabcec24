//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nodeprep::core::Severity;
use nodeprep::events::NoOpEventSink;
use nodeprep::pipeline::{Pipeline, PipelineBuilder};
use nodeprep::stages::Stage;
use nodeprep::testing::{RecordingAction, ScriptedProbe};
use std::sync::Arc;

fn noop_pipeline(stages: usize, satisfied: bool) -> Pipeline {
    let mut builder = PipelineBuilder::new("bench")
        .default_severity(Severity::Warn)
        .event_sink(Arc::new(NoOpEventSink));
    for i in 0..stages {
        let probe = if satisfied {
            ScriptedProbe::satisfied()
        } else {
            ScriptedProbe::not_satisfied()
        };
        let mut stage = Stage::new(
            format!("stage-{i}"),
            RecordingAction::failing(format!("primary-{i}")).into_action(),
        )
        .with_fallback(RecordingAction::succeeding(format!("mirror-{i}")).into_action())
        .with_probe(probe.into_probe());
        if i > 0 {
            stage = stage.with_dependency(format!("stage-{}", i - 1));
        }
        builder = builder.stage(stage).expect("valid stage");
    }
    builder.build().expect("valid pipeline")
}

fn pipeline_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("run");
    for stages in [1, 10, 50] {
        let fallback = noop_pipeline(stages, false);
        group.bench_with_input(BenchmarkId::new("via_fallback", stages), &fallback, |b, p| {
            b.iter(|| black_box(runtime.block_on(p.run())));
        });

        let skipped = noop_pipeline(stages, true);
        group.bench_with_input(BenchmarkId::new("all_skipped", stages), &skipped, |b, p| {
            b.iter(|| black_box(runtime.block_on(p.run())));
        });
    }
    group.finish();
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
