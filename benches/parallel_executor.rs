//! Benchmarks for the Parallel Executor's fan-out shapes.
//!
//! These benchmarks measure the cost of:
//! - Chunked wait-all execution (`execute_parallel`) at increasing fan-out width
//! - Scatter/gather over a growing item count

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

use orchestra_core::collaborators::{FirstArrayFieldExtractor, StepError, StepExecutor};
use orchestra_core::context::{ExecutionContext, StepOutput, StepOutputMetadata};
use orchestra_core::parallel::ParallelExecutor;
use orchestra_core::plan::StepDescriptor;
use orchestra_core::types::StepKind;

const WIDTHS: &[usize] = &[8, 32, 128];

/// A no-op executor for measuring orchestration overhead in isolation from
/// any real plugin invocation cost.
struct NoopExecutor;

#[async_trait]
impl StepExecutor for NoopExecutor {
    async fn execute(&self, step: &StepDescriptor, _ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
        Ok(StepOutput {
            step_id: step.step_id.clone(),
            plugin: None,
            action: None,
            data: Value::Null,
            metadata: StepOutputMetadata {
                success: true,
                ..Default::default()
            },
        })
    }
}

fn build_steps(width: usize) -> Vec<StepDescriptor> {
    (0..width)
        .map(|i| StepDescriptor::new(format!("step-{i}"), StepKind::Action))
        .collect()
}

fn parallel_fanout(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let executor = ParallelExecutor::new(Arc::new(NoopExecutor), Arc::new(FirstArrayFieldExtractor), 8);
    let ctx = ExecutionContext::new("bench-exec");

    let mut group = c.benchmark_group("parallel_execute_parallel");
    for &width in WIDTHS {
        let steps = build_steps(width);
        group.bench_with_input(BenchmarkId::from_parameter(width), &steps, |b, steps| {
            b.to_async(&runtime).iter(|| async {
                executor.execute_parallel(steps, &ctx).await.expect("execute_parallel");
            });
        });
    }
    group.finish();
}

fn scatter_gather(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let executor = ParallelExecutor::new(Arc::new(NoopExecutor), Arc::new(FirstArrayFieldExtractor), 8);

    let mut group = c.benchmark_group("parallel_scatter_gather");
    for &width in WIDTHS {
        let items: Vec<Value> = (0..width).map(|i| json!({"id": i})).collect();
        let nested_step = StepDescriptor::new("process_item", StepKind::Action);
        let step = StepDescriptor::new("scatter", StepKind::ParallelGroup).with_payload(json!({
            "scatter": {"input": "items", "steps": [nested_step]},
            "gather": {"operation": "collect"},
        }));

        group.bench_with_input(BenchmarkId::from_parameter(width), &step, |b, step| {
            b.to_async(&runtime).iter(|| async {
                let mut ctx = ExecutionContext::new("bench-exec");
                ctx.set_variable("items", json!(items));
                executor.execute_scatter_gather(step, &mut ctx).await.expect("execute_scatter_gather");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, parallel_fanout, scatter_gather);
criterion_main!(benches);
