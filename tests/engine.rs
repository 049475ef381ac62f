mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use common::{
    build_engine, AllowAllQuota, EchoExecutor, FailingExecutor, MapOutputCache, NoopHistory, NoopMetrics, NoopPlugin,
};
use orchestra_core::collaborators::{FirstArrayFieldExtractor, StepError, StepExecutor};
use orchestra_core::config::RuntimeConfig;
use orchestra_core::context::{ExecutionContext, StepOutput};
use orchestra_core::engine::{Engine, StopReason};
use orchestra_core::plan::{ExecutionPlan, StepDescriptor};
use orchestra_core::state_manager::InMemoryStore;
use orchestra_core::types::{ExecutionStatus, StepKind};

fn linear_plan() -> ExecutionPlan {
    let a = StepDescriptor::new("a", StepKind::Action);
    let mut b = StepDescriptor::new("b", StepKind::Action);
    b.dependency_level = 1;
    ExecutionPlan::new("linear", vec![a, b])
}

#[tokio::test]
async fn runs_a_linear_plan_to_completion() {
    let executor = Arc::new(EchoExecutor::new());
    let engine = build_engine(executor.clone());

    let outcome = engine
        .execute("agent-1", "user-1", "session-1", linear_plan(), json!({}), None, None)
        .await
        .expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.context.completed_steps, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_failing_step_fails_the_whole_run() {
    let engine = build_engine(Arc::new(FailingExecutor { code: "VALIDATION_ERROR" }));

    let outcome = engine
        .execute("agent-1", "user-1", "session-1", linear_plan(), json!({}), None, None)
        .await
        .expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert!(outcome.error.is_some());
}

#[tokio::test]
async fn pausing_mid_run_halts_before_the_next_step() {
    struct PausingExecutor {
        engine: std::sync::Weak<Engine>,
    }

    #[async_trait]
    impl StepExecutor for PausingExecutor {
        async fn execute(&self, step: &StepDescriptor, ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
            if step.step_id == "a" {
                if let Some(engine) = self.engine.upgrade() {
                    engine.request_pause(&ctx.execution_id);
                }
            }
            Ok(StepOutput {
                step_id: step.step_id.clone(),
                plugin: None,
                action: None,
                data: json!(null),
                metadata: Default::default(),
            })
        }
    }

    let engine = Arc::new_cyclic(|weak| {
        Engine::new(
            RuntimeConfig::default(),
            Arc::new(PausingExecutor { engine: weak.clone() }),
            Arc::new(NoopPlugin),
            Arc::new(InMemoryStore::new()),
            Arc::new(MapOutputCache::default()),
            Arc::new(AllowAllQuota),
            Arc::new(NoopMetrics),
            Arc::new(NoopHistory),
            Arc::new(FirstArrayFieldExtractor),
        )
    });

    let outcome = engine
        .execute("agent-1", "user-1", "session-1", linear_plan(), json!({}), None, None)
        .await
        .expect("execute");

    assert_eq!(outcome.status, ExecutionStatus::Paused);
    assert_eq!(outcome.stop_reason, Some(StopReason::Paused));
    assert_eq!(outcome.context.completed_steps, vec!["a".to_string()]);
}

#[tokio::test]
async fn resume_continues_from_cached_outputs_without_rerunning_completed_steps() {
    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StepExecutor for CountingExecutor {
        async fn execute(&self, step: &StepDescriptor, ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if step.step_id == "b" {
                let _ = ctx.resolve_variable("missing");
            }
            Ok(StepOutput {
                step_id: step.step_id.clone(),
                plugin: None,
                action: None,
                data: json!(null),
                metadata: Default::default(),
            })
        }
    }

    let state_store = Arc::new(InMemoryStore::new());
    let output_cache = Arc::new(MapOutputCache::default());
    let executor = Arc::new(CountingExecutor { calls: AtomicUsize::new(0) });

    let first_engine = Engine::new(
        RuntimeConfig::default(),
        executor.clone(),
        Arc::new(NoopPlugin),
        state_store.clone(),
        output_cache.clone(),
        Arc::new(AllowAllQuota),
        Arc::new(NoopMetrics),
        Arc::new(NoopHistory),
        Arc::new(FirstArrayFieldExtractor),
    );

    let plan = linear_plan();
    let first = first_engine
        .execute("agent-1", "user-1", "session-1", plan.clone(), json!({}), Some("exec-resume".to_string()), None)
        .await
        .expect("execute");
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 2);

    // A fresh engine resuming the same execution id should not re-run
    // either completed step; the run is already done, so resume is a no-op
    // replay of cached outputs.
    let second_engine = Engine::new(
        RuntimeConfig::default(),
        executor.clone(),
        Arc::new(NoopPlugin),
        state_store,
        output_cache,
        Arc::new(AllowAllQuota),
        Arc::new(NoopMetrics),
        Arc::new(NoopHistory),
        Arc::new(FirstArrayFieldExtractor),
    );
    let resumed = second_engine.resume("exec-resume", &plan).await;
    assert!(resumed.is_err(), "resuming a completed execution should be rejected");
}
