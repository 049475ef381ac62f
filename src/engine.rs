//! Engine (§2): the composition root that drives an [`ExecutionPlan`] to
//! completion by wiring the four budgeted subsystems together — Controller,
//! State Manager, Parallel Executor, Error Recovery — against the
//! collaborator traits in `collaborators`.
//!
//! This is explicitly **not** one of the four budgeted subsystems (SPEC_FULL
//! §2): it is the thin outer driver loop the spec describes as "external",
//! reified here the way the teacher crate's `AppRunner` composes
//! `Scheduler`/`Checkpointer`/state into one runnable thing instead of
//! leaving every host to hand-roll the wiring itself.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::collaborators::{
    ExecutionHistory, ExecutionOutputCache, MetricsCollector, PluginExecutor, QuotaService,
    SchemaFieldExtractor, StepError, StepExecutor,
};
use crate::config::RuntimeConfig;
use crate::context::{ExecutionContext, StepOutput, StepOutputMetadata};
use crate::controller::{Controller, RollbackResult};
use crate::error_recovery::{self, CircuitBreaker, RetryPolicy};
use crate::errors::OrchestraError;
use crate::event_bus::{EventEmitter, ProgressEvent};
use crate::parallel::ParallelExecutor;
use crate::plan::{ExecutionPlan, StepDescriptor};
use crate::state_manager::{CreateExecutionInput, StateStore};
use crate::types::{ExecutionStatus, StepKind};

/// Why a run loop stopped short of walking the whole plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Paused,
    Cancelled,
    Failed,
}

/// What a caller gets back from [`Engine::execute`]/[`Engine::resume`].
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub context: ExecutionContext,
    pub stop_reason: Option<StopReason>,
    pub error: Option<String>,
}

/// Per-step dispatch override carried in a step's JSON payload:
/// `continue_on_error`, an optional `retry_policy` merge, and an optional
/// `rollback_action` used only by [`Engine::rollback_to_checkpoint`].
fn continue_on_error(step: &StepDescriptor) -> bool {
    step.payload
        .get("continue_on_error")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn fallback_steps_of(step: &StepDescriptor) -> Vec<StepDescriptor> {
    step.payload
        .get("fallback_steps")
        .and_then(Value::as_array)
        .map(|raw| raw.iter().filter_map(|v| serde_json::from_value(v.clone()).ok()).collect())
        .unwrap_or_default()
}

fn step_retry_override(step: &StepDescriptor) -> Option<RetryPolicy> {
    let raw = step.payload.get("retry_policy")?.as_object()?;
    let mut policy = RetryPolicy::default();
    if let Some(n) = raw.get("max_retries").and_then(Value::as_u64) {
        policy.max_retries = n as u32;
    }
    if let Some(ms) = raw.get("backoff_ms").and_then(Value::as_u64) {
        policy.backoff_ms = ms;
    }
    if let Some(mult) = raw.get("backoff_multiplier").and_then(Value::as_f64) {
        policy.backoff_multiplier = mult;
    }
    if let Some(errs) = raw.get("retryable_errors").and_then(Value::as_array) {
        policy.retryable_errors = errs
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
    }
    Some(policy)
}

fn rollback_action_of(step: &StepDescriptor) -> Option<(String, String, Value)> {
    let action = step.payload.get("rollback_action")?.as_object()?;
    let plugin = action.get("plugin")?.as_str()?.to_string();
    let name = action.get("action")?.as_str()?.to_string();
    let params = action.get("params").cloned().unwrap_or(Value::Null);
    Some((plugin, name, params))
}

/// Breaker identity: `plugin:action` when the payload declares both,
/// otherwise the step id — matching the "typically one per plugin/action
/// pair" default noted on [`CircuitBreaker`].
fn breaker_key(step: &StepDescriptor) -> String {
    let plugin = step.payload.get("plugin").and_then(Value::as_str);
    let action = step.payload.get("action").and_then(Value::as_str);
    match (plugin, action) {
        (Some(p), Some(a)) => format!("{p}:{a}"),
        _ => step.step_id.clone(),
    }
}

fn wrap_as_step_output(step_id: &str, data: Value) -> StepOutput {
    StepOutput {
        step_id: step_id.to_string(),
        plugin: None,
        action: None,
        data,
        metadata: StepOutputMetadata {
            success: true,
            executed_at: Some(chrono::Utc::now()),
            execution_time_ms: Some(0),
            tokens_used: None,
            error: None,
        },
    }
}

/// Composes Controller + State Manager + Parallel Executor + Error Recovery
/// into one runnable engine. One instance is normally shared (`Arc`) across
/// every concurrently running execution in a host process; per-run mutable
/// state (the [`Controller`]) lives in `controllers`, keyed by execution id,
/// so a cooperative `request_pause`/`request_stop` call from another task
/// can reach the run currently inside [`Engine::execute`].
pub struct Engine {
    config: RuntimeConfig,
    step_executor: Arc<dyn StepExecutor>,
    plugin_executor: Arc<dyn PluginExecutor>,
    state_store: Arc<dyn StateStore>,
    output_cache: Arc<dyn ExecutionOutputCache>,
    quota: Arc<dyn QuotaService>,
    metrics: Arc<dyn MetricsCollector>,
    history: Arc<dyn ExecutionHistory>,
    parallel: ParallelExecutor,
    emitter: Option<Arc<dyn EventEmitter>>,
    controllers: parking_lot::Mutex<FxHashMap<String, Arc<parking_lot::Mutex<Controller>>>>,
    circuit_breakers: AsyncMutex<FxHashMap<String, Arc<AsyncMutex<CircuitBreaker>>>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        step_executor: Arc<dyn StepExecutor>,
        plugin_executor: Arc<dyn PluginExecutor>,
        state_store: Arc<dyn StateStore>,
        output_cache: Arc<dyn ExecutionOutputCache>,
        quota: Arc<dyn QuotaService>,
        metrics: Arc<dyn MetricsCollector>,
        history: Arc<dyn ExecutionHistory>,
        extractor: Arc<dyn SchemaFieldExtractor>,
    ) -> Self {
        let parallel = ParallelExecutor::new(step_executor.clone(), extractor, config.max_concurrency);
        Self {
            config,
            step_executor,
            plugin_executor,
            state_store,
            output_cache,
            quota,
            metrics,
            history,
            parallel,
            emitter: None,
            controllers: parking_lot::Mutex::new(FxHashMap::default()),
            circuit_breakers: AsyncMutex::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn with_emitter(mut self, emitter: Arc<dyn EventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    fn publish(&self, event: ProgressEvent) {
        if let Some(emitter) = &self.emitter {
            let _ = emitter.emit(crate::event_bus::progress::into_event(&event));
        }
    }

    /// Cooperative pause (§4.1, §5): takes effect at the next
    /// `should_continue()` check, i.e. before the next step-level dispatch.
    /// Returns `false` if `execution_id` is not currently registered (no run
    /// in flight under this engine instance).
    pub fn request_pause(&self, execution_id: &str) -> bool {
        let controllers = self.controllers.lock();
        match controllers.get(execution_id) {
            Some(controller) => {
                controller.lock().request_pause();
                true
            }
            None => false,
        }
    }

    /// Cooperative stop (§4.1, §5). Not clearable; terminal for the run.
    pub fn request_stop(&self, execution_id: &str) -> bool {
        let controllers = self.controllers.lock();
        match controllers.get(execution_id) {
            Some(controller) => {
                controller.lock().request_stop();
                true
            }
            None => false,
        }
    }

    pub fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        let controllers = self.controllers.lock();
        controllers.get(execution_id).map(|c| c.lock().status())
    }

    fn register(&self, execution_id: &str, controller: Controller) -> Arc<parking_lot::Mutex<Controller>> {
        let handle = Arc::new(parking_lot::Mutex::new(controller));
        self.controllers.lock().insert(execution_id.to_string(), handle.clone());
        handle
    }

    fn unregister(&self, execution_id: &str) {
        self.controllers.lock().remove(execution_id);
    }

    /// §4.2 `createExecution` + run the plan to completion/pause/cancel.
    #[instrument(skip(self, plan, inputs))]
    pub async fn execute(
        &self,
        agent_id: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        plan: ExecutionPlan,
        inputs: Value,
        provided_execution_id: Option<String>,
        run_mode: Option<crate::types::RunMode>,
    ) -> Result<ExecutionOutcome, OrchestraError> {
        let agent_id = agent_id.into();
        let user_id = user_id.into();
        let session_id = session_id.into();

        let execution_id = self
            .state_store
            .create_execution(
                CreateExecutionInput {
                    agent_id: agent_id.clone(),
                    user_id: user_id.clone(),
                    session_id,
                    plan: plan.clone(),
                    inputs: inputs.clone(),
                    provided_execution_id,
                    run_mode,
                },
                self.quota.as_ref(),
            )
            .await?;

        let mut ctx = ExecutionContext::new(execution_id.clone())
            .with_agent_id(agent_id)
            .with_user_id(user_id);
        ctx.variables.extend(inputs.as_object().cloned().unwrap_or_default());

        let controller = self.register(&execution_id, Controller::new(execution_id.clone()));
        let outcome = self.run_plan(&execution_id, &plan, &mut ctx, controller).await;
        self.unregister(&execution_id);
        outcome
    }

    /// §4.2 `resumeExecution` + continue the plan from wherever the durable
    /// record's trace left off.
    #[instrument(skip(self, plan))]
    pub async fn resume(&self, execution_id: &str, plan: &ExecutionPlan) -> Result<ExecutionOutcome, OrchestraError> {
        let resumed = self
            .state_store
            .resume_execution(execution_id, self.output_cache.as_ref())
            .await?;
        let mut ctx = resumed.context;

        let mut controller = Controller::new(execution_id.to_string());
        for step_id in ctx.completed_steps.clone() {
            controller.mark_step_completed(step_id);
        }
        for step_id in ctx.failed_steps.clone() {
            controller.mark_step_failed(step_id, true);
        }
        let controller = self.register(execution_id, controller);

        let outcome = self.run_plan(execution_id, plan, &mut ctx, controller).await;
        self.unregister(execution_id);
        outcome
    }

    /// Roll the run back to `checkpoint_id` (§4.1) and fire compensating
    /// rollback actions (§4.4) for every reverted step, most-recent first.
    pub async fn rollback_to_checkpoint(
        &self,
        execution_id: &str,
        checkpoint_id: &str,
        plan: &ExecutionPlan,
    ) -> RollbackResult {
        let Some(controller) = self.controllers.lock().get(execution_id).cloned() else {
            return RollbackResult {
                success: false,
                rolled_back_to_checkpoint: None,
                steps_reverted: Vec::new(),
                error: Some(format!("no in-flight execution '{execution_id}'")),
            };
        };

        let (result, ctx_snapshot) = {
            let mut guard = controller.lock();
            let result = guard.rollback_to_checkpoint(checkpoint_id);
            let ctx_snapshot = result
                .rolled_back_to_checkpoint
                .as_ref()
                .and_then(|id| guard.checkpoint(id))
                .map(|cp| cp.context.clone());
            (result, ctx_snapshot)
        };

        if result.success {
            if let Some(ctx) = ctx_snapshot {
                let reverted: Vec<(StepDescriptor, Option<(String, String, Value)>)> = result
                    .steps_reverted
                    .iter()
                    .filter_map(|id| plan.step(id))
                    .map(|step| (step.clone(), rollback_action_of(step)))
                    .collect();
                error_recovery::rollback_steps(&reverted, &ctx, self.plugin_executor.as_ref()).await;
            }
        }
        result
    }

    /// Walk `plan` one dependency level at a time, dispatching each step
    /// through Error Recovery (leaf kinds) or the Parallel Executor (`loop`,
    /// `parallel_group`), checkpointing after every successful step, and
    /// honoring cooperative pause/stop between dispatches (§5). Pause/stop
    /// are only consulted at step granularity — a whole `loop`/
    /// `parallel_group` step is one dispatch unit from the outer driver's
    /// point of view, matching "in-flight steps are not cancelled".
    async fn run_plan(
        &self,
        execution_id: &str,
        plan: &ExecutionPlan,
        ctx: &mut ExecutionContext,
        controller: Arc<parking_lot::Mutex<Controller>>,
    ) -> Result<ExecutionOutcome, OrchestraError> {
        let already_done: std::collections::HashSet<String> =
            ctx.completed_steps.iter().chain(ctx.failed_steps.iter()).cloned().collect();

        for level in 0..=plan.max_dependency_level() {
            for step in plan.steps_at_level(level) {
                if already_done.contains(&step.step_id) {
                    continue;
                }

                let should_continue = controller.lock().should_continue();
                if !should_continue {
                    let status = controller.lock().status();
                    return Ok(self.halt(execution_id, ctx, status).await);
                }

                controller.lock().mark_step_started(step.step_id.clone());
                self.publish(ProgressEvent::StepStarted {
                    execution_id: execution_id.to_string(),
                    step_id: step.step_id.clone(),
                });

                match self.dispatch(step, ctx).await {
                    Ok(output) => {
                        ctx.set_step_output(output);
                        controller.lock().mark_step_completed(step.step_id.clone());
                        self.publish(ProgressEvent::StepCompleted {
                            execution_id: execution_id.to_string(),
                            step_id: step.step_id.clone(),
                        });

                        let remaining: Vec<StepDescriptor> = plan
                            .steps
                            .iter()
                            .filter(|s| !ctx.completed_steps.contains(&s.step_id) && !ctx.failed_steps.contains(&s.step_id))
                            .cloned()
                            .collect();
                        let checkpoint_id = {
                            let mut guard = controller.lock();
                            let results: FxHashMap<String, StepOutput> = ctx.step_outputs.clone();
                            guard.create_checkpoint(step.step_id.clone(), results, ctx, remaining).checkpoint_id
                        };
                        self.state_store.checkpoint(execution_id, ctx, self.output_cache.as_ref()).await;
                        self.publish(ProgressEvent::Checkpointed {
                            execution_id: execution_id.to_string(),
                            checkpoint_id,
                        });
                    }
                    Err(error) => {
                        let skip = error_recovery::should_continue_on_error(continue_on_error(step), &error);
                        ctx.mark_step_failed(step.step_id.clone());
                        controller.lock().mark_step_failed(step.step_id.clone(), skip);
                        self.publish(ProgressEvent::StepFailed {
                            execution_id: execution_id.to_string(),
                            step_id: step.step_id.clone(),
                            error: error.message.clone(),
                        });
                        if !skip {
                            self.state_store
                                .fail_execution(execution_id, &error, ctx, self.output_cache.as_ref(), self.history.as_ref())
                                .await;
                            return Ok(ExecutionOutcome {
                                execution_id: execution_id.to_string(),
                                status: ExecutionStatus::Failed,
                                context: ctx.clone(),
                                stop_reason: Some(StopReason::Failed),
                                error: Some(error.message),
                            });
                        }
                    }
                }
            }
        }

        let final_output = Value::Object(
            ctx.step_outputs
                .iter()
                .map(|(id, output)| (id.clone(), output.data.clone()))
                .collect(),
        );
        self.state_store
            .complete_execution(execution_id, final_output, ctx, self.metrics.as_ref(), self.history.as_ref())
            .await;
        controller.lock().mark_completed();
        self.publish(ProgressEvent::Completed {
            execution_id: execution_id.to_string(),
        });

        Ok(ExecutionOutcome {
            execution_id: execution_id.to_string(),
            status: ExecutionStatus::Completed,
            context: ctx.clone(),
            stop_reason: None,
            error: None,
        })
    }

    async fn halt(&self, execution_id: &str, ctx: &ExecutionContext, status: ExecutionStatus) -> ExecutionOutcome {
        match status {
            ExecutionStatus::Paused => {
                self.state_store.pause_execution(execution_id, ctx).await;
                self.publish(ProgressEvent::Paused {
                    execution_id: execution_id.to_string(),
                });
                ExecutionOutcome {
                    execution_id: execution_id.to_string(),
                    status,
                    context: ctx.clone(),
                    stop_reason: Some(StopReason::Paused),
                    error: None,
                }
            }
            _ => {
                // `stop_requested` with no explicit failure: treat as a
                // user-initiated cancellation, the only other terminal status
                // `should_continue()` can observe without a failure already
                // having gone through the `Err` arm above.
                self.state_store.cancel_execution(execution_id, ctx).await;
                self.publish(ProgressEvent::Cancelled {
                    execution_id: execution_id.to_string(),
                });
                ExecutionOutcome {
                    execution_id: execution_id.to_string(),
                    status: ExecutionStatus::Cancelled,
                    context: ctx.clone(),
                    stop_reason: Some(StopReason::Cancelled),
                    error: None,
                }
            }
        }
    }

    /// Route one step to the Parallel Executor (`loop`, `parallel_group`) or
    /// through Error Recovery + a per-plugin/action circuit breaker
    /// (everything else), per §4.2/§4.3/§4.4.
    async fn dispatch(&self, step: &StepDescriptor, ctx: &mut ExecutionContext) -> Result<StepOutput, StepError> {
        match &step.step_kind {
            StepKind::Loop => {
                let results = self
                    .parallel
                    .execute_loop(step, ctx)
                    .await
                    .map_err(|err| StepError::new(err.to_string()))?;
                Ok(wrap_as_step_output(&step.step_id, Value::Array(results)))
            }
            StepKind::ParallelGroup => {
                let gathered = self
                    .parallel
                    .execute_scatter_gather(step, ctx)
                    .await
                    .map_err(|err| StepError::new(err.to_string()))?;
                Ok(wrap_as_step_output(&step.step_id, gathered))
            }
            _ => self.dispatch_leaf(step, ctx).await,
        }
    }

    async fn dispatch_leaf(&self, step: &StepDescriptor, ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
        let policy = step_retry_override(step);
        let merged = RetryPolicy::default().merged_with(policy.as_ref());
        let key = breaker_key(step);

        let breaker = {
            let mut breakers = self.circuit_breakers.lock().await;
            breakers
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(AsyncMutex::new(CircuitBreaker::new(
                        self.config.circuit_breaker_max_failures,
                        self.config.circuit_breaker_reset_timeout,
                    )))
                })
                .clone()
        };

        let mut breaker = breaker.lock().await;
        let outcome = breaker
            .call(|| async {
                error_recovery::execute_with_retry(
                    || self.step_executor.execute(step, ctx),
                    Some(&merged),
                    Some(step.step_id.as_str()),
                )
                .await
            })
            .await;
        drop(breaker);

        match outcome {
            Ok(output) => Ok(output),
            Err(crate::errors::RecoveryError::Upstream(error)) => {
                let fallbacks = fallback_steps_of(step);
                if fallbacks.is_empty() || error_recovery::determine_recovery_strategy(&error) != error_recovery::RecoveryStrategy::Fallback {
                    return Err(error);
                }
                error_recovery::execute_with_fallback(error, &fallbacks, ctx, self.step_executor.as_ref())
                    .await
                    .map_err(|recovery_err| StepError::new(recovery_err.to_string()))
            }
            Err(other) => Err(StepError::new(other.to_string())),
        }
    }

    /// §9 design note: prefer `executeBatched`'s fixed inter-batch delay be
    /// configurable. Exposed here so a host can drive very large groups
    /// outside the per-level plan loop (e.g. a single `parallel_group` step
    /// whose author wants batches rather than one wide fan-out).
    pub fn batch_delay(&self) -> Duration {
        self.config.batch_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::FirstArrayFieldExtractor;
    use crate::state_manager::InMemoryStore;
    use crate::types::StepKind;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StepExecutor for EchoExecutor {
        async fn execute(&self, step: &StepDescriptor, _ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(wrap_as_step_output(&step.step_id, json!({"ran": step.step_id})))
        }
    }

    struct NoopPlugin;
    #[async_trait]
    impl PluginExecutor for NoopPlugin {
        async fn execute(&self, _user_id: &str, _plugin: &str, _action: &str, _params: Value) -> Result<Value, StepError> {
            Ok(Value::Null)
        }
    }

    struct EmptyCache;
    #[async_trait]
    impl ExecutionOutputCache for EmptyCache {
        async fn get_all_outputs(&self, _execution_id: &str) -> Result<FxHashMap<String, StepOutput>, StepError> {
            Ok(FxHashMap::default())
        }
        async fn put_output(&self, _execution_id: &str, _output: &StepOutput) -> Result<(), StepError> {
            Ok(())
        }
    }

    struct AllowAllQuota;
    #[async_trait]
    impl QuotaService for AllowAllQuota {
        async fn check_execution_available(&self, _user_id: &str) -> Result<(), StepError> {
            Ok(())
        }
        async fn record_execution(&self, _user_id: &str) {}
    }

    struct NoopMetrics;
    #[async_trait]
    impl MetricsCollector for NoopMetrics {
        async fn collect_metrics(&self, _execution_id: &str, _agent_id: Option<&str>, _ctx: &ExecutionContext) {}
    }

    struct NoopHistory;
    #[async_trait]
    impl ExecutionHistory for NoopHistory {
        async fn record_completed(&self, _execution_id: &str, _agent_id: Option<&str>, _ctx: &ExecutionContext) {}
        async fn record_failed(
            &self,
            _execution_id: &str,
            _agent_id: Option<&str>,
            _ctx: &ExecutionContext,
            _error: &StepError,
        ) {
        }
    }

    fn build_engine(executor: Arc<EchoExecutor>) -> Engine {
        Engine::new(
            RuntimeConfig::default(),
            executor,
            Arc::new(NoopPlugin),
            Arc::new(InMemoryStore::new()),
            Arc::new(EmptyCache),
            Arc::new(AllowAllQuota),
            Arc::new(NoopMetrics),
            Arc::new(NoopHistory),
            Arc::new(FirstArrayFieldExtractor),
        )
    }

    fn linear_plan() -> ExecutionPlan {
        let a = StepDescriptor::new("a", StepKind::Action);
        let mut b = StepDescriptor::new("b", StepKind::Action);
        b.dependency_level = 1;
        ExecutionPlan::new("plan-1", vec![a, b])
    }

    #[tokio::test]
    async fn executes_a_linear_plan_to_completion() {
        let executor = Arc::new(EchoExecutor { calls: AtomicUsize::new(0) });
        let engine = build_engine(executor.clone());
        let outcome = engine
            .execute("agent-1", "user-1", "session-1", linear_plan(), json!({}), None, None)
            .await
            .expect("execute");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.context.completed_steps.len(), 2);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    struct FailingExecutor;
    #[async_trait]
    impl StepExecutor for FailingExecutor {
        async fn execute(&self, step: &StepDescriptor, _ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
            Err(StepError::new(format!("boom in {}", step.step_id)).with_code("VALIDATION_ERROR"))
        }
    }

    #[tokio::test]
    async fn failing_step_fails_the_whole_run() {
        let engine = build_engine_with(Arc::new(FailingExecutor));
        let outcome = engine
            .execute("agent-1", "user-1", "session-1", linear_plan(), json!({}), None, None)
            .await
            .expect("execute");
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.error.is_some());
    }

    fn build_engine_with(executor: Arc<dyn StepExecutor>) -> Engine {
        Engine::new(
            RuntimeConfig::default(),
            executor,
            Arc::new(NoopPlugin),
            Arc::new(InMemoryStore::new()),
            Arc::new(EmptyCache),
            Arc::new(AllowAllQuota),
            Arc::new(NoopMetrics),
            Arc::new(NoopHistory),
            Arc::new(FirstArrayFieldExtractor),
        )
    }

    #[tokio::test]
    async fn continue_on_error_step_keeps_run_going() {
        struct SometimesFails;
        #[async_trait]
        impl StepExecutor for SometimesFails {
            async fn execute(&self, step: &StepDescriptor, _ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
                if step.step_id == "a" {
                    Err(StepError::new("VALIDATION_WARNING: soft failure"))
                } else {
                    Ok(wrap_as_step_output(&step.step_id, json!(null)))
                }
            }
        }
        let mut a = StepDescriptor::new("a", StepKind::Action);
        a.payload = json!({"continue_on_error": true});
        let mut b = StepDescriptor::new("b", StepKind::Action);
        b.dependency_level = 1;
        let plan = ExecutionPlan::new("plan-2", vec![a, b]);

        let engine = build_engine_with(Arc::new(SometimesFails));
        let outcome = engine
            .execute("agent-1", "user-1", "session-1", plan, json!({}), None, None)
            .await
            .expect("execute");

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.context.failed_steps, vec!["a".to_string()]);
        assert_eq!(outcome.context.completed_steps, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn pause_requested_mid_run_halts_before_next_step() {
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
                Ok(wrap_as_step_output(&step.step_id, json!(null)))
            }
        }

        let engine = Arc::new_cyclic(|weak| {
            build_engine_with(Arc::new(PausingExecutor { engine: weak.clone() }))
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
    async fn resume_continues_from_cached_outputs() {
        struct CountingExecutor {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl StepExecutor for CountingExecutor {
            async fn execute(&self, step: &StepDescriptor, _ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(wrap_as_step_output(&step.step_id, json!(null)))
            }
        }

        #[derive(Default)]
        struct RecordingCache {
            outputs: parking_lot::Mutex<FxHashMap<String, StepOutput>>,
        }
        #[async_trait]
        impl ExecutionOutputCache for RecordingCache {
            async fn get_all_outputs(&self, _execution_id: &str) -> Result<FxHashMap<String, StepOutput>, StepError> {
                Ok(self.outputs.lock().clone())
            }
            async fn put_output(&self, _execution_id: &str, output: &StepOutput) -> Result<(), StepError> {
                self.outputs.lock().insert(output.step_id.clone(), output.clone());
                Ok(())
            }
        }

        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(RecordingCache::default());
        cache
            .outputs
            .lock()
            .insert("a".to_string(), wrap_as_step_output("a", json!(null)));

        let executor = Arc::new(CountingExecutor { calls: AtomicUsize::new(0) });
        let engine = Engine::new(
            RuntimeConfig::default(),
            executor.clone(),
            Arc::new(NoopPlugin),
            store.clone(),
            cache.clone(),
            Arc::new(AllowAllQuota),
            Arc::new(NoopMetrics),
            Arc::new(NoopHistory),
            Arc::new(FirstArrayFieldExtractor),
        );

        let plan = linear_plan();
        let execution_id = store
            .create_execution(
                CreateExecutionInput {
                    agent_id: "agent-1".to_string(),
                    user_id: "user-1".to_string(),
                    session_id: "session-1".to_string(),
                    plan: plan.clone(),
                    inputs: json!({}),
                    provided_execution_id: None,
                    run_mode: None,
                },
                &AllowAllQuota,
            )
            .await
            .unwrap();

        let mut seeded_ctx = ExecutionContext::new(execution_id.clone());
        seeded_ctx.completed_steps.push("a".to_string());
        store.checkpoint(&execution_id, &seeded_ctx, cache.as_ref()).await;
        store.pause_execution(&execution_id, &seeded_ctx).await;

        let outcome = engine.resume(&execution_id, &plan).await.expect("resume");
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        // Only "b" should have been dispatched; "a" was restored from cache.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }
}
