//! Process-local [`StateStore`], grounded on the teacher's
//! `InMemoryCheckpointer` (`RwLock<FxHashMap<...>>`, no serialization).
//! Suitable for tests and calibration runs; durability ends with the process.

use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::collaborators::{ExecutionHistory, ExecutionOutputCache, MetricsCollector, QuotaService, StepError};
use crate::context::{ExecutionContext, StepOutputMetadata};
use crate::errors::StateManagerError;
use crate::types::{ExecutionStatus, StepStatus};

use super::{
    apply_context, build_execution_results, new_record, sanitize_final_output, CreateExecutionInput,
    ExecutionRecord, ResumeOutcome, StateStore, StepExecutionRecord,
};

/// At most 10 polls of 100ms each (§4.2 `failExecution`).
const FAIL_POLL_ATTEMPTS: u32 = 10;
const FAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
pub struct InMemoryStore {
    executions: RwLock<FxHashMap<String, ExecutionRecord>>,
    steps: RwLock<FxHashMap<(String, String), StepExecutionRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `output_cache`'s view of `execution_id`'s outputs into the
    /// stored trace. Storage's `cached_outputs` always wins on conflicting
    /// keys per §4.2 — a separate writer owns that key.
    async fn merge_cached_outputs(&self, execution_id: &str, output_cache: &dyn ExecutionOutputCache) {
        let outputs = match output_cache.get_all_outputs(execution_id).await {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!(execution_id, error = %err.message, "failed to read output cache");
                return;
            }
        };
        let mut executions = self.executions.write();
        if let Some(record) = executions.get_mut(execution_id) {
            for (step_id, output) in outputs {
                record.trace.cached_outputs.insert(step_id, output);
            }
        }
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStore {
    #[instrument(skip(self, input, quota), fields(agent_id = %input.agent_id))]
    async fn create_execution(
        &self,
        input: CreateExecutionInput,
        quota: &dyn QuotaService,
    ) -> Result<String, StateManagerError> {
        quota
            .check_execution_available(&input.user_id)
            .await
            .map_err(|_| StateManagerError::QuotaExceeded {
                user_id: input.user_id.clone(),
            })?;

        let execution_id = input
            .provided_execution_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        let record = new_record(execution_id.clone(), &input, now);

        self.executions.write().insert(execution_id.clone(), record);
        quota.record_execution(&input.user_id).await;

        Ok(execution_id)
    }

    async fn checkpoint(&self, execution_id: &str, ctx: &ExecutionContext, output_cache: &dyn ExecutionOutputCache) {
        self.merge_cached_outputs(execution_id, output_cache).await;
        let mut executions = self.executions.write();
        let Some(record) = executions.get_mut(execution_id) else {
            warn!(execution_id, "checkpoint: execution not found");
            return;
        };
        apply_context(record, ctx, Utc::now());
    }

    async fn complete_execution(
        &self,
        execution_id: &str,
        final_output: Value,
        ctx: &ExecutionContext,
        metrics: &dyn MetricsCollector,
        history: &dyn ExecutionHistory,
    ) {
        metrics.collect_metrics(execution_id, ctx.agent_id.as_deref(), ctx).await;
        history.record_completed(execution_id, ctx.agent_id.as_deref(), ctx).await;
        let now = Utc::now();
        let mut executions = self.executions.write();
        let Some(record) = executions.get_mut(execution_id) else {
            warn!(execution_id, "complete_execution: execution not found");
            return;
        };
        apply_context(record, ctx, now);
        record.status = ExecutionStatus::Completed;
        record.completed_at = Some(now);
        record.final_output = Some(sanitize_final_output(&final_output));
        record.execution_results = Some(build_execution_results(ctx));
    }

    #[instrument(skip(self, error, ctx, output_cache, history))]
    async fn fail_execution(
        &self,
        execution_id: &str,
        error: &StepError,
        ctx: &ExecutionContext,
        output_cache: &dyn ExecutionOutputCache,
        history: &dyn ExecutionHistory,
    ) {
        let target = ctx.completed_steps.len();
        for attempt in 0..FAIL_POLL_ATTEMPTS {
            let covered = self
                .executions
                .read()
                .get(execution_id)
                .map(|r| r.trace.cached_outputs.len())
                .unwrap_or(0);
            if covered >= target {
                break;
            }
            self.merge_cached_outputs(execution_id, output_cache).await;
            let covered = self
                .executions
                .read()
                .get(execution_id)
                .map(|r| r.trace.cached_outputs.len())
                .unwrap_or(0);
            if covered >= target {
                break;
            }
            if attempt + 1 == FAIL_POLL_ATTEMPTS {
                warn!(execution_id, target, covered, "cached_outputs incomplete after fail-path poll budget");
            } else {
                tokio::time::sleep(FAIL_POLL_INTERVAL).await;
            }
        }

        history.record_failed(execution_id, ctx.agent_id.as_deref(), ctx, error).await;

        let now = Utc::now();
        let mut executions = self.executions.write();
        let Some(record) = executions.get_mut(execution_id) else {
            warn!(execution_id, "fail_execution: execution not found");
            return;
        };
        apply_context(record, ctx, now);
        record.status = ExecutionStatus::Failed;
        record.failed_at = Some(now);
        record.error_message = Some(error.message.clone());
        record.error_stack = error.code.clone();
    }

    async fn pause_execution(&self, execution_id: &str, ctx: &ExecutionContext) {
        let now = Utc::now();
        let mut executions = self.executions.write();
        let Some(record) = executions.get_mut(execution_id) else {
            warn!(execution_id, "pause_execution: execution not found");
            return;
        };
        apply_context(record, ctx, now);
        record.status = ExecutionStatus::Paused;
        record.paused_at = Some(now);
    }

    async fn cancel_execution(&self, execution_id: &str, ctx: &ExecutionContext) {
        let now = Utc::now();
        let mut executions = self.executions.write();
        let Some(record) = executions.get_mut(execution_id) else {
            warn!(execution_id, "cancel_execution: execution not found");
            return;
        };
        apply_context(record, ctx, now);
        record.status = ExecutionStatus::Cancelled;
        record.cancelled_at = Some(now);
    }

    #[instrument(skip(self, output_cache))]
    async fn resume_execution(
        &self,
        execution_id: &str,
        output_cache: &dyn ExecutionOutputCache,
    ) -> Result<ResumeOutcome, StateManagerError> {
        let record = self
            .executions
            .read()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| StateManagerError::NotFound {
                execution_id: execution_id.to_string(),
            })?;

        if !matches!(record.status, ExecutionStatus::Paused | ExecutionStatus::Running) {
            return Err(StateManagerError::InvalidStatusForResume {
                execution_id: execution_id.to_string(),
                status: format!("{:?}", record.status).to_lowercase(),
            });
        }

        let mut ctx = ExecutionContext::new(execution_id.to_string()).with_agent_id(record.agent_id.clone());
        if let Some(user_id) = Some(record.user_id.clone()) {
            ctx = ctx.with_user_id(user_id);
        }
        ctx.started_at = record.started_at;
        ctx.variables.extend(record.inputs.as_object().cloned().unwrap_or_default());

        let fresh_restart = record.trace.completed_steps.is_empty() && record.trace.failed_steps.is_empty();

        if fresh_restart {
            // Nothing to restore; counters already zero on a fresh context.
        } else {
            ctx.current_step = record.current_step.clone();
            ctx.completed_steps = record.trace.completed_steps.clone();
            ctx.failed_steps = record.trace.failed_steps.clone();
            ctx.skipped_steps = record.trace.skipped_steps.clone();
            ctx.total_tokens_used = record.total_tokens_used;
            ctx.total_execution_time_ms = record.total_execution_time_ms;

            let outputs = output_cache.get_all_outputs(execution_id).await.unwrap_or_default();
            let mut restored_any = false;
            for step_id in &record.trace.completed_steps {
                if let Some(output) = outputs.get(step_id) {
                    ctx.step_outputs.insert(step_id.clone(), output.clone());
                    restored_any = true;
                }
            }

            if !restored_any && !record.trace.completed_steps.is_empty() {
                warn!(
                    execution_id,
                    completed = record.trace.completed_steps.len(),
                    "cache miss on resume; downgrading to fresh restart"
                );
                ctx.current_step = None;
                ctx.completed_steps.clear();
                ctx.failed_steps.clear();
                ctx.skipped_steps.clear();
                ctx.total_tokens_used = 0;
                ctx.total_execution_time_ms = 0;
                ctx.step_outputs.clear();
            }
        }

        let now = Utc::now();
        let mut executions = self.executions.write();
        if let Some(record) = executions.get_mut(execution_id) {
            record.status = ExecutionStatus::Running;
            record.resumed_at = Some(now);
            record.updated_at = now;
        }

        Ok(ResumeOutcome {
            context: ctx,
            agent_id: record.agent_id,
            run_mode: record.run_mode,
        })
    }

    async fn log_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
        step_name: &str,
        step_type: &str,
        plugin: Option<&str>,
        action: Option<&str>,
        execution_metadata: Value,
    ) {
        let now = Utc::now();
        let key = (execution_id.to_string(), step_id.to_string());
        let mut steps = self.steps.write();
        let entry = steps.entry(key).or_insert_with(|| StepExecutionRecord {
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            step_name: step_name.to_string(),
            step_type: step_type.to_string(),
            status: StepStatus::Pending,
            plugin: plugin.map(str::to_string),
            action: action.map(str::to_string),
            tokens_used: None,
            execution_time_ms: None,
            item_count: None,
            error_message: None,
            execution_metadata: execution_metadata.clone(),
            started_at: None,
            completed_at: None,
            failed_at: None,
        });
        // Re-attempt: reset stale failure state (I6).
        entry.status = StepStatus::Running;
        entry.plugin = plugin.map(str::to_string);
        entry.action = action.map(str::to_string);
        entry.execution_metadata = execution_metadata;
        entry.started_at = Some(now);
        entry.completed_at = None;
        entry.failed_at = None;
        entry.error_message = None;
        entry.tokens_used = None;
        entry.execution_time_ms = None;
    }

    async fn update_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
        metadata: &StepOutputMetadata,
        item_count: Option<u64>,
    ) {
        let now = Utc::now();
        let key = (execution_id.to_string(), step_id.to_string());
        let mut steps = self.steps.write();
        let Some(entry) = steps.get_mut(&key) else {
            warn!(execution_id, step_id, "update_step_execution: no prior log entry");
            return;
        };
        entry.tokens_used = metadata.tokens_used;
        entry.execution_time_ms = metadata.execution_time_ms;
        entry.item_count = item_count;
        if metadata.success {
            entry.status = StepStatus::Completed;
            entry.completed_at = Some(now);
        } else {
            entry.status = StepStatus::Failed;
            entry.failed_at = Some(now);
            entry.error_message = metadata.error.clone();
        }
    }

    async fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.executions.read().get(execution_id).cloned()
    }

    async fn get_step_execution(&self, execution_id: &str, step_id: &str) -> Option<StepExecutionRecord> {
        self.steps
            .read()
            .get(&(execution_id.to_string(), step_id.to_string()))
            .cloned()
    }

    async fn cleanup_old_executions(&self, retention_days: i64) -> u64 {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let mut executions = self.executions.write();
        let before = executions.len();
        executions.retain(|_, record| {
            let terminal = matches!(record.status, ExecutionStatus::Completed | ExecutionStatus::Cancelled);
            !(terminal && record.started_at < cutoff)
        });
        (before - executions.len()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StepError;
    use crate::context::StepOutput;
    use crate::plan::ExecutionPlan;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

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

    #[derive(Default)]
    struct MapOutputCache {
        outputs: Mutex<FxHashMap<String, rustc_hash::FxHashMap<String, crate::context::StepOutput>>>,
    }

    #[async_trait]
    impl ExecutionOutputCache for MapOutputCache {
        async fn get_all_outputs(&self, execution_id: &str) -> Result<rustc_hash::FxHashMap<String, StepOutput>, StepError> {
            Ok(self.outputs.lock().unwrap().get(execution_id).cloned().unwrap_or_default())
        }
        async fn put_output(&self, execution_id: &str, output: &StepOutput) -> Result<(), StepError> {
            self.outputs
                .lock()
                .unwrap()
                .entry(execution_id.to_string())
                .or_default()
                .insert(output.step_id.clone(), output.clone());
            Ok(())
        }
    }

    fn input(plan: ExecutionPlan) -> CreateExecutionInput {
        CreateExecutionInput {
            agent_id: "agent-1".to_string(),
            user_id: "user-1".to_string(),
            session_id: "session-1".to_string(),
            plan,
            inputs: json!({}),
            provided_execution_id: None,
            run_mode: None,
        }
    }

    #[tokio::test]
    async fn create_and_checkpoint_round_trips() {
        let store = InMemoryStore::new();
        let quota = AllowAllQuota;
        let cache = MapOutputCache::default();

        let execution_id = store.create_execution(input(ExecutionPlan::default()), &quota).await.unwrap();

        let mut ctx = ExecutionContext::new(execution_id.clone());
        ctx.completed_steps.push("a".to_string());
        store.checkpoint(&execution_id, &ctx, &cache).await;

        let record = store.get_execution(&execution_id).await.unwrap();
        assert_eq!(record.trace.completed_steps, vec!["a".to_string()]);
        assert_eq!(record.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn resume_with_cache_miss_downgrades_to_fresh_restart() {
        let store = InMemoryStore::new();
        let quota = AllowAllQuota;
        let cache = MapOutputCache::default();

        let execution_id = store.create_execution(input(ExecutionPlan::default()), &quota).await.unwrap();
        let mut ctx = ExecutionContext::new(execution_id.clone());
        ctx.completed_steps = vec!["s1".to_string(), "s2".to_string()];
        ctx.total_tokens_used = 99;
        store.checkpoint(&execution_id, &ctx, &cache).await;

        let outcome = store.resume_execution(&execution_id, &cache).await.unwrap();
        assert!(outcome.context.completed_steps.is_empty());
        assert_eq!(outcome.context.total_tokens_used, 0);
        assert!(outcome.context.current_step.is_none());
    }

    #[tokio::test]
    async fn fail_execution_waits_for_cache_then_writes_failed() {
        let store = InMemoryStore::new();
        let quota = AllowAllQuota;
        let cache = MapOutputCache::default();

        let execution_id = store.create_execution(input(ExecutionPlan::default()), &quota).await.unwrap();
        let mut ctx = ExecutionContext::new(execution_id.clone());
        ctx.completed_steps = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        for step in ["a", "b", "c"] {
            cache
                .put_output(
                    &execution_id,
                    &StepOutput {
                        step_id: step.to_string(),
                        plugin: None,
                        action: None,
                        data: json!({}),
                        metadata: StepOutputMetadata { success: true, ..Default::default() },
                    },
                )
                .await
                .unwrap();
        }

        store
            .fail_execution(&execution_id, &StepError::new("boom"), &ctx, &cache, &NoopHistory)
            .await;
        let record = store.get_execution(&execution_id).await.unwrap();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.trace.cached_outputs.len(), 3);
    }

    #[tokio::test]
    async fn log_step_execution_resets_stale_failure_state() {
        let store = InMemoryStore::new();
        store
            .log_step_execution("exec-1", "a", "Fetch", "action", None, None, json!({}))
            .await;
        store
            .update_step_execution(
                "exec-1",
                "a",
                &StepOutputMetadata { success: false, error: Some("boom".to_string()), ..Default::default() },
                None,
            )
            .await;
        let failed = store.get_step_execution("exec-1", "a").await.unwrap();
        assert!(matches!(failed.status, StepStatus::Failed));

        store
            .log_step_execution("exec-1", "a", "Fetch", "action", None, None, json!({}))
            .await;
        let reset = store.get_step_execution("exec-1", "a").await.unwrap();
        assert!(matches!(reset.status, StepStatus::Running));
        assert!(reset.error_message.is_none());
        assert!(reset.failed_at.is_none());
    }

    #[tokio::test]
    async fn cleanup_old_executions_drops_only_terminal_past_retention() {
        let store = InMemoryStore::new();
        let quota = AllowAllQuota;
        let execution_id = store.create_execution(input(ExecutionPlan::default()), &quota).await.unwrap();
        let cache = MapOutputCache::default();
        let ctx = ExecutionContext::new(execution_id.clone());
        store
            .complete_execution(&execution_id, json!({}), &ctx, &NoopMetrics, &NoopHistory)
            .await;

        {
            let mut executions = store.executions.write();
            let record = executions.get_mut(&execution_id).unwrap();
            record.started_at = Utc::now() - chrono::Duration::days(200);
        }

        let removed = store.cleanup_old_executions(90).await;
        assert_eq!(removed, 1);
        assert!(store.get_execution(&execution_id).await.is_none());
    }
}
