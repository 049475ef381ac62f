//! State Manager (§4.2): durable persistence of execution records and step
//! execution records, plus resume logic. Grounded on the teacher's
//! `runtimes::checkpointer::Checkpointer` trait + `InMemoryCheckpointer`/
//! `SQLiteCheckpointer` split — an async trait with a process-local backend
//! for tests and a durable SQL backend for real deployments, selected at
//! startup via [`crate::config::StateBackend`].
//!
//! Failures here must never halt a run unless they occur at
//! [`StateStore::create_execution`]; every other operation logs and swallows
//! (`tracing::warn!`), matching §7's propagation policy.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collaborators::{ExecutionHistory, ExecutionOutputCache, MetricsCollector, QuotaService, StepError};
use crate::context::{ExecutionContext, StepOutput, StepOutputMetadata};
use crate::errors::StateManagerError;
use crate::plan::ExecutionPlan;
use crate::types::{ExecutionStatus, RunMode, StepStatus};

/// {completedSteps, failedSteps, skippedSteps, cached_outputs} (§3). The sole
/// source of truth for replaying completed-step outputs on resume (I5).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionTrace {
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub cached_outputs: FxHashMap<String, StepOutput>,
}

/// A durable execution record: one row per run (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub session_id: String,
    pub status: ExecutionStatus,
    pub current_step: Option<String>,
    pub plan: ExecutionPlan,
    pub inputs: Value,
    pub run_mode: RunMode,
    pub trace: ExecutionTrace,
    pub final_output: Option<Value>,
    pub execution_results: Option<Value>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub total_tokens_used: u64,
    pub total_execution_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One row per step per run (§3). Upserted by `(executionId, stepId)`; a
/// repeat `log_step_execution` call resets stale failure state (I6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub execution_id: String,
    pub step_id: String,
    pub step_name: String,
    pub step_type: String,
    pub status: StepStatus,
    pub plugin: Option<String>,
    pub action: Option<String>,
    pub tokens_used: Option<u64>,
    pub execution_time_ms: Option<u64>,
    pub item_count: Option<u64>,
    pub error_message: Option<String>,
    pub execution_metadata: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Arguments to [`StateStore::create_execution`].
pub struct CreateExecutionInput {
    pub agent_id: String,
    pub user_id: String,
    pub session_id: String,
    pub plan: ExecutionPlan,
    pub inputs: Value,
    pub provided_execution_id: Option<String>,
    pub run_mode: Option<RunMode>,
}

/// Result of [`StateStore::resume_execution`].
#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    pub context: ExecutionContext,
    pub agent_id: String,
    pub run_mode: RunMode,
}

fn new_record(execution_id: String, input: &CreateExecutionInput, now: DateTime<Utc>) -> ExecutionRecord {
    ExecutionRecord {
        execution_id,
        agent_id: input.agent_id.clone(),
        user_id: input.user_id.clone(),
        session_id: input.session_id.clone(),
        status: ExecutionStatus::Running,
        current_step: None,
        plan: input.plan.clone(),
        inputs: input.inputs.clone(),
        run_mode: input.run_mode.unwrap_or(RunMode::Production),
        trace: ExecutionTrace::default(),
        final_output: None,
        execution_results: None,
        error_message: None,
        error_stack: None,
        total_tokens_used: 0,
        total_execution_time_ms: 0,
        started_at: now,
        paused_at: None,
        resumed_at: None,
        completed_at: None,
        failed_at: None,
        cancelled_at: None,
        updated_at: now,
    }
}

/// Merge `ctx` onto a durable record in place: counts, trace lists, totals,
/// `current_step`, `updated_at`. `cached_outputs` is left to the caller —
/// storage always wins on that one key per §4.2's checkpoint rule.
fn apply_context(record: &mut ExecutionRecord, ctx: &ExecutionContext, now: DateTime<Utc>) {
    record.current_step = ctx.current_step.clone();
    record.trace.completed_steps = ctx.completed_steps.clone();
    record.trace.failed_steps = ctx.failed_steps.clone();
    record.trace.skipped_steps = ctx.skipped_steps.clone();
    record.total_tokens_used = ctx.total_tokens_used;
    record.total_execution_time_ms = ctx.total_execution_time_ms;
    record.updated_at = now;
}

/// Sanitize `final_output` per §6: arrays collapse to
/// `{count, type:"array", sample_keys}`, objects to `{type:"object", keys}`,
/// primitives pass through unchanged. Recursion is exactly one level deep.
/// Customer payload bytes must never enter durable storage through this
/// path — only `cached_outputs` (retention-bounded) carries raw data.
pub fn sanitize_final_output(output: &Value) -> Value {
    match output {
        Value::Object(map) => {
            let mut sanitized = Map::new();
            for (key, value) in map {
                sanitized.insert(key.clone(), sanitize_one_level(value));
            }
            Value::Object(sanitized)
        }
        other => sanitize_one_level(other),
    }
}

fn sanitize_one_level(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let sample_keys: Vec<Value> = items
                .first()
                .and_then(Value::as_object)
                .map(|obj| obj.keys().take(5).map(|k| Value::String(k.clone())).collect())
                .unwrap_or_default();
            serde_json::json!({
                "count": items.len(),
                "type": "array",
                "sample_keys": sample_keys,
            })
        }
        Value::Object(map) => {
            let keys: Vec<Value> = map.keys().take(10).map(|k| Value::String(k.clone())).collect();
            serde_json::json!({ "type": "object", "keys": keys })
        }
        primitive => primitive.clone(),
    }
}

/// Build a structured, payload-free `execution_results` summary: per-step
/// success/failure plus overall counts. Mirrors the "no payload bodies" rule
/// applied to `final_output`.
pub fn build_execution_results(ctx: &ExecutionContext) -> Value {
    serde_json::json!({
        "completed": ctx.completed_steps.len(),
        "failed": ctx.failed_steps.len(),
        "skipped": ctx.skipped_steps.len(),
        "total_tokens_used": ctx.total_tokens_used,
        "total_execution_time_ms": ctx.total_execution_time_ms,
    })
}

/// Durable persistence + resume contract (§4.2). A single implementation is
/// shared by every [`crate::engine::Engine`] run against one backend; methods
/// take `execution_id` rather than `&mut self` bookkeeping so the store can
/// be `Arc`-shared across concurrently running executions.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// §4.2 `createExecution`. The only State Manager operation allowed to
    /// fail the run outright (quota rejection or insert failure).
    async fn create_execution(
        &self,
        input: CreateExecutionInput,
        quota: &dyn QuotaService,
    ) -> Result<String, StateManagerError>;

    /// §4.2 `checkpoint`. Gated by `progress_tracking_enabled`; failures are
    /// logged and swallowed, never propagated.
    async fn checkpoint(&self, execution_id: &str, ctx: &ExecutionContext, output_cache: &dyn ExecutionOutputCache);

    /// §4.2 `completeExecution`. Also writes a best-effort `history` row
    /// (§6 `agent_executions`) keyed by the same `execution_id`.
    async fn complete_execution(
        &self,
        execution_id: &str,
        final_output: Value,
        ctx: &ExecutionContext,
        metrics: &dyn MetricsCollector,
        history: &dyn ExecutionHistory,
    );

    /// §4.2 `failExecution`. Polls `output_cache` up to 10×100ms for
    /// `cached_outputs` to cover every completed step before writing. Also
    /// emits a best-effort failed `history` row (§6 `agent_executions`).
    async fn fail_execution(
        &self,
        execution_id: &str,
        error: &StepError,
        ctx: &ExecutionContext,
        output_cache: &dyn ExecutionOutputCache,
        history: &dyn ExecutionHistory,
    );

    async fn pause_execution(&self, execution_id: &str, ctx: &ExecutionContext);

    async fn cancel_execution(&self, execution_id: &str, ctx: &ExecutionContext);

    /// §4.2 `resumeExecution`. Rejects unless status ∈ {paused, running}.
    async fn resume_execution(
        &self,
        execution_id: &str,
        output_cache: &dyn ExecutionOutputCache,
    ) -> Result<ResumeOutcome, StateManagerError>;

    /// §4.2 step-level log upsert; resets stale failure state on re-attempt.
    async fn log_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
        step_name: &str,
        step_type: &str,
        plugin: Option<&str>,
        action: Option<&str>,
        execution_metadata: Value,
    );

    /// §4.2 step-level completion/failure stamp.
    async fn update_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
        metadata: &StepOutputMetadata,
        item_count: Option<u64>,
    );

    async fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord>;

    async fn get_step_execution(&self, execution_id: &str, step_id: &str) -> Option<StepExecutionRecord>;

    /// §6 retention sweep: deletes `completed`/`cancelled` rows older than
    /// `retention_days`. Returns the number of execution rows removed.
    async fn cleanup_old_executions(&self, retention_days: i64) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitizes_arrays_objects_and_primitives() {
        let output = json!({
            "items": [{"a": 1, "b": 2, "secret": "x"}, {"a": 3}],
            "summary": {"total": 2, "label": "ok"},
            "count": 42,
        });
        let sanitized = sanitize_final_output(&output);
        assert_eq!(sanitized["items"]["type"], "array");
        assert_eq!(sanitized["items"]["count"], 2);
        assert_eq!(
            sanitized["items"]["sample_keys"],
            json!(["a", "b", "secret"])
        );
        assert_eq!(sanitized["summary"]["type"], "object");
        assert_eq!(sanitized["count"], 42);
        assert!(sanitized["items"].get("secret").is_none());
    }

    #[test]
    fn execution_results_summarizes_without_payload() {
        let mut ctx = ExecutionContext::new("exec-1");
        ctx.completed_steps.push("a".to_string());
        ctx.total_tokens_used = 7;
        let results = build_execution_results(&ctx);
        assert_eq!(results["completed"], 1);
        assert_eq!(results["total_tokens_used"], 7);
    }
}
