//! SQLite-backed [`StateStore`], grounded on the teacher's
//! `SQLiteCheckpointer` (`SqlitePool` + `sqlx::migrate!`, JSON-blob columns
//! for the structured parts, plain columns for anything queried directly).
//!
//! Embedded migrations under `./migrations` run on [`SqliteStore::connect`]
//! when the `sqlite-migrations` feature is enabled (the default); with it
//! disabled, schema setup is assumed to be handled externally.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{instrument, warn};

use crate::collaborators::{ExecutionHistory, ExecutionOutputCache, MetricsCollector, QuotaService, StepError};
use crate::context::{ExecutionContext, StepOutputMetadata};
use crate::errors::StateManagerError;
use crate::plan::ExecutionPlan;
use crate::types::{ExecutionStatus, RunMode, StepStatus};

use super::{
    build_execution_results, sanitize_final_output, CreateExecutionInput, ExecutionRecord,
    ExecutionTrace, ResumeOutcome, StateStore, StepExecutionRecord,
};

const FAIL_POLL_ATTEMPTS: u32 = 10;
const FAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn to_enum_str<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        _ => String::new(),
    }
}

fn from_enum_str<T: DeserializeOwned>(raw: &str) -> Option<T> {
    serde_json::from_value(Value::String(raw.to_string())).ok()
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn from_json<T: DeserializeOwned + Default>(raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_default()
}

/// SQLite-backed durable store. One pool is shared by every run against the
/// same database; callers typically wrap it in an `Arc`.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish()
    }
}

impl SqliteStore {
    /// Connect (or create) a SQLite database at `database_url`, e.g.
    /// `sqlite://orchestra.db` or `sqlite::memory:`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, StateManagerError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| StateManagerError::PersistFailed(format!("connect: {e}")))?;

        #[cfg(feature = "sqlite-migrations")]
        {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| StateManagerError::PersistFailed(format!("migration: {e}")))?;
        }

        Ok(Self { pool })
    }

    async fn load_record(&self, execution_id: &str) -> Option<ExecutionRecord> {
        let row: Option<SqliteRow> = sqlx::query("SELECT * FROM execution_records WHERE execution_id = ?1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .ok()?;
        row.map(|row| row_to_record(&row))
    }

    async fn upsert_record(&self, record: &ExecutionRecord) {
        let result = sqlx::query(
            r#"
            INSERT INTO execution_records (
                execution_id, agent_id, user_id, session_id, status,
                completed_count, failed_count, skipped_count, current_step,
                plan_json, inputs_json, run_mode, trace_json, final_output_json,
                error_message, error_stack, execution_results_json,
                total_tokens_used, total_execution_time_ms,
                started_at, paused_at, resumed_at, completed_at, failed_at, cancelled_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
            ON CONFLICT(execution_id) DO UPDATE SET
                status = excluded.status,
                completed_count = excluded.completed_count,
                failed_count = excluded.failed_count,
                skipped_count = excluded.skipped_count,
                current_step = excluded.current_step,
                trace_json = excluded.trace_json,
                final_output_json = excluded.final_output_json,
                error_message = excluded.error_message,
                error_stack = excluded.error_stack,
                execution_results_json = excluded.execution_results_json,
                total_tokens_used = excluded.total_tokens_used,
                total_execution_time_ms = excluded.total_execution_time_ms,
                paused_at = excluded.paused_at,
                resumed_at = excluded.resumed_at,
                completed_at = excluded.completed_at,
                failed_at = excluded.failed_at,
                cancelled_at = excluded.cancelled_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.execution_id)
        .bind(&record.agent_id)
        .bind(&record.user_id)
        .bind(&record.session_id)
        .bind(to_enum_str(&record.status))
        .bind(record.trace.completed_steps.len() as i64)
        .bind(record.trace.failed_steps.len() as i64)
        .bind(record.trace.skipped_steps.len() as i64)
        .bind(&record.current_step)
        .bind(to_json(&record.plan))
        .bind(to_json(&record.inputs))
        .bind(to_enum_str(&record.run_mode))
        .bind(to_json(&record.trace))
        .bind(record.final_output.as_ref().map(to_json::<Value>))
        .bind(&record.error_message)
        .bind(&record.error_stack)
        .bind(record.execution_results.as_ref().map(to_json::<Value>))
        .bind(record.total_tokens_used as i64)
        .bind(record.total_execution_time_ms as i64)
        .bind(record.started_at.to_rfc3339())
        .bind(record.paused_at.map(|t| t.to_rfc3339()))
        .bind(record.resumed_at.map(|t| t.to_rfc3339()))
        .bind(record.completed_at.map(|t| t.to_rfc3339()))
        .bind(record.failed_at.map(|t| t.to_rfc3339()))
        .bind(record.cancelled_at.map(|t| t.to_rfc3339()))
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(execution_id = %record.execution_id, error = %err, "failed to persist execution record");
        }
    }

    async fn merge_cached_outputs(&self, execution_id: &str, output_cache: &dyn ExecutionOutputCache) {
        let outputs = match output_cache.get_all_outputs(execution_id).await {
            Ok(outputs) => outputs,
            Err(err) => {
                warn!(execution_id, error = %err.message, "failed to read output cache");
                return;
            }
        };
        let Some(mut record) = self.load_record(execution_id).await else {
            return;
        };
        for (step_id, output) in outputs {
            record.trace.cached_outputs.insert(step_id, output);
        }
        self.upsert_record(&record).await;
    }

    fn apply_ctx(&self, record: &mut ExecutionRecord, ctx: &ExecutionContext, now: DateTime<Utc>) {
        record.current_step = ctx.current_step.clone();
        record.trace.completed_steps = ctx.completed_steps.clone();
        record.trace.failed_steps = ctx.failed_steps.clone();
        record.trace.skipped_steps = ctx.skipped_steps.clone();
        record.total_tokens_used = ctx.total_tokens_used;
        record.total_execution_time_ms = ctx.total_execution_time_ms;
        record.updated_at = now;
    }
}

fn row_to_record(row: &SqliteRow) -> ExecutionRecord {
    let status_raw: String = row.get("status");
    let run_mode_raw: String = row.get("run_mode");
    let plan_raw: String = row.get("plan_json");
    let inputs_raw: String = row.get("inputs_json");
    let trace_raw: String = row.get("trace_json");
    let final_output_raw: Option<String> = row.get("final_output_json");
    let execution_results_raw: Option<String> = row.get("execution_results_json");
    let started_at: String = row.get("started_at");
    let updated_at: String = row.get("updated_at");

    let parse_ts = |raw: Option<String>| {
        raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    ExecutionRecord {
        execution_id: row.get("execution_id"),
        agent_id: row.get("agent_id"),
        user_id: row.get("user_id"),
        session_id: row.get("session_id"),
        status: from_enum_str(&status_raw).unwrap_or(ExecutionStatus::Failed),
        current_step: row.get("current_step"),
        plan: from_json::<ExecutionPlan>(&plan_raw),
        inputs: serde_json::from_str(&inputs_raw).unwrap_or(Value::Null),
        run_mode: from_enum_str(&run_mode_raw).unwrap_or(RunMode::Production),
        trace: from_json::<ExecutionTrace>(&trace_raw),
        final_output: final_output_raw.and_then(|s| serde_json::from_str(&s).ok()),
        execution_results: execution_results_raw.and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.get("error_message"),
        error_stack: row.get("error_stack"),
        total_tokens_used: row.get::<i64, _>("total_tokens_used") as u64,
        total_execution_time_ms: row.get::<i64, _>("total_execution_time_ms") as u64,
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        paused_at: parse_ts(row.get("paused_at")),
        resumed_at: parse_ts(row.get("resumed_at")),
        completed_at: parse_ts(row.get("completed_at")),
        failed_at: parse_ts(row.get("failed_at")),
        cancelled_at: parse_ts(row.get("cancelled_at")),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStore {
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
        let record = ExecutionRecord {
            execution_id: execution_id.clone(),
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
        };

        self.upsert_record(&record).await;
        quota.record_execution(&input.user_id).await;

        Ok(execution_id)
    }

    async fn checkpoint(&self, execution_id: &str, ctx: &ExecutionContext, output_cache: &dyn ExecutionOutputCache) {
        self.merge_cached_outputs(execution_id, output_cache).await;
        let Some(mut record) = self.load_record(execution_id).await else {
            warn!(execution_id, "checkpoint: execution not found");
            return;
        };
        self.apply_ctx(&mut record, ctx, Utc::now());
        self.upsert_record(&record).await;
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
        let Some(mut record) = self.load_record(execution_id).await else {
            warn!(execution_id, "complete_execution: execution not found");
            return;
        };
        let now = Utc::now();
        self.apply_ctx(&mut record, ctx, now);
        record.status = ExecutionStatus::Completed;
        record.completed_at = Some(now);
        record.final_output = Some(sanitize_final_output(&final_output));
        record.execution_results = Some(build_execution_results(ctx));
        self.upsert_record(&record).await;
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
                .load_record(execution_id)
                .await
                .map(|r| r.trace.cached_outputs.len())
                .unwrap_or(0);
            if covered >= target {
                break;
            }
            self.merge_cached_outputs(execution_id, output_cache).await;
            let covered = self
                .load_record(execution_id)
                .await
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

        let Some(mut record) = self.load_record(execution_id).await else {
            warn!(execution_id, "fail_execution: execution not found");
            return;
        };
        let now = Utc::now();
        self.apply_ctx(&mut record, ctx, now);
        record.status = ExecutionStatus::Failed;
        record.failed_at = Some(now);
        record.error_message = Some(error.message.clone());
        record.error_stack = error.code.clone();
        self.upsert_record(&record).await;
    }

    async fn pause_execution(&self, execution_id: &str, ctx: &ExecutionContext) {
        let Some(mut record) = self.load_record(execution_id).await else {
            warn!(execution_id, "pause_execution: execution not found");
            return;
        };
        let now = Utc::now();
        self.apply_ctx(&mut record, ctx, now);
        record.status = ExecutionStatus::Paused;
        record.paused_at = Some(now);
        self.upsert_record(&record).await;
    }

    async fn cancel_execution(&self, execution_id: &str, ctx: &ExecutionContext) {
        let Some(mut record) = self.load_record(execution_id).await else {
            warn!(execution_id, "cancel_execution: execution not found");
            return;
        };
        let now = Utc::now();
        self.apply_ctx(&mut record, ctx, now);
        record.status = ExecutionStatus::Cancelled;
        record.cancelled_at = Some(now);
        self.upsert_record(&record).await;
    }

    #[instrument(skip(self, output_cache))]
    async fn resume_execution(
        &self,
        execution_id: &str,
        output_cache: &dyn ExecutionOutputCache,
    ) -> Result<ResumeOutcome, StateManagerError> {
        let record = self
            .load_record(execution_id)
            .await
            .ok_or_else(|| StateManagerError::NotFound {
                execution_id: execution_id.to_string(),
            })?;

        if !matches!(record.status, ExecutionStatus::Paused | ExecutionStatus::Running) {
            return Err(StateManagerError::InvalidStatusForResume {
                execution_id: execution_id.to_string(),
                status: format!("{:?}", record.status).to_lowercase(),
            });
        }

        let mut ctx = ExecutionContext::new(execution_id.to_string())
            .with_agent_id(record.agent_id.clone())
            .with_user_id(record.user_id.clone());
        ctx.started_at = record.started_at;
        ctx.variables.extend(record.inputs.as_object().cloned().unwrap_or_default());

        let fresh_restart = record.trace.completed_steps.is_empty() && record.trace.failed_steps.is_empty();

        if !fresh_restart {
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

        let mut record = record;
        record.status = ExecutionStatus::Running;
        record.resumed_at = Some(Utc::now());
        record.updated_at = Utc::now();
        self.upsert_record(&record).await;

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
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO step_execution_records (
                execution_id, step_id, step_name, step_type, status,
                plugin, action, tokens_used, execution_time_ms, item_count,
                error_message, execution_metadata_json, started_at, completed_at, failed_at
            ) VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6, NULL, NULL, NULL, NULL, ?7, ?8, NULL, NULL)
            ON CONFLICT(execution_id, step_id) DO UPDATE SET
                step_name = excluded.step_name,
                step_type = excluded.step_type,
                status = 'running',
                plugin = excluded.plugin,
                action = excluded.action,
                tokens_used = NULL,
                execution_time_ms = NULL,
                error_message = NULL,
                execution_metadata_json = excluded.execution_metadata_json,
                started_at = excluded.started_at,
                completed_at = NULL,
                failed_at = NULL
            "#,
        )
        .bind(execution_id)
        .bind(step_id)
        .bind(step_name)
        .bind(step_type)
        .bind(plugin)
        .bind(action)
        .bind(to_json(&execution_metadata))
        .bind(now)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(execution_id, step_id, error = %err, "failed to log step execution");
        }
    }

    async fn update_step_execution(
        &self,
        execution_id: &str,
        step_id: &str,
        metadata: &StepOutputMetadata,
        item_count: Option<u64>,
    ) {
        let now = Utc::now().to_rfc3339();
        let (status, completed_at, failed_at) = if metadata.success {
            (to_enum_str(&StepStatus::Completed), Some(now.clone()), None)
        } else {
            (to_enum_str(&StepStatus::Failed), None, Some(now.clone()))
        };

        let result = sqlx::query(
            r#"
            UPDATE step_execution_records SET
                status = ?1, tokens_used = ?2, execution_time_ms = ?3, item_count = ?4,
                error_message = ?5, completed_at = ?6, failed_at = ?7
            WHERE execution_id = ?8 AND step_id = ?9
            "#,
        )
        .bind(status)
        .bind(metadata.tokens_used.map(|v| v as i64))
        .bind(metadata.execution_time_ms.map(|v| v as i64))
        .bind(item_count.map(|v| v as i64))
        .bind(&metadata.error)
        .bind(completed_at)
        .bind(failed_at)
        .bind(execution_id)
        .bind(step_id)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(execution_id, step_id, error = %err, "failed to update step execution");
        }
    }

    async fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.load_record(execution_id).await
    }

    async fn get_step_execution(&self, execution_id: &str, step_id: &str) -> Option<StepExecutionRecord> {
        let row: SqliteRow = sqlx::query("SELECT * FROM step_execution_records WHERE execution_id = ?1 AND step_id = ?2")
            .bind(execution_id)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()?;

        let status_raw: String = row.get("status");
        let execution_metadata_raw: Option<String> = row.get("execution_metadata_json");
        let parse_ts = |raw: Option<String>| {
            raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc))
        };

        Some(StepExecutionRecord {
            execution_id: row.get("execution_id"),
            step_id: row.get("step_id"),
            step_name: row.get("step_name"),
            step_type: row.get("step_type"),
            status: from_enum_str(&status_raw).unwrap_or(StepStatus::Pending),
            plugin: row.get("plugin"),
            action: row.get("action"),
            tokens_used: row.get::<Option<i64>, _>("tokens_used").map(|v| v as u64),
            execution_time_ms: row.get::<Option<i64>, _>("execution_time_ms").map(|v| v as u64),
            item_count: row.get::<Option<i64>, _>("item_count").map(|v| v as u64),
            error_message: row.get("error_message"),
            execution_metadata: execution_metadata_raw
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(Value::Null),
            started_at: parse_ts(row.get("started_at")),
            completed_at: parse_ts(row.get("completed_at")),
            failed_at: parse_ts(row.get("failed_at")),
        })
    }

    async fn cleanup_old_executions(&self, retention_days: i64) -> u64 {
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).to_rfc3339();
        let result = sqlx::query(
            r#"
            DELETE FROM execution_records
            WHERE status IN ('completed', 'cancelled') AND started_at < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await;

        match result {
            Ok(res) => res.rows_affected(),
            Err(err) => {
                warn!(error = %err, "cleanup_old_executions failed");
                0
            }
        }
    }
}
