//! External collaborator traits (§6): the seams the core depends on but does
//! not implement. A host program supplies concrete implementations (a real
//! plugin registry, a schema registry, a quota service backed by a billing
//! system, ...); this crate ships in-memory test doubles for each so the
//! `Engine` is runnable end-to-end without a host.

use async_trait::async_trait;
use serde_json::Value;

use crate::context::{ExecutionContext, StepOutput};
use crate::plan::StepDescriptor;

/// Runs one leaf step via plugin invocation and returns its typed output.
/// This is the single point where workflow-author intent becomes an actual
/// side effect; everything else in this crate only orchestrates calls to it.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        step: &StepDescriptor,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, StepError>;
}

/// A classifiable failure from a collaborator call: the shape Error Recovery
/// pattern-matches against (`message`, `code`, `status`) to decide retry vs.
/// fail-fast vs. fallback vs. rollback.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    pub code: Option<String>,
    pub status: Option<u16>,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Direct plugin invocation, bypassing step-descriptor plumbing. Used by
/// `rollback_step` (rollback actions are plugin calls, not plan steps) and by
/// the default in-memory `StepExecutor` test double.
#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn execute(
        &self,
        user_id: &str,
        plugin: &str,
        action: &str,
        params: Value,
    ) -> Result<Value, StepError>;
}

/// Write-through cache of full step outputs, the sole source of truth for
/// replaying completed steps on resume (§4.2, I5).
#[async_trait]
pub trait ExecutionOutputCache: Send + Sync {
    async fn get_all_outputs(
        &self,
        execution_id: &str,
    ) -> Result<rustc_hash::FxHashMap<String, StepOutput>, StepError>;

    async fn put_output(
        &self,
        execution_id: &str,
        output: &StepOutput,
    ) -> Result<(), StepError>;
}

/// Per-user execution quota, consulted by `create_execution` and never
/// allowed to block a run already in progress.
#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn check_execution_available(&self, user_id: &str) -> Result<(), StepError>;
    async fn record_execution(&self, user_id: &str);
}

/// Best-effort metrics sink. Must never receive customer payload bytes (§6).
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn collect_metrics(&self, execution_id: &str, agent_id: Option<&str>, ctx: &ExecutionContext);
}

/// Best-effort analytics sink for terminal runs: one row per completed or
/// failed execution, written to an external `agent_executions`-style table
/// (§6). Distinct from [`MetricsCollector`] — that trait reports payload-free
/// runtime metrics on every terminal write, while this one records the
/// run's outcome for cross-execution analytics/reporting.
#[async_trait]
pub trait ExecutionHistory: Send + Sync {
    async fn record_completed(&self, execution_id: &str, agent_id: Option<&str>, ctx: &ExecutionContext);

    async fn record_failed(
        &self,
        execution_id: &str,
        agent_id: Option<&str>,
        ctx: &ExecutionContext,
        error: &StepError,
    );
}

/// Picks the first array-typed field out of a step's object-shaped `data`,
/// used by scatter/gather input resolution when `scatter.input` resolves to
/// an object rather than an array (§4.3).
pub trait SchemaFieldExtractor: Send + Sync {
    fn first_array_field<'a>(&self, data: &'a Value, source_plugin: Option<&str>, source_action: Option<&str>) -> Option<&'a Value>;
}

/// Default extractor: ignores plugin/action hints and just finds the first
/// array-valued key in insertion order, matching the "first array-typed
/// field" rule literally.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstArrayFieldExtractor;

impl SchemaFieldExtractor for FirstArrayFieldExtractor {
    fn first_array_field<'a>(&self, data: &'a Value, _source_plugin: Option<&str>, _source_action: Option<&str>) -> Option<&'a Value> {
        data.as_object()?
            .values()
            .find(|v| v.is_array())
    }
}
