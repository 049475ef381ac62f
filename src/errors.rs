//! Closed error taxonomy (§7) realized as `thiserror`-derived enums with
//! `miette::Diagnostic` codes, so failures render as rich diagnostics in dev
//! tooling and as structured `{code, message}` pairs in durable
//! `error_message`/`error_stack` fields.

use miette::Diagnostic;
use thiserror::Error;

use crate::collaborators::StepError;

/// Errors raised by the Parallel Executor (§4.3, §7).
#[derive(Debug, Error, Diagnostic, Clone)]
pub enum ParallelError {
    #[error("loop step is missing required 'iterateOver' configuration")]
    #[diagnostic(code(orchestra_core::parallel::missing_iterate_over))]
    MissingIterateOver,

    #[error("'iterateOver' resolved to a non-array value of type {observed_type}")]
    #[diagnostic(code(orchestra_core::parallel::invalid_iterate_over))]
    InvalidIterateOver { observed_type: String },

    #[error("loop step is missing required 'steps' configuration")]
    #[diagnostic(code(orchestra_core::parallel::missing_loop_steps))]
    MissingLoopSteps,

    #[error("scatter/gather step is missing required 'scatter' configuration")]
    #[diagnostic(code(orchestra_core::parallel::missing_scatter_config))]
    MissingScatterConfig,

    #[error("scatter/gather step is missing required 'gather' configuration")]
    #[diagnostic(code(orchestra_core::parallel::missing_gather_config))]
    MissingGatherConfig,

    #[error(
        "scatter input resolved to a non-array, non-object-with-array-field value: {observed}. \
         Hint: reference the array field explicitly, e.g. {{{{step.data.FIELD}}}}"
    )]
    #[diagnostic(code(orchestra_core::parallel::invalid_scatter_input))]
    InvalidScatterInput { observed: String },

    #[error("scatter item {index} failed: {error}")]
    #[diagnostic(code(orchestra_core::parallel::scatter_item_failed))]
    ScatterItemFailed { index: usize, error: String },

    #[error("loop iteration {iteration} failed: {error}")]
    #[diagnostic(code(orchestra_core::parallel::loop_iteration_failed))]
    LoopIterationFailed { iteration: usize, error: String },

    #[error("unknown gather operation '{operation}'")]
    #[diagnostic(code(orchestra_core::parallel::unknown_gather_operation))]
    UnknownGatherOperation { operation: String },

    #[error("parallel execution timed out after {elapsed_ms}ms")]
    #[diagnostic(code(orchestra_core::parallel::execution_timeout))]
    ExecutionTimeout { elapsed_ms: u64 },

    #[error("step failed: {0}")]
    #[diagnostic(code(orchestra_core::parallel::step_failed))]
    StepFailed(#[from] StepError),
}

/// Errors raised by Error Recovery (§4.4, §7).
#[derive(Debug, Error, Diagnostic, Clone)]
pub enum RecoveryError {
    #[error("circuit breaker is open; failing fast")]
    #[diagnostic(code(orchestra_core::recovery::circuit_breaker_open))]
    CircuitBreakerOpen,

    #[error("all fallback steps failed after primary error '{primary}': {}", fallback_summary(fallback_errors))]
    #[diagnostic(code(orchestra_core::recovery::all_fallbacks_failed))]
    AllFallbacksFailed {
        primary: String,
        fallback_errors: Vec<String>,
    },

    #[error("{} step(s) failed: {}", failures.len(), failure_summary(failures))]
    #[diagnostic(code(orchestra_core::recovery::multiple_step_failures))]
    MultipleStepFailures { failures: Vec<(String, String)> },

    #[error(transparent)]
    #[diagnostic(code(orchestra_core::recovery::upstream))]
    Upstream(#[from] StepError),
}

fn fallback_summary(errors: &[String]) -> String {
    errors.join("; ")
}

fn failure_summary(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, msg)| format!("{id}: {msg}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised by the State Manager (§4.2, §7). Per the propagation policy,
/// these are the *only* State Manager failures allowed to escape —
/// checkpoint/step-log failures are logged and swallowed.
#[derive(Debug, Error, Diagnostic, Clone)]
pub enum StateManagerError {
    #[error("user '{user_id}' is over their execution quota")]
    #[diagnostic(code(orchestra_core::state_manager::quota_exceeded))]
    QuotaExceeded { user_id: String },

    #[error("failed to persist execution record: {0}")]
    #[diagnostic(code(orchestra_core::state_manager::persist_failed))]
    PersistFailed(String),

    #[error("execution '{execution_id}' not found")]
    #[diagnostic(code(orchestra_core::state_manager::not_found))]
    NotFound { execution_id: String },

    #[error("execution '{execution_id}' has status '{status}'; resume requires paused or running")]
    #[diagnostic(code(orchestra_core::state_manager::invalid_status_for_resume))]
    InvalidStatusForResume { execution_id: String, status: String },
}

/// Umbrella error for the `Engine` composition root; each subsystem error
/// converts into this via `#[from]` so callers driving the whole plan only
/// need to match one type.
#[derive(Debug, Error, Diagnostic)]
pub enum OrchestraError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Parallel(#[from] ParallelError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Recovery(#[from] RecoveryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    StateManager(#[from] StateManagerError),
}
