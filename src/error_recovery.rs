//! Error Recovery (§4.4): the orthogonal retry/rollback/circuit-break layer
//! wrapping any step invocation. Every operation here is a free function or a
//! small state machine — none of it owns a run; the `Engine` calls through it
//! per step.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tracing::{instrument, warn};

use crate::collaborators::{PluginExecutor, StepError};
use crate::context::ExecutionContext;
use crate::errors::RecoveryError;
use crate::plan::StepDescriptor;

/// Default set of substrings/codes considered transient (§4.4).
pub fn default_retryable_errors() -> Vec<String> {
    [
        "TIMEOUT",
        "RATE_LIMIT",
        "NETWORK_ERROR",
        "ECONNRESET",
        "ECONNREFUSED",
        "ETIMEDOUT",
        "ENOTFOUND",
        "429",
        "503",
        "504",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// {maxRetries, backoffMs, backoffMultiplier, retryableErrors} (§3).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1000,
            backoff_multiplier: 2.0,
            retryable_errors: default_retryable_errors(),
        }
    }
}

impl RetryPolicy {
    /// Merge a partially-specified override on top of this policy. Any
    /// `Some(...)` field in `override_with` wins; unset fields keep `self`'s
    /// value. `retryable_errors`, when provided, replaces wholesale rather
    /// than appending.
    #[must_use]
    pub fn merged_with(&self, override_with: Option<&RetryPolicy>) -> RetryPolicy {
        match override_with {
            Some(o) => o.clone(),
            None => self.clone(),
        }
    }

    /// True iff `error` matches one of `retryable_errors` as a substring of
    /// `message`, or as an exact match of `code`, or of `status` as a string.
    pub fn classify_retryable(&self, error: &StepError) -> bool {
        self.retryable_errors.iter().any(|pattern| {
            error.message.contains(pattern.as_str())
                || error.code.as_deref() == Some(pattern.as_str())
                || error.status.map(|s| s.to_string()) == Some(pattern.clone())
        })
    }
}

/// `floor(base * multiplier^(attempt-1) + jitter)`, `jitter ~ U(-0.2, 0.2) * delay`.
/// `attempt` is 1-based (the first retry is attempt 1).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.backoff_ms as f64 * policy.backoff_multiplier.powi(attempt as i32 - 1);
    let jitter_fraction = rand::rng().random_range(-0.2..0.2);
    let with_jitter = base + base * jitter_fraction;
    Duration::from_millis(with_jitter.max(0.0).floor() as u64)
}

/// Retry `f` under `policy` (or the crate default, merged with a caller
/// override). `step_id` is used only for tracing/diagnostics context.
///
/// At most `max_retries + 1` invocations of `f`. Non-retryable errors and
/// exhausted retries both propagate the final [`StepError`] unchanged.
#[instrument(skip(f, policy), fields(step_id = step_id.unwrap_or("")))]
pub async fn execute_with_retry<F, Fut, T>(
    mut f: F,
    policy: Option<&RetryPolicy>,
    step_id: Option<&str>,
) -> Result<T, StepError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let default = RetryPolicy::default();
    let policy = default.merged_with(policy);
    let mut attempt: u32 = 0;

    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !policy.classify_retryable(&error) {
                    return Err(error);
                }
                attempt += 1;
                if attempt > policy.max_retries {
                    return Err(error);
                }
                let delay = backoff_delay(&policy, attempt);
                warn!(
                    step_id = step_id.unwrap_or(""),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error.message,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Classification outcome for `determine_recovery_strategy` (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    Retry,
    Fallback,
    Rollback,
    Fail,
}

/// Classify `error` by substring of `code`/`message` per §4.4's table.
pub fn determine_recovery_strategy(error: &StepError) -> RecoveryStrategy {
    let haystack = format!(
        "{} {}",
        error.code.as_deref().unwrap_or_default(),
        error.message
    )
    .to_lowercase();

    const TRANSIENT: &[&str] = &["timeout", "rate_limit", "rate limit", "network", "429", "503", "504"];
    const AUTH: &[&str] = &["unauthorized", "forbidden", "auth"];
    const FALLBACK: &[&str] = &["plugin_execution_failed", "plugin-execution-failed", "plugin_not_available", "plugin-not-available"];
    const ROLLBACK: &[&str] = &["validation", "constraint", "integrity"];

    if TRANSIENT.iter().any(|p| haystack.contains(p)) {
        RecoveryStrategy::Retry
    } else if AUTH.iter().any(|p| haystack.contains(p)) {
        RecoveryStrategy::Fail
    } else if FALLBACK.iter().any(|p| haystack.contains(p)) {
        RecoveryStrategy::Fallback
    } else if ROLLBACK.iter().any(|p| haystack.contains(p)) {
        RecoveryStrategy::Rollback
    } else {
        RecoveryStrategy::Retry
    }
}

/// Try `fallback_steps` in declared order after `primary_error`, dispatching
/// each through `executor`. If every fallback also fails, raises a composite
/// [`RecoveryError::AllFallbacksFailed`] bundling all messages.
pub async fn execute_with_fallback(
    primary_error: StepError,
    fallback_steps: &[StepDescriptor],
    ctx: &ExecutionContext,
    executor: &dyn crate::collaborators::StepExecutor,
) -> Result<crate::context::StepOutput, RecoveryError> {
    let mut fallback_errors = Vec::new();
    for step in fallback_steps {
        match executor.execute(step, ctx).await {
            Ok(output) => return Ok(output),
            Err(err) => fallback_errors.push(format!("{}: {}", step.step_id, err.message)),
        }
    }
    Err(RecoveryError::AllFallbacksFailed {
        primary: primary_error.message,
        fallback_errors,
    })
}

/// Invoke a step's `rollbackAction` (resolving templated params against
/// `ctx` first) via `plugin_executor`. Never throws; failures are logged.
pub async fn rollback_step(
    step: &StepDescriptor,
    rollback_action: Option<(&str, &str, &Value)>,
    ctx: &ExecutionContext,
    plugin_executor: &dyn PluginExecutor,
) {
    let Some((plugin, action, params)) = rollback_action else {
        return;
    };
    let resolved = resolve_params(params, ctx);
    let user_id = ctx.user_id.as_deref().unwrap_or_default();
    match plugin_executor.execute(user_id, plugin, action, resolved).await {
        Ok(_) => tracing::info!(step_id = %step.step_id, "rollback action succeeded"),
        Err(err) => tracing::warn!(step_id = %step.step_id, error = %err.message, "rollback action failed"),
    }
}

/// Roll back a list of completed steps in reverse order (most-recently
/// completed first).
pub async fn rollback_steps(
    steps: &[(StepDescriptor, Option<(String, String, Value)>)],
    ctx: &ExecutionContext,
    plugin_executor: &dyn PluginExecutor,
) {
    for (step, rollback_action) in steps.iter().rev() {
        let action_ref = rollback_action
            .as_ref()
            .map(|(p, a, params)| (p.as_str(), a.as_str(), params));
        rollback_step(step, action_ref, ctx, plugin_executor).await;
    }
}

fn resolve_params(params: &Value, ctx: &ExecutionContext) -> Value {
    match params {
        Value::String(s) => Value::String(ctx.resolve_all_variables(s)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_params(v, ctx)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_params(v, ctx)).collect()),
        other => other.clone(),
    }
}

/// True iff `step.continue_on_error` or `error` is one of the warning-level
/// kinds (`VALIDATION_WARNING`, `PARTIAL_SUCCESS`, `DEPRECATED_FEATURE`).
pub fn should_continue_on_error(continue_on_error: bool, error: &StepError) -> bool {
    const WARNING_LEVEL: &[&str] = &["VALIDATION_WARNING", "PARTIAL_SUCCESS", "DEPRECATED_FEATURE"];
    continue_on_error
        || error.code.as_deref().is_some_and(|c| WARNING_LEVEL.contains(&c))
        || WARNING_LEVEL.iter().any(|w| error.message.contains(w))
}

/// Bundle a set of (step_id, error) pairs into one composite error.
pub fn aggregate_errors(entries: Vec<(String, String)>) -> RecoveryError {
    RecoveryError::MultipleStepFailures { failures: entries }
}

/// Circuit breaker states (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// A single circuit breaker instance, typically one per plugin/action pair.
/// Not `Sync` on its own — callers needing shared access wrap it in a mutex,
/// matching the Execution Controller's single-writer discipline.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_time: Option<std::time::Instant>,
    max_failures: u32,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            max_failures,
            reset_timeout,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure_time = Some(std::time::Instant::now());
        if self.consecutive_failures >= self.max_failures {
            self.state = CircuitState::Open;
        }
    }

    /// Invoke `f` through the breaker. In `Open` state with the reset
    /// timeout not yet elapsed, fails fast with
    /// [`RecoveryError::CircuitBreakerOpen`] without calling `f`.
    pub async fn call<F, Fut, T>(&mut self, f: F) -> Result<T, RecoveryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        match self.state {
            CircuitState::Open => {
                let elapsed = self
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.reset_timeout {
                    self.state = CircuitState::HalfOpen;
                } else {
                    return Err(RecoveryError::CircuitBreakerOpen);
                }
            }
            CircuitState::Closed | CircuitState::HalfOpen => {}
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(RecoveryError::Upstream(error))
            }
        }
    }
}
