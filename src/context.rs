//! Execution context: the mutable, per-execution bag of variables and step
//! outputs threaded through the Parallel Executor and Error Recovery.
//!
//! Cloning an [`ExecutionContext`] is always a deep, value-semantics clone —
//! no `Arc`-shared mutable state — so that a scatter branch or retry attempt
//! can fork, mutate, and either merge back or discard without aliasing the
//! parent's view. This mirrors the "shallow fork with explicit merge-back"
//! principle noted for the cyclic-context problem.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The output recorded for a single completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_id: String,
    pub plugin: Option<String>,
    pub action: Option<String>,
    pub data: Value,
    pub metadata: StepOutputMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepOutputMetadata {
    pub success: bool,
    pub executed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<u64>,
    pub tokens_used: Option<u64>,
    pub error: Option<String>,
}

/// Per-execution mutable state visible to every step dispatch.
///
/// Fields mirror the original data model exactly: a free-form variable bag,
/// a map of step outputs keyed by step id, bookkeeping lists for completed/
/// failed/skipped steps, and running totals for tokens and wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub variables: FxHashMap<String, Value>,
    pub step_outputs: FxHashMap<String, StepOutput>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub total_tokens_used: u64,
    pub total_execution_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub current_step: Option<String>,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            agent_id: None,
            user_id: None,
            variables: FxHashMap::default(),
            step_outputs: FxHashMap::default(),
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            total_tokens_used: 0,
            total_execution_time_ms: 0,
            started_at: Utc::now(),
            current_step: None,
        }
    }

    #[must_use]
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Resolve a single variable by name, falling back to a step output's
    /// `data` field when no top-level variable matches — workflow templates
    /// commonly reference `steps.<id>.output` rather than a named variable.
    pub fn resolve_variable(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.variables.get(name) {
            return Some(value);
        }
        if let Some(step_id) = name.strip_prefix("steps.") {
            let step_id = step_id.strip_suffix(".output").unwrap_or(step_id);
            return self.step_outputs.get(step_id).map(|o| &o.data);
        }
        None
    }

    /// Resolve every `{{name}}`-style placeholder in `template` against
    /// variables and step outputs, leaving unresolved placeholders untouched.
    pub fn resolve_all_variables(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after_open = &rest[start + 2..];
            match after_open.find("}}") {
                Some(end) => {
                    let name = after_open[..end].trim();
                    match self.resolve_variable(name) {
                        Some(Value::String(s)) => out.push_str(s),
                        Some(other) => out.push_str(&other.to_string()),
                        None => {
                            out.push_str("{{");
                            out.push_str(name);
                            out.push_str("}}");
                        }
                    }
                    rest = &after_open[end + 2..];
                }
                None => {
                    out.push_str("{{");
                    rest = after_open;
                }
            }
        }
        out.push_str(rest);
        out
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn set_step_output(&mut self, output: StepOutput) {
        if output.metadata.success {
            self.completed_steps.push(output.step_id.clone());
        }
        if let Some(tokens) = output.metadata.tokens_used {
            self.total_tokens_used += tokens;
        }
        if let Some(ms) = output.metadata.execution_time_ms {
            self.total_execution_time_ms += ms;
        }
        self.step_outputs.insert(output.step_id.clone(), output);
    }

    pub fn mark_step_failed(&mut self, step_id: impl Into<String>) {
        self.failed_steps.push(step_id.into());
    }

    pub fn mark_step_skipped(&mut self, step_id: impl Into<String>) {
        self.skipped_steps.push(step_id.into());
    }

    /// Deep-clone this context. When `reset_metrics` is set, token and
    /// timing counters are zeroed and `started_at` is reset to now — used
    /// when forking a fresh scatter branch that should not inherit the
    /// parent's accumulated totals.
    #[must_use]
    pub fn fork(&self, reset_metrics: bool) -> Self {
        let mut clone = self.clone();
        if reset_metrics {
            clone.total_tokens_used = 0;
            clone.total_execution_time_ms = 0;
            clone.started_at = Utc::now();
        }
        clone
    }
}
