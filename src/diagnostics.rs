//! Structured error events shared by the four orchestration subsystems.
//!
//! Every fallible operation in this crate eventually bottoms out in an
//! [`ErrorEvent`]: a scoped, taggable, chainable error record that can be
//! rendered for a terminal (via [`pretty_print`]) or serialized verbatim into
//! a durable `execution_record.error_message`/`error_stack` pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::telemetry::{FormatterMode, PlainFormatter, TelemetryFormatter};

/// Represents an error event with scope, error details, tags, and context.
///
/// # JSON Serialization Format
///
/// ```json
/// {
///   "when": "2025-11-02T10:30:00Z",
///   "scope": {
///     "scope": "controller",
///     "step_id": "fetch_invoice"
///   },
///   "error": {
///     "message": "checkpoint rollback target not found",
///     "cause": null,
///     "details": {"checkpoint_id": "checkpoint_172..._ab12cd3"}
///   },
///   "tags": ["rollback"],
///   "context": {}
/// }
/// ```
///
/// The `scope` field uses a tagged union with discriminator `"scope"`.
/// Variants: `"controller"` (step_id), `"state_manager"` (execution_id),
/// `"parallel"` (group_id, index), `"error_recovery"` (step_id, attempt),
/// `"engine"` (no additional fields).
///
/// # Examples
///
/// ```
/// use orchestra_core::diagnostics::{ErrorEvent, LadderError};
///
/// let event = ErrorEvent::controller("fetch_invoice", LadderError::msg("rollback target missing"))
///     .with_tag("rollback");
/// let json_str = serde_json::to_string(&event).unwrap();
/// assert!(json_str.contains("rollback target missing"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ErrorEvent {
    #[serde(default = "chrono::Utc::now")]
    pub when: DateTime<Utc>,
    #[serde(default)]
    pub scope: ErrorScope,
    #[serde(default)]
    pub error: LadderError,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub context: serde_json::Value,
}

impl ErrorEvent {
    /// Create a Controller-scoped error event (checkpoint/rollback failures).
    pub fn controller<S: Into<String>>(step_id: S, error: LadderError) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Controller {
                step_id: step_id.into(),
            },
            error,
            tags: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    /// Create a State Manager-scoped error event (persistence failures).
    pub fn state_manager<S: Into<String>>(execution_id: S, error: LadderError) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::StateManager {
                execution_id: execution_id.into(),
            },
            error,
            tags: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    /// Create a Parallel Executor-scoped error event (scatter/loop item failures).
    pub fn parallel<S: Into<String>>(group_id: S, index: usize, error: LadderError) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Parallel {
                group_id: group_id.into(),
                index,
            },
            error,
            tags: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    /// Create an Error Recovery-scoped error event (retry/circuit-breaker).
    pub fn error_recovery<S: Into<String>>(step_id: S, attempt: u32, error: LadderError) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::ErrorRecovery {
                step_id: step_id.into(),
                attempt,
            },
            error,
            tags: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    /// Create an Engine-scoped error event (the composition root itself).
    pub fn engine(error: LadderError) -> Self {
        Self {
            when: Utc::now(),
            scope: ErrorScope::Engine,
            error,
            tags: Vec::new(),
            context: serde_json::Value::Null,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ErrorScope {
    Controller {
        step_id: String,
    },
    StateManager {
        execution_id: String,
    },
    Parallel {
        group_id: String,
        index: usize,
    },
    ErrorRecovery {
        step_id: String,
        attempt: u32,
    },
    #[default]
    Engine,
}

/// A chainable, structured error: a message, an optional cause, and a JSON
/// details bag. This is the payload carried by [`ErrorEvent`] and is also
/// what gets written into `execution_record.error_stack` on failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LadderError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<LadderError>>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Default for LadderError {
    fn default() -> Self {
        LadderError {
            message: String::new(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }
}

impl std::fmt::Display for LadderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LadderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as &dyn std::error::Error)
    }
}

impl LadderError {
    pub fn msg<M: Into<String>>(m: M) -> Self {
        LadderError {
            message: m.into(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_cause(mut self, cause: LadderError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

/// Format error events with explicit color mode control.
pub fn pretty_print_with_mode(events: &[ErrorEvent], mode: FormatterMode) -> String {
    let formatter = PlainFormatter::with_mode(mode);
    let renders = formatter.render_errors(events);
    let mut out = String::new();
    for (idx, render) in renders.into_iter().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        for line in render.lines {
            out.push_str(&line);
        }
    }
    out
}

/// Format error events as human-readable text with auto-detected color support.
pub fn pretty_print(events: &[ErrorEvent]) -> String {
    pretty_print_with_mode(events, FormatterMode::Auto)
}
