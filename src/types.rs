//! Core enumerations shared across the four orchestration subsystems.
//!
//! These types carry no behavior beyond normalization and are kept free of
//! any subsystem-specific dependency so every module (`controller`,
//! `state_manager`, `parallel`, `error_recovery`) can depend on them without
//! creating a cycle.

use serde::{Deserialize, Serialize};

/// Canonical step kind after normalization.
///
/// Workflow authors may use a looser vocabulary (`ai_processing`, `switch`,
/// `validation`, ...); [`StepKind::normalize`] folds those synonyms onto one
/// of the seven canonical kinds below, matching the teacher's
/// `NodeKind::Custom(String)` escape hatch for forward compatibility with
/// step kinds this crate doesn't yet know about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Action,
    LlmDecision,
    Conditional,
    Loop,
    Transform,
    Delay,
    ParallelGroup,
    /// Any step kind not covered by the normalization table, preserved
    /// verbatim so unrecognized authoring vocabulary round-trips.
    Custom(String),
}

impl StepKind {
    /// Normalize a raw, author-supplied step kind string into a canonical
    /// [`StepKind`] per the synonym table.
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "action" => StepKind::Action,
            "llm_decision" | "summarize" | "extract" | "generate" | "ai_processing" => {
                StepKind::LlmDecision
            }
            "conditional" | "switch" => StepKind::Conditional,
            "loop" => StepKind::Loop,
            "transform" | "validation" | "enrichment" | "comparison" => StepKind::Transform,
            "delay" => StepKind::Delay,
            "parallel_group" | "scatter_gather" => StepKind::ParallelGroup,
            "sub_workflow" | "human_approval" => StepKind::Action,
            other => StepKind::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StepKind::Action => "action",
            StepKind::LlmDecision => "llm_decision",
            StepKind::Conditional => "conditional",
            StepKind::Loop => "loop",
            StepKind::Transform => "transform",
            StepKind::Delay => "delay",
            StepKind::ParallelGroup => "parallel_group",
            StepKind::Custom(s) => s.as_str(),
        }
    }
}

/// Whether an execution is a dry-run calibration pass or a real production run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Calibration,
    #[default]
    Production,
}

/// Lifecycle status of an [`crate::state_manager::ExecutionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

/// Lifecycle status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Identifier type for a step within an [`crate::plan::ExecutionPlan`].
pub type StepId = String;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_synonyms() {
        assert_eq!(StepKind::normalize("ai_processing"), StepKind::LlmDecision);
        assert_eq!(StepKind::normalize("switch"), StepKind::Conditional);
        assert_eq!(StepKind::normalize("validation"), StepKind::Transform);
        assert_eq!(StepKind::normalize("enrichment"), StepKind::Transform);
        assert_eq!(StepKind::normalize("comparison"), StepKind::Transform);
        assert_eq!(StepKind::normalize("sub_workflow"), StepKind::Action);
        assert_eq!(StepKind::normalize("human_approval"), StepKind::Action);
        assert_eq!(StepKind::normalize("scatter_gather"), StepKind::ParallelGroup);
        assert_eq!(StepKind::normalize("summarize"), StepKind::LlmDecision);
        assert_eq!(StepKind::normalize("extract"), StepKind::LlmDecision);
        assert_eq!(StepKind::normalize("generate"), StepKind::LlmDecision);
    }

    #[test]
    fn preserves_unknown_kind() {
        assert_eq!(
            StepKind::normalize("webhook"),
            StepKind::Custom("webhook".to_string())
        );
    }
}
