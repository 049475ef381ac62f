//! The static, author-supplied description of a workflow: an ordered list of
//! steps with their dependency edges and (optional) parallel grouping.
//!
//! `ExecutionPlan` is immutable once constructed — the Engine and Controller
//! only ever read from it. Validation/compilation of a plan (cycle
//! detection, schema inference) is explicitly out of scope; callers are
//! expected to hand in a plan whose dependency graph is already a DAG.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{StepId, StepKind};

/// One step in an [`ExecutionPlan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub step_id: StepId,
    pub display_name: String,
    pub step_kind: StepKind,
    pub dependencies: BTreeSet<StepId>,
    /// Topological depth: 0 for steps with no dependencies, otherwise
    /// `1 + max(dependency_level)` of its dependencies. Steps sharing a
    /// `dependency_level` are candidates for the same fan-out batch.
    pub dependency_level: u32,
    pub parallel_group_id: Option<String>,
    pub payload: Value,
}

impl StepDescriptor {
    pub fn new(step_id: impl Into<String>, step_kind: StepKind) -> Self {
        let step_id = step_id.into();
        Self {
            display_name: step_id.clone(),
            step_id,
            step_kind,
            dependencies: BTreeSet::new(),
            dependency_level: 0,
            parallel_group_id: None,
            payload: Value::Null,
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = StepId>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_parallel_group(mut self, group_id: impl Into<String>) -> Self {
        self.parallel_group_id = Some(group_id.into());
        self
    }
}

/// An ordered plan of steps. Order is author intent (e.g. declaration
/// order); `dependency_level` is the derived scheduling hint the Parallel
/// Executor groups by when fanning out a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id: String,
    pub steps: Vec<StepDescriptor>,
}

impl ExecutionPlan {
    pub fn new(plan_id: impl Into<String>, steps: Vec<StepDescriptor>) -> Self {
        Self {
            plan_id: plan_id.into(),
            steps,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps sharing the given `dependency_level`, in plan order.
    pub fn steps_at_level(&self, level: u32) -> Vec<&StepDescriptor> {
        self.steps
            .iter()
            .filter(|s| s.dependency_level == level)
            .collect()
    }

    pub fn max_dependency_level(&self) -> u32 {
        self.steps.iter().map(|s| s.dependency_level).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_steps_by_dependency_level() {
        let plan = ExecutionPlan::new(
            "p1",
            vec![
                StepDescriptor::new("a", crate::types::StepKind::Action),
                {
                    let mut s = StepDescriptor::new("b", crate::types::StepKind::Action);
                    s.dependency_level = 1;
                    s
                },
            ],
        );
        assert_eq!(plan.steps_at_level(0).len(), 1);
        assert_eq!(plan.steps_at_level(1).len(), 1);
        assert_eq!(plan.max_dependency_level(), 1);
    }
}
