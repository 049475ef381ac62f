//! Execution Controller (§4.1): in-memory coordination of a single run —
//! checkpointing, cooperative pause/stop, rollback. Performs **no I/O**; its
//! only external effect is the [`RollbackResult`] it hands back to its
//! caller. The `Engine` is the single writer; child fan-out never mutates a
//! `Controller` directly.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use rand::Rng;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::context::{ExecutionContext, StepOutput};
use crate::plan::StepDescriptor;
use crate::types::ExecutionStatus;

/// Generate a checkpoint id: `checkpoint_{unix_millis}_{7_char_base36}` (§6).
pub fn generate_checkpoint_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix = base36_random(7);
    format!("checkpoint_{millis}_{suffix}")
}

fn base36_random(len: usize) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| {
            let idx = rng.random_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

/// Metadata attached to a checkpoint at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMetadata {
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub step_count: usize,
    pub error_count: usize,
}

/// Immutable snapshot of run state after a completed step (§3). Every field
/// is a deep, value-semantics copy of the caller's data — no structural
/// sharing with the live [`ExecutionContext`] — so mutating the caller's
/// context after `create_checkpoint` returns never changes the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub completed_step: String,
    pub completed_steps: Vec<String>,
    pub step_results: FxHashMap<String, StepOutput>,
    pub context: ExecutionContext,
    pub remaining_steps: Vec<StepDescriptor>,
    pub metadata: CheckpointMetadata,
}

/// Outcome of a rollback request (§4.1). Never panics or throws; a failed
/// rollback leaves the controller untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackResult {
    pub success: bool,
    pub rolled_back_to_checkpoint: Option<String>,
    pub steps_reverted: Vec<String>,
    pub error: Option<String>,
}

impl RollbackResult {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            rolled_back_to_checkpoint: None,
            steps_reverted: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// In-memory coordination state for one run (§3 "Execution Controller
/// State"). Construct one per execution; it is not meant to outlive a run.
#[derive(Debug, Clone)]
pub struct Controller {
    workflow_id: String,
    status: ExecutionStatus,
    current_step: Option<String>,
    completed_steps: Vec<String>,
    failed_steps: Vec<String>,
    checkpoints: Vec<Checkpoint>,
    checkpoint_index: HashMap<String, usize>,
    pause_requested: bool,
    stop_requested: bool,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl Controller {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Running,
            current_step: None,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            checkpoints: Vec::new(),
            checkpoint_index: HashMap::new(),
            pause_requested: false,
            stop_requested: false,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    pub fn failed_steps(&self) -> &[String] {
        &self.failed_steps
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn checkpoint(&self, id: &str) -> Option<&Checkpoint> {
        self.checkpoint_index.get(id).map(|&idx| &self.checkpoints[idx])
    }

    /// Sets `currentStep`. No other side effects.
    pub fn mark_step_started(&mut self, step_id: impl Into<String>) {
        self.current_step = Some(step_id.into());
    }

    /// Appends to `completedSteps` if absent; clears `currentStep`. Idempotent.
    pub fn mark_step_completed(&mut self, step_id: impl Into<String>) {
        let step_id = step_id.into();
        if !self.completed_steps.contains(&step_id) {
            self.completed_steps.push(step_id);
        }
        self.current_step = None;
    }

    /// Appends to `failedSteps` if absent; clears `currentStep`.
    ///
    /// Per the Open Question in §9 (noted as a probable source bug), this
    /// transitions `status` to `failed` only when `continue_on_error` is
    /// false. When the step is allowed to continue, the id is still recorded
    /// in `failedSteps` for audit purposes but the run keeps `status=running`.
    pub fn mark_step_failed(&mut self, step_id: impl Into<String>, continue_on_error: bool) {
        let step_id = step_id.into();
        if !self.failed_steps.contains(&step_id) {
            self.failed_steps.push(step_id);
        }
        self.current_step = None;
        if !continue_on_error {
            self.status = ExecutionStatus::Failed;
        }
    }

    /// Create a checkpoint after `completed_step`. Deep-clones `step_results`
    /// and `context` — no aliasing with the caller's copies.
    pub fn create_checkpoint(
        &mut self,
        completed_step: impl Into<String>,
        step_results: FxHashMap<String, StepOutput>,
        context: &ExecutionContext,
        remaining_steps: Vec<StepDescriptor>,
    ) -> Checkpoint {
        let completed_step = completed_step.into();
        let mut completed_steps = self.completed_steps.clone();
        if !completed_steps.contains(&completed_step) {
            completed_steps.push(completed_step.clone());
        }

        let checkpoint = Checkpoint {
            checkpoint_id: generate_checkpoint_id(),
            workflow_id: self.workflow_id.clone(),
            timestamp: Utc::now(),
            completed_step,
            completed_steps: completed_steps.clone(),
            step_results,
            context: context.clone(),
            remaining_steps,
            metadata: CheckpointMetadata {
                started_at: self.started_at,
                duration_ms: (Utc::now() - self.started_at).num_milliseconds(),
                step_count: completed_steps.len(),
                error_count: self.failed_steps.len(),
            },
        };

        self.checkpoint_index
            .insert(checkpoint.checkpoint_id.clone(), self.checkpoints.len());
        self.checkpoints.push(checkpoint.clone());
        checkpoint
    }

    pub fn request_pause(&mut self) {
        self.pause_requested = true;
        self.status = ExecutionStatus::Paused;
    }

    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// `¬pauseRequested ∧ ¬stopRequested ∧ status=running`.
    pub fn should_continue(&self) -> bool {
        !self.pause_requested && !self.stop_requested && self.status == ExecutionStatus::Running
    }

    /// Clears `pauseRequested`; `status→running`. Stop is not clearable.
    pub fn resume(&mut self) {
        self.pause_requested = false;
        self.status = ExecutionStatus::Running;
    }

    /// Roll back to the checkpoint with the given id.
    pub fn rollback_to_checkpoint(&mut self, checkpoint_id: &str) -> RollbackResult {
        let Some(&idx) = self.checkpoint_index.get(checkpoint_id) else {
            return RollbackResult::failure(format!("unknown checkpoint '{checkpoint_id}'"));
        };
        let target = self.checkpoints[idx].clone();

        let steps_reverted: Vec<String> = self
            .completed_steps
            .iter()
            .filter(|s| !target.completed_steps.contains(s))
            .cloned()
            .collect();

        self.completed_steps = target.completed_steps.clone();
        self.failed_steps.clear();
        self.status = ExecutionStatus::Running;
        self.current_step = None;

        self.checkpoints.retain(|c| c.timestamp <= target.timestamp);
        self.rebuild_checkpoint_index();

        RollbackResult {
            success: true,
            rolled_back_to_checkpoint: Some(target.checkpoint_id),
            steps_reverted,
            error: None,
        }
    }

    pub fn rollback_to_last_checkpoint(&mut self) -> RollbackResult {
        match self.checkpoints.last() {
            Some(last) => self.rollback_to_checkpoint(&last.checkpoint_id.clone()),
            None => RollbackResult::failure("no checkpoints available"),
        }
    }

    /// Roll back `n` (> 0) steps, i.e. to the checkpoint at index
    /// `max(0, count - n)`.
    pub fn rollback_steps(&mut self, n: usize) -> RollbackResult {
        if n == 0 {
            return RollbackResult::failure("rollback_steps requires n > 0");
        }
        if self.checkpoints.is_empty() {
            return RollbackResult::failure("no checkpoints available");
        }
        let target_idx = self.checkpoints.len().saturating_sub(n);
        let target_id = self.checkpoints[target_idx].checkpoint_id.clone();
        self.rollback_to_checkpoint(&target_id)
    }

    fn rebuild_checkpoint_index(&mut self) {
        self.checkpoint_index = self
            .checkpoints
            .iter()
            .enumerate()
            .map(|(idx, c)| (c.checkpoint_id.clone(), idx))
            .collect();
    }

    pub fn mark_completed(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.ended_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, _error: Option<&str>) {
        self.status = ExecutionStatus::Failed;
        self.ended_at = Some(Utc::now());
    }

    /// Retain only the last `keep_last` checkpoints to bound memory on long
    /// runs. Does not affect `completedSteps`; only the rollback horizon
    /// shrinks.
    pub fn clear_old_checkpoints(&mut self, keep_last: usize) {
        if self.checkpoints.len() > keep_last {
            let drop_count = self.checkpoints.len() - keep_last;
            self.checkpoints.drain(0..drop_count);
            self.rebuild_checkpoint_index();
        }
    }

    /// Serialize `{workflowId, state, checkpoints}` into a JSON blob.
    pub fn export_state(&self) -> ControllerExport {
        ControllerExport {
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            current_step: self.current_step.clone(),
            completed_steps: self.completed_steps.clone(),
            failed_steps: self.failed_steps.clone(),
            checkpoints: self.checkpoints.clone(),
            pause_requested: self.pause_requested,
            stop_requested: self.stop_requested,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    /// Reconstruct a controller equivalent to the one that exported `blob`.
    pub fn import_state(blob: ControllerExport) -> Self {
        let mut controller = Self {
            workflow_id: blob.workflow_id,
            status: blob.status,
            current_step: blob.current_step,
            completed_steps: blob.completed_steps,
            failed_steps: blob.failed_steps,
            checkpoints: blob.checkpoints,
            checkpoint_index: HashMap::new(),
            pause_requested: blob.pause_requested,
            stop_requested: blob.stop_requested,
            started_at: blob.started_at,
            ended_at: blob.ended_at,
        };
        controller.rebuild_checkpoint_index();
        controller
    }
}

/// The wire form of [`Controller::export_state`]/[`Controller::import_state`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerExport {
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub checkpoints: Vec<Checkpoint>,
    pub pause_requested: bool,
    pub stop_requested: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("exec-1")
    }

    #[test]
    fn checkpoint_and_rollback_scenario() {
        // Scenario 1 from §8.
        let mut controller = Controller::new("wf-1");
        controller.mark_step_completed("a");
        let cp1 = controller.create_checkpoint("a", FxHashMap::default(), &ctx(), vec![]);

        controller.mark_step_completed("b");
        let _cp2 = controller.create_checkpoint("b", FxHashMap::default(), &ctx(), vec![]);

        controller.mark_step_completed("c");

        let result = controller.rollback_to_checkpoint(&cp1.checkpoint_id);
        assert!(result.success);
        let mut reverted = result.steps_reverted.clone();
        reverted.sort();
        assert_eq!(reverted, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(controller.completed_steps(), &["a".to_string()]);
        assert_eq!(controller.checkpoints().len(), 1);
        assert_eq!(controller.checkpoints()[0].checkpoint_id, cp1.checkpoint_id);
    }

    #[test]
    fn rollback_to_unknown_checkpoint_fails_without_mutation() {
        let mut controller = Controller::new("wf-1");
        controller.mark_step_completed("a");
        let result = controller.rollback_to_checkpoint("checkpoint_does_not_exist");
        assert!(!result.success);
        assert_eq!(controller.completed_steps(), &["a".to_string()]);
    }

    #[test]
    fn pause_is_cooperative() {
        // Scenario 2 from §8.
        let mut controller = Controller::new("wf-1");
        assert!(controller.should_continue());
        controller.request_pause();
        assert!(!controller.should_continue());
        assert_eq!(controller.status(), ExecutionStatus::Paused);
        controller.resume();
        assert!(controller.should_continue());
    }

    #[test]
    fn stop_is_not_clearable_by_resume() {
        let mut controller = Controller::new("wf-1");
        controller.request_stop();
        assert!(!controller.should_continue());
        controller.resume();
        assert!(!controller.should_continue());
    }

    #[test]
    fn checkpoint_deep_clones_step_results() {
        let mut controller = Controller::new("wf-1");
        let mut results = FxHashMap::default();
        results.insert(
            "a".to_string(),
            StepOutput {
                step_id: "a".to_string(),
                plugin: None,
                action: None,
                data: serde_json::json!({"x": 1}),
                metadata: Default::default(),
            },
        );
        let checkpoint = controller.create_checkpoint("a", results.clone(), &ctx(), vec![]);
        results.get_mut("a").unwrap().data = serde_json::json!({"x": 999});
        assert_eq!(
            checkpoint.step_results.get("a").unwrap().data,
            serde_json::json!({"x": 1})
        );
    }

    #[test]
    fn rollback_steps_targets_count_from_end() {
        let mut controller = Controller::new("wf-1");
        let mut ids = vec![];
        for step in ["a", "b", "c"] {
            controller.mark_step_completed(step);
            let cp = controller.create_checkpoint(step, FxHashMap::default(), &ctx(), vec![]);
            ids.push(cp.checkpoint_id);
        }
        let result = controller.rollback_steps(2);
        assert!(result.success);
        assert_eq!(result.rolled_back_to_checkpoint, Some(ids[0].clone()));
        assert_eq!(controller.completed_steps(), &["a".to_string()]);
    }

    #[test]
    fn export_import_round_trips() {
        let mut controller = Controller::new("wf-1");
        controller.mark_step_completed("a");
        controller.create_checkpoint("a", FxHashMap::default(), &ctx(), vec![]);
        let blob = controller.export_state();
        let restored = Controller::import_state(blob.clone());
        assert_eq!(restored.export_state(), blob);
    }

    #[test]
    fn mark_step_failed_respects_continue_on_error() {
        let mut controller = Controller::new("wf-1");
        controller.mark_step_failed("a", true);
        assert_eq!(controller.status(), ExecutionStatus::Running);
        controller.mark_step_failed("b", false);
        assert_eq!(controller.status(), ExecutionStatus::Failed);
    }

    #[test]
    fn clear_old_checkpoints_bounds_rollback_horizon_only() {
        let mut controller = Controller::new("wf-1");
        for step in ["a", "b", "c", "d"] {
            controller.mark_step_completed(step);
            controller.create_checkpoint(step, FxHashMap::default(), &ctx(), vec![]);
        }
        controller.clear_old_checkpoints(2);
        assert_eq!(controller.checkpoints().len(), 2);
        assert_eq!(controller.completed_steps().len(), 4);
    }

    #[test]
    fn checkpoint_ids_follow_expected_format() {
        let id = generate_checkpoint_id();
        let parts: Vec<&str> = id.splitn(3, '_').collect();
        assert_eq!(parts[0], "checkpoint");
        assert!(parts[1].parse::<u128>().is_ok());
        assert_eq!(parts[2].len(), 7);
    }
}
