//! Workflow-progress events: the domain vocabulary published on the real-time
//! broadcast channel the State Manager opens per execution (§6 of the spec).
//!
//! `ProgressEvent` is a typed, execution-scoped notification. [`into_event`]
//! lowers it onto the generic [`Event`](crate::event_bus::Event) wire format so
//! it can travel through the same [`EventBus`](crate::event_bus::EventBus) as
//! step-log lines and LLM token streams.

use serde::{Deserialize, Serialize};

use crate::event_bus::event::{Event, StepEvent};

/// One state transition worth telling a subscriber about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProgressEvent {
    StepStarted { execution_id: String, step_id: String },
    StepCompleted { execution_id: String, step_id: String },
    StepFailed { execution_id: String, step_id: String, error: String },
    Checkpointed { execution_id: String, checkpoint_id: String },
    Paused { execution_id: String },
    Resumed { execution_id: String },
    Completed { execution_id: String },
    Cancelled { execution_id: String },
    Diagnostic { execution_id: String, message: String },
}

impl ProgressEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ProgressEvent::StepStarted { execution_id, .. }
            | ProgressEvent::StepCompleted { execution_id, .. }
            | ProgressEvent::StepFailed { execution_id, .. }
            | ProgressEvent::Checkpointed { execution_id, .. }
            | ProgressEvent::Paused { execution_id }
            | ProgressEvent::Resumed { execution_id }
            | ProgressEvent::Completed { execution_id }
            | ProgressEvent::Cancelled { execution_id }
            | ProgressEvent::Diagnostic { execution_id, .. } => execution_id,
        }
    }

    fn scope(&self) -> &'static str {
        match self {
            ProgressEvent::StepStarted { .. } => "step_started",
            ProgressEvent::StepCompleted { .. } => "step_completed",
            ProgressEvent::StepFailed { .. } => "step_failed",
            ProgressEvent::Checkpointed { .. } => "checkpointed",
            ProgressEvent::Paused { .. } => "paused",
            ProgressEvent::Resumed { .. } => "resumed",
            ProgressEvent::Completed { .. } => "completed",
            ProgressEvent::Cancelled { .. } => "cancelled",
            ProgressEvent::Diagnostic { .. } => "diagnostic",
        }
    }
}

/// Lower a [`ProgressEvent`] onto the generic event bus wire format.
pub fn into_event(progress: &ProgressEvent) -> Event {
    let message = match progress {
        ProgressEvent::StepStarted { step_id, .. } => format!("step '{step_id}' started"),
        ProgressEvent::StepCompleted { step_id, .. } => format!("step '{step_id}' completed"),
        ProgressEvent::StepFailed { step_id, error, .. } => {
            format!("step '{step_id}' failed: {error}")
        }
        ProgressEvent::Checkpointed { checkpoint_id, .. } => {
            format!("checkpoint '{checkpoint_id}' created")
        }
        ProgressEvent::Paused { .. } => "execution paused".to_string(),
        ProgressEvent::Resumed { .. } => "execution resumed".to_string(),
        ProgressEvent::Completed { .. } => "execution completed".to_string(),
        ProgressEvent::Cancelled { .. } => "execution cancelled".to_string(),
        ProgressEvent::Diagnostic { message, .. } => message.clone(),
    };
    let step_id = match progress {
        ProgressEvent::StepStarted { step_id, .. }
        | ProgressEvent::StepCompleted { step_id, .. }
        | ProgressEvent::StepFailed { step_id, .. } => Some(step_id.clone()),
        _ => None,
    };
    Event::Step(StepEvent::new(step_id, None, progress.scope().to_string(), message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowers_step_failed_with_error_message() {
        let progress = ProgressEvent::StepFailed {
            execution_id: "exec-1".to_string(),
            step_id: "fetch".to_string(),
            error: "TIMEOUT".to_string(),
        };
        let event = into_event(&progress);
        assert_eq!(event.message(), "step 'fetch' failed: TIMEOUT");
        assert_eq!(event.scope_label(), Some("step_failed"));
    }

    #[test]
    fn execution_id_accessor_covers_all_variants() {
        let progress = ProgressEvent::Paused {
            execution_id: "exec-2".to_string(),
        };
        assert_eq!(progress.execution_id(), "exec-2");
    }
}
