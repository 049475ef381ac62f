//! # orchestra-core: checkpointed, resumable workflow orchestration
//!
//! `orchestra-core` runs a static [`plan::ExecutionPlan`] of steps to completion while
//! giving callers three things a plain task-runner doesn't: cooperative pause/stop with
//! deep-cloned checkpoints and rollback, durable resume that replays cached step outputs
//! instead of re-running them, and bounded-concurrency fan-out with retry, circuit
//! breaking, and fallback built in.
//!
//! ## Core Concepts
//!
//! - **Controller**: cooperative pause/stop flags, a checkpoint ring, and rollback
//! - **State Manager**: durable [`state_manager::StateStore`] persistence and resume
//! - **Parallel Executor**: chunked fan-out, loops, scatter/gather, races, timeouts
//! - **Error Recovery**: retry with jittered backoff, circuit breakers, fallback chains
//! - **Engine**: the composition root that wires all four together around a plan
//!
//! ## Quick Start
//!
//! ### Describing a plan
//!
//! ```
//! use orchestra_core::plan::{ExecutionPlan, StepDescriptor};
//! use orchestra_core::types::StepKind;
//!
//! let plan = ExecutionPlan::new(
//!     "invoice-pipeline",
//!     vec![
//!         StepDescriptor::new("fetch", StepKind::Action),
//!         StepDescriptor::new("summarize", StepKind::LlmDecision)
//!             .with_dependencies(["fetch".to_string()]),
//!     ],
//! );
//!
//! assert_eq!(plan.len(), 2);
//! assert!(plan.step("fetch").is_some());
//! ```
//!
//! ### Tracking execution with a Controller
//!
//! ```
//! use orchestra_core::context::ExecutionContext;
//! use orchestra_core::controller::Controller;
//! use rustc_hash::FxHashMap;
//!
//! let mut controller = Controller::new("wf-1");
//! controller.mark_step_started("fetch");
//! controller.mark_step_completed("fetch");
//!
//! let ctx = ExecutionContext::new("exec-1");
//! let checkpoint = controller.create_checkpoint("fetch", FxHashMap::default(), &ctx, Vec::new());
//!
//! assert_eq!(controller.completed_steps(), &["fetch".to_string()]);
//! assert!(controller.checkpoint(&checkpoint.checkpoint_id).is_some());
//! ```
//!
//! ### Retrying a flaky step
//!
//! ```
//! use orchestra_core::collaborators::StepError;
//! use orchestra_core::error_recovery::{execute_with_retry, RetryPolicy};
//!
//! # async fn run() {
//! let mut attempts = 0;
//! let policy = RetryPolicy {
//!     max_retries: 2,
//!     backoff_ms: 1,
//!     ..RetryPolicy::default()
//! };
//!
//! let result = execute_with_retry(
//!     || {
//!         attempts += 1;
//!         async move {
//!             if attempts < 2 {
//!                 Err(StepError::new("TIMEOUT").with_code("TIMEOUT"))
//!             } else {
//!                 Ok(42)
//!             }
//!         }
//!     },
//!     Some(&policy),
//!     Some("flaky-step"),
//! )
//! .await;
//!
//! assert_eq!(result.unwrap(), 42);
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`controller`] - Cooperative pause/stop, checkpoint ring, rollback
//! - [`state_manager`] - Durable execution/step records and resume
//! - [`parallel`] - Bounded-concurrency fan-out, loops, scatter/gather
//! - [`error_recovery`] - Retry policies, circuit breaker, fallback, rollback
//! - [`engine`] - Composition root tying the four subsystems to a plan
//! - [`context`] - Per-execution variable bag and step outputs
//! - [`plan`] - Static, author-supplied step graph
//! - [`types`] - Shared enums (`StepKind`, `ExecutionStatus`, `StepStatus`, `RunMode`)
//! - [`config`] - Runtime defaults and durable backend selection
//! - [`collaborators`] - External seams the core depends on but does not implement
//! - [`event_bus`] - Progress/diagnostic event fan-out and sinks
//! - [`telemetry`] - Human-readable rendering of events and error chains
//! - [`errors`] - Top-level error enums returned across subsystem boundaries
//! - [`diagnostics`] - Structured, scoped error events for telemetry sinks
//! - [`utils`] - JSON helpers shared across subsystems

pub mod collaborators;
pub mod config;
pub mod context;
pub mod controller;
pub mod diagnostics;
pub mod engine;
pub mod error_recovery;
pub mod errors;
pub mod event_bus;
pub mod parallel;
pub mod plan;
pub mod state_manager;
pub mod telemetry;
pub mod types;
pub mod utils;
