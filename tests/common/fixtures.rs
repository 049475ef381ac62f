#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};

use orchestra_core::collaborators::{
    ExecutionHistory, ExecutionOutputCache, FirstArrayFieldExtractor, MetricsCollector, PluginExecutor,
    QuotaService, StepError, StepExecutor,
};
use orchestra_core::config::RuntimeConfig;
use orchestra_core::context::{ExecutionContext, StepOutput, StepOutputMetadata};
use orchestra_core::engine::Engine;
use orchestra_core::plan::StepDescriptor;
use orchestra_core::state_manager::InMemoryStore;

/// Echoes every step back as a successful output, tracking how many times
/// it was invoked so tests can assert on dispatch counts.
pub struct EchoExecutor {
    pub calls: AtomicUsize,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl StepExecutor for EchoExecutor {
    async fn execute(&self, step: &StepDescriptor, _ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutput {
            step_id: step.step_id.clone(),
            plugin: None,
            action: None,
            data: json!({"ran": step.step_id}),
            metadata: StepOutputMetadata {
                success: true,
                ..Default::default()
            },
        })
    }
}

/// Fails every step it is asked to run, tagged with a retryable code so
/// Error Recovery tests can exercise the retry/circuit-breaker paths.
pub struct FailingExecutor {
    pub code: &'static str,
}

#[async_trait]
impl StepExecutor for FailingExecutor {
    async fn execute(&self, step: &StepDescriptor, _ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
        Err(StepError::new(format!("boom in {}", step.step_id)).with_code(self.code))
    }
}

pub struct NoopPlugin;

#[async_trait]
impl PluginExecutor for NoopPlugin {
    async fn execute(&self, _user_id: &str, _plugin: &str, _action: &str, _params: Value) -> Result<Value, StepError> {
        Ok(Value::Null)
    }
}

/// Process-local [`ExecutionOutputCache`], keyed by execution then step id.
#[derive(Default)]
pub struct MapOutputCache {
    outputs: Mutex<FxHashMap<String, FxHashMap<String, StepOutput>>>,
}

#[async_trait]
impl ExecutionOutputCache for MapOutputCache {
    async fn get_all_outputs(&self, execution_id: &str) -> Result<FxHashMap<String, StepOutput>, StepError> {
        Ok(self.outputs.lock().unwrap().get(execution_id).cloned().unwrap_or_default())
    }

    async fn put_output(&self, execution_id: &str, output: &StepOutput) -> Result<(), StepError> {
        self.outputs
            .lock()
            .unwrap()
            .entry(execution_id.to_string())
            .or_default()
            .insert(output.step_id.clone(), output.clone());
        Ok(())
    }
}

pub struct AllowAllQuota;

#[async_trait]
impl QuotaService for AllowAllQuota {
    async fn check_execution_available(&self, _user_id: &str) -> Result<(), StepError> {
        Ok(())
    }

    async fn record_execution(&self, _user_id: &str) {}
}

pub struct NoopMetrics;

#[async_trait]
impl MetricsCollector for NoopMetrics {
    async fn collect_metrics(&self, _execution_id: &str, _agent_id: Option<&str>, _ctx: &ExecutionContext) {}
}

pub struct NoopHistory;

#[async_trait]
impl ExecutionHistory for NoopHistory {
    async fn record_completed(&self, _execution_id: &str, _agent_id: Option<&str>, _ctx: &ExecutionContext) {}

    async fn record_failed(
        &self,
        _execution_id: &str,
        _agent_id: Option<&str>,
        _ctx: &ExecutionContext,
        _error: &StepError,
    ) {
    }
}

/// Wires an [`Engine`] against an in-memory state store and the doubles
/// above, the shape every other collaborator-driven test shares.
pub fn build_engine(step_executor: Arc<dyn StepExecutor>) -> Engine {
    Engine::new(
        RuntimeConfig::default(),
        step_executor,
        Arc::new(NoopPlugin),
        Arc::new(InMemoryStore::new()),
        Arc::new(MapOutputCache::default()),
        Arc::new(AllowAllQuota),
        Arc::new(NoopMetrics),
        Arc::new(NoopHistory),
        Arc::new(FirstArrayFieldExtractor),
    )
}
