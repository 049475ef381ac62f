//! Parallel Executor (§4.3): fan-out execution shapes — chunked parallel,
//! settle-all, loop, scatter/gather, batched, race, and timeout-bounded —
//! all sharing one `maxConcurrency` limit N and dispatching every leaf step
//! through the same [`StepExecutor`].
//!
//! Grounded on the teacher's scheduler layer (`schedulers::superstep`): chunk
//! a frontier into bounded-width waves and await each wave before advancing.
//! Here the "frontier" is author-declared (`steps[]`) rather than derived
//! from a dependency graph, but the wait-all-per-wave discipline is the same.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{join_all, select_all};
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value};

use crate::collaborators::{SchemaFieldExtractor, StepError, StepExecutor};
use crate::context::{ExecutionContext, StepOutput, StepOutputMetadata};
use crate::errors::ParallelError;
use crate::plan::StepDescriptor;

const RESERVED_LOOP_VARIABLES: [&str; 3] = ["loop", "current", "index"];
const DEFAULT_MAX_ITERATIONS: usize = 100;

/// Fans a plan's independent siblings out across bounded-width waves.
///
/// One instance is typically shared (`Arc`) across an entire `Engine` run;
/// `max_concurrency` is the N from §4.3 (default 3).
pub struct ParallelExecutor {
    step_executor: Arc<dyn StepExecutor>,
    extractor: Arc<dyn SchemaFieldExtractor>,
    max_concurrency: usize,
}

impl ParallelExecutor {
    pub fn new(
        step_executor: Arc<dyn StepExecutor>,
        extractor: Arc<dyn SchemaFieldExtractor>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            step_executor,
            extractor,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Chunked wait-all execution. The first failure in a chunk fails the
    /// whole call once that chunk settles; earlier chunks' outputs are
    /// already folded into the returned map and are simply discarded by the
    /// caller along with the `Err`.
    pub async fn execute_parallel(
        &self,
        steps: &[StepDescriptor],
        ctx: &ExecutionContext,
    ) -> Result<FxHashMap<String, StepOutput>, ParallelError> {
        let mut outputs = FxHashMap::default();
        for chunk in steps.chunks(self.max_concurrency) {
            let futures = chunk.iter().map(|step| self.step_executor.execute(step, ctx));
            let results = join_all(futures).await;
            for (step, result) in chunk.iter().zip(results) {
                outputs.insert(step.step_id.clone(), result.map_err(ParallelError::StepFailed)?);
            }
        }
        Ok(outputs)
    }

    /// Same chunking as [`Self::execute_parallel`], but a failing sibling
    /// never aborts the call — it is converted into a synthetic failed
    /// [`StepOutput`] so the rest of the chunk's results are still usable.
    pub async fn execute_parallel_settled(
        &self,
        steps: &[StepDescriptor],
        ctx: &ExecutionContext,
    ) -> FxHashMap<String, StepOutput> {
        let mut outputs = FxHashMap::default();
        for chunk in steps.chunks(self.max_concurrency) {
            let futures = chunk.iter().map(|step| self.step_executor.execute(step, ctx));
            let results = join_all(futures).await;
            for (step, result) in chunk.iter().zip(results) {
                let output = result.unwrap_or_else(|err| synthetic_failure_output(&step.step_id, &err));
                outputs.insert(step.step_id.clone(), output);
            }
        }
        outputs
    }

    /// Very large groups with an explicit batch size and inter-batch delay,
    /// rather than the shared `max_concurrency`. §9 notes the 100ms delay
    /// used to be hardcoded; it now comes from [`crate::config::RuntimeConfig::batch_delay`].
    pub async fn execute_batched(
        &self,
        steps: &[StepDescriptor],
        ctx: &ExecutionContext,
        batch_size: usize,
        batch_delay: Duration,
    ) -> Result<FxHashMap<String, StepOutput>, ParallelError> {
        let mut outputs = FxHashMap::default();
        let chunks: Vec<&[StepDescriptor]> = steps.chunks(batch_size.max(1)).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let futures = chunk.iter().map(|step| self.step_executor.execute(step, ctx));
            let results = join_all(futures).await;
            for (step, result) in chunk.iter().zip(results) {
                outputs.insert(step.step_id.clone(), result.map_err(ParallelError::StepFailed)?);
            }
            if i + 1 < chunks.len() {
                tokio::time::sleep(batch_delay).await;
            }
        }
        Ok(outputs)
    }

    /// First step to settle, success or failure, wins; the rest keep running
    /// to completion in the background (they are not cancelled — §5).
    pub async fn execute_race(
        &self,
        steps: &[StepDescriptor],
        ctx: &ExecutionContext,
    ) -> Result<StepOutput, ParallelError> {
        let futures: Vec<_> = steps
            .iter()
            .map(|step| Box::pin(self.step_executor.execute(step, ctx)))
            .collect();
        let (result, _index, _rest) = select_all(futures).await;
        result.map_err(ParallelError::StepFailed)
    }

    /// Races [`Self::execute_parallel`] against `timeout`; on deadline the
    /// whole call fails with [`ParallelError::ExecutionTimeout`].
    pub async fn execute_with_timeout(
        &self,
        steps: &[StepDescriptor],
        ctx: &ExecutionContext,
        timeout: Duration,
    ) -> Result<FxHashMap<String, StepOutput>, ParallelError> {
        match tokio::time::timeout(timeout, self.execute_parallel(steps, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(ParallelError::ExecutionTimeout {
                elapsed_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Resolves `iterate_over` out of `loop_step.payload`, applies the
    /// `max_iterations` cap, and runs the nested `steps` once per item —
    /// chunked if `parallel` is set, sequential otherwise. Merges each
    /// iteration's non-reserved variables, token/time totals, and per-step
    /// outputs back into `ctx`.
    pub async fn execute_loop(
        &self,
        loop_step: &StepDescriptor,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<Value>, ParallelError> {
        let payload = loop_step.payload.as_object().cloned().unwrap_or_default();

        let iterate_over_expr = payload
            .get("iterate_over")
            .and_then(Value::as_str)
            .ok_or(ParallelError::MissingIterateOver)?;
        let nested_steps: Vec<StepDescriptor> = payload
            .get("steps")
            .and_then(Value::as_array)
            .ok_or(ParallelError::MissingLoopSteps)?
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();
        let parallel = payload.get("parallel").and_then(Value::as_bool).unwrap_or(false);
        let max_iterations = payload
            .get("max_iterations")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_ITERATIONS);
        let continue_on_error = payload.get("continue_on_error").and_then(Value::as_bool).unwrap_or(false);

        let resolved = ctx
            .resolve_variable(iterate_over_expr)
            .cloned()
            .ok_or_else(|| ParallelError::InvalidIterateOver {
                observed_type: "undefined".to_string(),
            })?;
        let items = match resolved {
            Value::Array(items) => items,
            other => {
                return Err(ParallelError::InvalidIterateOver {
                    observed_type: value_type_name(&other),
                })
            }
        };
        let indexed: Vec<(usize, Value)> = items.into_iter().take(max_iterations).enumerate().collect();

        let chunk_size = if parallel { self.max_concurrency } else { 1 };
        let mut collected: Vec<(usize, Value)> = Vec::with_capacity(indexed.len());

        for chunk in indexed.chunks(chunk_size) {
            let futures = chunk.iter().map(|(index, item)| {
                let child_ctx = ctx.fork(true);
                self.run_loop_iteration(&nested_steps, *index, item.clone(), child_ctx, continue_on_error)
            });
            let results = join_all(futures).await;

            let mut first_err = None;
            for result in results {
                match result {
                    Ok(outcome) => {
                        merge_loop_outcome(ctx, &outcome);
                        collected.push((outcome.index, outcome.value));
                    }
                    Err(err) if first_err.is_none() => first_err = Some(err),
                    Err(_) => {}
                }
            }
            if let Some(err) = first_err {
                return Err(err);
            }
        }

        collected.sort_by_key(|(index, _)| *index);
        Ok(collected.into_iter().map(|(_, value)| value).collect())
    }

    async fn run_loop_iteration(
        &self,
        steps: &[StepDescriptor],
        index: usize,
        item: Value,
        mut child_ctx: ExecutionContext,
        continue_on_error: bool,
    ) -> Result<LoopIterationOutcome, ParallelError> {
        child_ctx.set_variable(
            "loop",
            json!({"item": item, "index": index, "iteration": index + 1}),
        );
        child_ctx.set_variable("current", item);
        child_ctx.set_variable("index", json!(index));

        let mut step_outputs = Vec::new();
        for step in steps {
            match self.step_executor.execute(step, &child_ctx).await {
                Ok(output) => {
                    step_outputs.push((step.step_id.clone(), output.clone()));
                    child_ctx.set_step_output(output);
                }
                Err(err) => {
                    if continue_on_error {
                        return Ok(LoopIterationOutcome {
                            index,
                            value: json!({"error": err.message, "iteration": index}),
                            tokens: child_ctx.total_tokens_used,
                            time_ms: child_ctx.total_execution_time_ms,
                            variables: non_reserved_variables(&child_ctx),
                            step_outputs,
                        });
                    }
                    return Err(ParallelError::LoopIterationFailed {
                        iteration: index,
                        error: err.message,
                    });
                }
            }
        }

        let value = step_outputs.last().map(|(_, o)| o.data.clone()).unwrap_or(Value::Null);
        Ok(LoopIterationOutcome {
            index,
            value,
            tokens: child_ctx.total_tokens_used,
            time_ms: child_ctx.total_execution_time_ms,
            variables: non_reserved_variables(&child_ctx),
            step_outputs,
        })
    }

    /// Resolves `scatter.input`, fans the resulting items out across bounded
    /// chunks (each running `scatter.steps` sequentially in a cloned,
    /// metrics-reset child context), merges each item's result per §4.3's
    /// per-item rule, then applies `gather.operation` to the ordered list.
    pub async fn execute_scatter_gather(
        &self,
        step: &StepDescriptor,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, ParallelError> {
        let payload = step.payload.as_object().ok_or(ParallelError::MissingScatterConfig)?;
        let scatter = payload
            .get("scatter")
            .and_then(Value::as_object)
            .ok_or(ParallelError::MissingScatterConfig)?;
        let gather = payload
            .get("gather")
            .and_then(Value::as_object)
            .ok_or(ParallelError::MissingGatherConfig)?;

        let input_expr = scatter
            .get("input")
            .and_then(Value::as_str)
            .ok_or(ParallelError::MissingScatterConfig)?;
        let nested_steps: Vec<StepDescriptor> = scatter
            .get("steps")
            .and_then(Value::as_array)
            .ok_or(ParallelError::MissingScatterConfig)?
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect();
        let item_variable = scatter
            .get("item_variable")
            .and_then(Value::as_str)
            .unwrap_or("item")
            .to_string();
        let max_concurrency = scatter
            .get("max_concurrency")
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(self.max_concurrency);

        let operation = gather
            .get("operation")
            .and_then(Value::as_str)
            .ok_or(ParallelError::MissingGatherConfig)?
            .to_string();

        let resolved = ctx
            .resolve_variable(input_expr)
            .cloned()
            .ok_or_else(|| ParallelError::InvalidScatterInput {
                observed: "undefined".to_string(),
            })?;
        let items = resolve_scatter_items(&resolved, self.extractor.as_ref())?;

        let indexed: Vec<(usize, Value)> = items.into_iter().enumerate().collect();
        let mut per_item: Vec<(usize, Value)> = Vec::with_capacity(indexed.len());

        for chunk in indexed.chunks(max_concurrency.max(1)) {
            let futures = chunk.iter().map(|(index, item)| {
                let child_ctx = ctx.fork(true);
                self.run_scatter_item(&nested_steps, &item_variable, *index, item.clone(), child_ctx)
            });
            let outcomes = join_all(futures).await;
            for outcome in outcomes {
                ctx.total_tokens_used += outcome.tokens;
                ctx.total_execution_time_ms += outcome.time_ms;
                per_item.push((outcome.index, outcome.value));
            }
        }

        per_item.sort_by_key(|(index, _)| *index);
        let ordered: Vec<Value> = per_item.into_iter().map(|(_, value)| value).collect();
        apply_gather(&operation, ordered)
    }

    async fn run_scatter_item(
        &self,
        steps: &[StepDescriptor],
        item_variable: &str,
        index: usize,
        item: Value,
        mut child_ctx: ExecutionContext,
    ) -> ScatterItemOutcome {
        child_ctx.set_variable(item_variable, item.clone());
        child_ctx.set_variable("index", json!(index));

        let mut step_datas: Vec<(String, Value)> = Vec::new();
        for step in steps {
            match self.step_executor.execute(step, &child_ctx).await {
                Ok(output) => {
                    if let Some(alias) = step.payload.get("output_variable").and_then(Value::as_str) {
                        child_ctx.set_variable(alias, output.data.clone());
                    }
                    step_datas.push((step.step_id.clone(), output.data.clone()));
                    child_ctx.set_step_output(output);
                }
                Err(err) => {
                    return ScatterItemOutcome {
                        index,
                        value: json!({"error": err.message, "item": index}),
                        tokens: child_ctx.total_tokens_used,
                        time_ms: child_ctx.total_execution_time_ms,
                    };
                }
            }
        }

        ScatterItemOutcome {
            index,
            value: merge_item_result(&item, &step_datas),
            tokens: child_ctx.total_tokens_used,
            time_ms: child_ctx.total_execution_time_ms,
        }
    }
}

struct LoopIterationOutcome {
    index: usize,
    value: Value,
    tokens: u64,
    time_ms: u64,
    variables: FxHashMap<String, Value>,
    step_outputs: Vec<(String, StepOutput)>,
}

struct ScatterItemOutcome {
    index: usize,
    value: Value,
    tokens: u64,
    time_ms: u64,
}

fn merge_loop_outcome(ctx: &mut ExecutionContext, outcome: &LoopIterationOutcome) {
    for (key, value) in &outcome.variables {
        ctx.variables.insert(key.clone(), value.clone());
    }
    ctx.total_tokens_used += outcome.tokens;
    ctx.total_execution_time_ms += outcome.time_ms;
    for (step_id, output) in &outcome.step_outputs {
        ctx.step_outputs
            .insert(format!("{step_id}_iteration{}", outcome.index), output.clone());
        ctx.step_outputs.insert(step_id.clone(), output.clone());
    }
}

fn non_reserved_variables(ctx: &ExecutionContext) -> FxHashMap<String, Value> {
    ctx.variables
        .iter()
        .filter(|(key, _)| !RESERVED_LOOP_VARIABLES.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn synthetic_failure_output(step_id: &str, error: &StepError) -> StepOutput {
    StepOutput {
        step_id: step_id.to_string(),
        plugin: None,
        action: None,
        data: Value::Null,
        metadata: StepOutputMetadata {
            success: false,
            executed_at: Some(Utc::now()),
            execution_time_ms: Some(0),
            tokens_used: None,
            error: Some(error.message.clone()),
        },
    }
}

fn value_type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
    .to_string()
}

/// Unwraps `scatter.input` per §4.3: a raw array is used directly; a
/// StepOutput-shaped object (i.e. one with a `data` field) unwraps `data` if
/// it's an array, or defers to the schema extractor if `data` is an object.
/// Anything else fails with a hint pointing at `{{step.data.FIELD}}`.
fn resolve_scatter_items(value: &Value, extractor: &dyn SchemaFieldExtractor) -> Result<Vec<Value>, ParallelError> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Object(map) if map.contains_key("data") => match &map["data"] {
            Value::Array(items) => Ok(items.clone()),
            Value::Object(_) => {
                let data = &map["data"];
                let source_plugin = data.get("_sourcePlugin").and_then(Value::as_str);
                let source_action = data.get("_sourceAction").and_then(Value::as_str);
                extractor
                    .first_array_field(data, source_plugin, source_action)
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| ParallelError::InvalidScatterInput {
                        observed: describe_observed(data),
                    })
            }
            other => Err(ParallelError::InvalidScatterInput {
                observed: describe_observed(other),
            }),
        },
        other => Err(ParallelError::InvalidScatterInput {
            observed: describe_observed(other),
        }),
    }
}

fn describe_observed(value: &Value) -> String {
    value_type_name(value)
}

/// Per-item result merge (§4.3): one object-shaped step response spreads
/// onto the item (step wins on key conflicts); multiple steps fold in order
/// onto the item; anything else falls back to the raw `{stepId: data}` map.
fn merge_item_result(item: &Value, step_outputs: &[(String, Value)]) -> Value {
    match step_outputs.len() {
        0 => item.clone(),
        1 => {
            let (_, data) = &step_outputs[0];
            match (item, data) {
                (Value::Object(item_obj), Value::Object(data_obj)) => {
                    let mut merged = item_obj.clone();
                    for (key, value) in data_obj {
                        merged.insert(key.clone(), value.clone());
                    }
                    Value::Object(merged)
                }
                _ => Value::Object(step_outputs.iter().cloned().collect::<Map<String, Value>>()),
            }
        }
        _ => {
            let mut merged = item.as_object().cloned().unwrap_or_default();
            for (_, data) in step_outputs {
                if let Value::Object(data_obj) = data {
                    for (key, value) in data_obj {
                        merged.insert(key.clone(), value.clone());
                    }
                }
            }
            Value::Object(merged)
        }
    }
}

fn apply_gather(operation: &str, items: Vec<Value>) -> Result<Value, ParallelError> {
    match operation {
        "collect" => Ok(Value::Array(items)),
        "merge" => {
            let mut merged = Map::new();
            for item in items {
                if let Value::Object(obj) = item {
                    merged.extend(obj);
                }
            }
            Ok(Value::Object(merged))
        }
        "reduce" => Ok(reduce_values(items)),
        "flatten" => {
            let mut flat = Vec::new();
            flatten_into(&Value::Array(items), &mut flat);
            Ok(Value::Array(flat))
        }
        other => Err(ParallelError::UnknownGatherOperation {
            operation: other.to_string(),
        }),
    }
}

fn reduce_values(items: Vec<Value>) -> Value {
    if items.is_empty() {
        return Value::Null;
    }
    if items.iter().all(Value::is_number) {
        let sum: f64 = items.iter().filter_map(Value::as_f64).sum();
        return json!(sum);
    }
    if items.iter().all(Value::is_array) {
        let mut concatenated = Vec::new();
        for item in items {
            if let Value::Array(arr) = item {
                concatenated.extend(arr);
            }
        }
        return Value::Array(concatenated);
    }
    if items.iter().all(Value::is_object) {
        let mut merged = Map::new();
        for item in items {
            if let Value::Object(obj) = item {
                merged.extend(obj);
            }
        }
        return Value::Object(merged);
    }
    items.into_iter().next_back().unwrap_or(Value::Null)
}

fn flatten_into(value: &Value, out: &mut Vec<Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        other => out.push(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::FirstArrayFieldExtractor;
    use crate::types::StepKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoExecutor {
        fail_steps: Vec<String>,
        calls: AtomicUsize,
    }

    impl EchoExecutor {
        fn new(fail_steps: &[&str]) -> Self {
            Self {
                fail_steps: fail_steps.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StepExecutor for EchoExecutor {
        async fn execute(&self, step: &StepDescriptor, ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_steps.contains(&step.step_id) {
                return Err(StepError::new(format!("{} failed", step.step_id)));
            }
            let data = if step.payload.is_null() {
                ctx.resolve_variable("item").cloned().unwrap_or(Value::Null)
            } else {
                step.payload.clone()
            };
            Ok(StepOutput {
                step_id: step.step_id.clone(),
                plugin: None,
                action: None,
                data,
                metadata: StepOutputMetadata {
                    success: true,
                    executed_at: Some(Utc::now()),
                    execution_time_ms: Some(5),
                    tokens_used: Some(1),
                    error: None,
                },
            })
        }
    }

    fn executor(fail_steps: &[&str]) -> ParallelExecutor {
        ParallelExecutor::new(
            Arc::new(EchoExecutor::new(fail_steps)),
            Arc::new(FirstArrayFieldExtractor),
            2,
        )
    }

    fn step(id: &str, payload: Value) -> StepDescriptor {
        StepDescriptor::new(id, StepKind::Action).with_payload(payload)
    }

    #[tokio::test]
    async fn execute_parallel_collects_all_outputs_in_bounded_chunks() {
        let exec = executor(&[]);
        let ctx = ExecutionContext::new("exec-1");
        let steps = vec![
            step("a", json!(1)),
            step("b", json!(2)),
            step("c", json!(3)),
        ];
        let outputs = exec.execute_parallel(&steps, &ctx).await.unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs["b"].data, json!(2));
    }

    #[tokio::test]
    async fn execute_parallel_propagates_failure() {
        let exec = executor(&["b"]);
        let ctx = ExecutionContext::new("exec-1");
        let steps = vec![step("a", json!(1)), step("b", json!(2))];
        let result = exec.execute_parallel(&steps, &ctx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn execute_parallel_settled_converts_failures_to_synthetic_outputs() {
        let exec = executor(&["b"]);
        let ctx = ExecutionContext::new("exec-1");
        let steps = vec![step("a", json!(1)), step("b", json!(2))];
        let outputs = exec.execute_parallel_settled(&steps, &ctx).await;
        assert!(outputs["a"].metadata.success);
        assert!(!outputs["b"].metadata.success);
        assert_eq!(outputs["b"].metadata.error.as_deref(), Some("b failed"));
    }

    #[tokio::test]
    async fn execute_loop_binds_reserved_variables_and_sums_metrics() {
        let exec = executor(&[]);
        let mut ctx = ExecutionContext::new("exec-1");
        ctx.set_variable("items", json!(["x", "y", "z"]));

        let loop_step = step(
            "loop1",
            json!({
                "iterate_over": "items",
                "steps": [{"step_id": "echo", "display_name": "echo", "step_kind": "action", "dependencies": [], "dependency_level": 0, "parallel_group_id": null, "payload": null}],
                "parallel": false,
            }),
        );

        let results = exec.execute_loop(&loop_step, &mut ctx).await.unwrap();
        assert_eq!(results, vec![json!("x"), json!("y"), json!("z")]);
        assert_eq!(ctx.total_tokens_used, 3);
        assert!(ctx.step_outputs.contains_key("echo_iteration0"));
        assert!(ctx.step_outputs.contains_key("echo"));
    }

    #[tokio::test]
    async fn execute_loop_respects_max_iterations_cap() {
        let exec = executor(&[]);
        let mut ctx = ExecutionContext::new("exec-1");
        ctx.set_variable("items", json!([1, 2, 3, 4, 5]));
        let loop_step = step(
            "loop1",
            json!({
                "iterate_over": "items",
                "steps": [],
                "max_iterations": 2,
            }),
        );
        let results = exec.execute_loop(&loop_step, &mut ctx).await.unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn execute_loop_rejects_non_array_iterate_over() {
        let exec = executor(&[]);
        let mut ctx = ExecutionContext::new("exec-1");
        ctx.set_variable("items", json!("not-an-array"));
        let loop_step = step("loop1", json!({"iterate_over": "items", "steps": []}));
        let result = exec.execute_loop(&loop_step, &mut ctx).await;
        assert!(matches!(result, Err(ParallelError::InvalidIterateOver { .. })));
    }

    #[tokio::test]
    async fn execute_scatter_gather_merges_single_step_onto_item() {
        let exec = executor(&[]);
        let mut ctx = ExecutionContext::new("exec-1");
        ctx.set_variable(
            "rows",
            json!([{"id": 1, "name": "a"}, {"id": 2, "name": "b"}]),
        );
        let scatter_step = step(
            "sg1",
            json!({
                "scatter": {
                    "input": "rows",
                    "steps": [{"step_id": "enrich", "display_name": "enrich", "step_kind": "action", "dependencies": [], "dependency_level": 0, "parallel_group_id": null, "payload": {"score": 9}}],
                },
                "gather": {"operation": "collect"},
            }),
        );
        let result = exec.execute_scatter_gather(&scatter_step, &mut ctx).await.unwrap();
        assert_eq!(
            result,
            json!([{"id": 1, "name": "a", "score": 9}, {"id": 2, "name": "b", "score": 9}])
        );
    }

    #[tokio::test]
    async fn execute_scatter_gather_reports_per_item_failure_without_aborting() {
        let exec = executor(&["enrich"]);
        let mut ctx = ExecutionContext::new("exec-1");
        ctx.set_variable("rows", json!([{"id": 1}]));
        let scatter_step = step(
            "sg1",
            json!({
                "scatter": {
                    "input": "rows",
                    "steps": [{"step_id": "enrich", "display_name": "enrich", "step_kind": "action", "dependencies": [], "dependency_level": 0, "parallel_group_id": null, "payload": null}],
                },
                "gather": {"operation": "collect"},
            }),
        );
        let result = exec.execute_scatter_gather(&scatter_step, &mut ctx).await.unwrap();
        assert_eq!(result, json!([{"error": "enrich failed", "item": 0}]));
    }

    #[test]
    fn gather_reduce_sums_numbers_and_flattens_arrays() {
        assert_eq!(reduce_values(vec![json!(1), json!(2), json!(3)]), json!(6.0));
        assert_eq!(
            apply_gather("flatten", vec![json!([1, 2]), json!([3])]).unwrap(),
            json!([1, 2, 3])
        );
        assert!(apply_gather("nonsense", vec![]).is_err());
    }

    #[tokio::test]
    async fn execute_race_returns_first_settled_result() {
        let exec = executor(&[]);
        let ctx = ExecutionContext::new("exec-1");
        let steps = vec![step("a", json!(1))];
        let output = exec.execute_race(&steps, &ctx).await.unwrap();
        assert_eq!(output.step_id, "a");
    }

    #[tokio::test]
    async fn execute_with_timeout_fails_fast_on_deadline() {
        struct SlowExecutor;
        #[async_trait]
        impl StepExecutor for SlowExecutor {
            async fn execute(&self, step: &StepDescriptor, _ctx: &ExecutionContext) -> Result<StepOutput, StepError> {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(StepOutput {
                    step_id: step.step_id.clone(),
                    plugin: None,
                    action: None,
                    data: Value::Null,
                    metadata: StepOutputMetadata::default(),
                })
            }
        }
        let exec = ParallelExecutor::new(Arc::new(SlowExecutor), Arc::new(FirstArrayFieldExtractor), 2);
        let ctx = ExecutionContext::new("exec-1");
        let steps = vec![step("slow", Value::Null)];
        let result = exec.execute_with_timeout(&steps, &ctx, Duration::from_millis(5)).await;
        assert!(matches!(result, Err(ParallelError::ExecutionTimeout { .. })));
    }

    #[tokio::test]
    async fn execute_batched_waits_between_batches() {
        let exec = executor(&[]);
        let ctx = ExecutionContext::new("exec-1");
        let steps = vec![step("a", json!(1)), step("b", json!(2)), step("c", json!(3))];
        let outputs = exec
            .execute_batched(&steps, &ctx, 1, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(outputs.len(), 3);
    }
}
