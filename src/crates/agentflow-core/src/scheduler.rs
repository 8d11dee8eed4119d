//! The run loop
//!
//! Drives a compiled graph from its entry node until the frontier is empty,
//! a fatal error aborts the run, the deadline fires, or the caller cancels.
//!
//! Execution is level-wise: a node runs, its successors are computed from
//! its edge descriptor, and a frontier with more than one node runs as a
//! concurrent burst under a child cancellation scope. Parallel fan-out
//! recurses per branch, so nested fan-out keeps its concurrency; the burst
//! joins before the union of successor sets (deduplicated) continues, which
//! is what makes a join node run exactly once after all its feeders.
//!
//! Map nodes iterate their body under a concurrency cap; the body's events
//! are emitted per iteration but its outputs reach the graph only through
//! the map's result list.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::build::{CompiledNode, ExecutableGraph};
use crate::error::{EngineError, ErrorKind, Result};
use crate::event::{wall_clock, EventBus, EventExporter, EventPayload, RunStatus};
use crate::ir::{EdgeDescriptor, MapFailureMode};
use crate::mask::Masker;
use crate::policy::CostTally;
use crate::runtime::{
    Registries, RunContext, RunCore, RunError, RunOptions, RunResult, RunState, StateView,
};

/// Executes runs against one compiled graph.
pub struct GraphRunner {
    graph: Arc<ExecutableGraph>,
    registries: Arc<Registries>,
    exporters: Vec<Arc<dyn EventExporter>>,
}

impl GraphRunner {
    pub fn new(
        graph: Arc<ExecutableGraph>,
        registries: Arc<Registries>,
        exporters: Vec<Arc<dyn EventExporter>>,
    ) -> Self {
        Self {
            graph,
            registries,
            exporters,
        }
    }

    /// Execute the graph once.
    pub async fn run(&self, inputs: Value, options: RunOptions) -> RunResult {
        let ir = self.graph.ir();
        let run_id = Uuid::new_v4().to_string();
        let session_id = options.session_id.clone().unwrap_or_else(|| run_id.clone());
        let graph_name = ir.graph_name().to_string();

        let bus = EventBus::new(
            run_id.clone(),
            Masker::new(ir.policies.masking.clone()),
            self.exporters.clone(),
        );

        let core = Arc::new(RunCore {
            run_id: run_id.clone(),
            session_id,
            graph_name: graph_name.clone(),
            bus,
            state: Arc::new(RunState::new(inputs)),
            cost: CostTally::new(ir.policies.cost.per_run_tokens),
            registries: self.registries.clone(),
            timed_out: AtomicBool::new(false),
        });

        let token = options.cancel.clone().unwrap_or_default();
        let ctx = RunContext::new(core.clone(), token.clone());

        ctx.bus().emit(EventPayload::GraphStart {
            graph_name: graph_name.clone(),
            entrypoint: self.graph.entry().to_string(),
        });

        // Deadline watchdog: fire the token once at the effective cutoff.
        let watchdog = options.cutoff().map(|cutoff| {
            let timeout_secs = options
                .timeout
                .unwrap_or_else(|| (cutoff - tokio::time::Instant::now()).as_secs_f64());
            let watch_ctx = ctx.clone();
            let watch_token = token.clone();
            let watch_name = graph_name.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = watch_token.cancelled() => {}
                    _ = tokio::time::sleep_until(cutoff) => {
                        if watch_ctx.mark_timed_out() {
                            watch_ctx.bus().emit(EventPayload::Timeout {
                                graph_name: watch_name,
                                timeout: timeout_secs,
                            });
                        }
                        watch_token.cancel();
                    }
                }
            })
        });

        let driver = Driver {
            graph: self.graph.clone(),
        };
        let outcome = driver.drive(ctx.clone()).await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let status = match &outcome {
            Ok(()) => RunStatus::Success,
            Err(_) if ctx.timed_out() => RunStatus::Timeout,
            Err(err) if err.is_cancelled() => {
                ctx.bus().emit(EventPayload::Cancelled {
                    graph_name: graph_name.clone(),
                });
                RunStatus::Cancelled
            }
            Err(err) => {
                ctx.bus().emit(EventPayload::ErrorRaised {
                    node_id: err.node.clone(),
                    kind: err.kind.as_str(),
                    message: err.message.clone(),
                });
                RunStatus::Error
            }
        };

        let outputs = self.collect_outputs(&ctx);
        ctx.bus().emit(EventPayload::GraphFinish {
            status,
            outputs: outputs.clone(),
        });

        RunResult {
            run_id,
            status,
            outputs,
            node_outputs: ctx.state().outputs_table(),
            tokens_used: core.cost.used(),
            error: outcome.err().map(|err| RunError::from(&err)),
        }
    }

    /// Read each declared `{key, node, output}` from the outputs table.
    fn collect_outputs(&self, ctx: &RunContext) -> Value {
        let mut outputs = Map::new();
        for declared in &self.graph.ir().graph.outputs {
            let value = ctx
                .state()
                .output_of(&declared.node_id)
                .and_then(|node_outputs| node_outputs.get(&declared.output_name).cloned())
                .unwrap_or(Value::Null);
            outputs.insert(declared.key.clone(), value);
        }
        Value::Object(outputs)
    }
}

/// The recursive execution core; cheap to clone into spawned branches.
#[derive(Clone)]
struct Driver {
    graph: Arc<ExecutableGraph>,
}

impl Driver {
    /// Consume the frontier until it is empty or a failure aborts the run.
    async fn drive(&self, ctx: RunContext) -> Result<()> {
        let mut frontier = vec![self.graph.entry().to_string()];
        while !frontier.is_empty() {
            ctx.checkpoint()?;
            frontier = match frontier.len() {
                1 => {
                    let node_id = frontier.remove(0);
                    self.execute_branch(node_id, ctx.clone()).await?
                }
                _ => self.execute_burst(frontier, &ctx).await?,
            };
        }
        Ok(())
    }

    /// Execute one node and everything its fan-out implies, returning the
    /// successor frontier.
    fn execute_branch(
        &self,
        node_id: String,
        ctx: RunContext,
    ) -> futures::future::BoxFuture<'static, Result<Vec<String>>> {
        let driver = self.clone();
        Box::pin(async move {
            let node = driver.graph.node(&node_id)?;

            if node.kind == crate::ir::NodeKind::Map {
                return driver.run_map(&node, &ctx).await;
            }

            let (raw, _) = driver.step(&node, StateView::new(ctx.state().clone()), &ctx, true).await?;

            match &node.next {
                EdgeDescriptor::None => Ok(Vec::new()),
                EdgeDescriptor::Single(target) => Ok(vec![target.clone()]),
                EdgeDescriptor::Routes(routes) => {
                    let target = route_target(&node, routes, &raw)?;
                    Ok(vec![target])
                }
                EdgeDescriptor::Fanout(targets) => {
                    driver.execute_burst(targets.clone(), &ctx).await
                }
            }
        })
    }

    /// Run several branches concurrently under one child cancellation scope
    /// and join them. The first failure cancels its siblings; the union of
    /// successor sets (deduplicated, first occurrence wins) continues.
    async fn execute_burst(&self, targets: Vec<String>, ctx: &RunContext) -> Result<Vec<String>> {
        let scope = ctx.child_scope();
        let mut join = JoinSet::new();
        for target in dedup(targets) {
            let driver = self.clone();
            let branch_ctx = scope.clone();
            join.spawn(async move { driver.execute_branch(target, branch_ctx).await });
        }

        let mut successors = Vec::new();
        let mut first_error: Option<EngineError> = None;
        while let Some(joined) = join.join_next().await {
            let branch = match joined {
                Ok(branch) => branch,
                Err(join_err) => Err(EngineError::new(
                    ErrorKind::NodeRuntime,
                    format!("branch task failed: {join_err}"),
                )),
            };
            match branch {
                Ok(next) => successors.extend(next),
                Err(err) => {
                    if first_error.is_none() {
                        scope.cancel_token().cancel();
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(dedup(successors)),
        }
    }

    /// Execute one node: start event, policy-wrapped invocation, output
    /// extraction, finish event. Returns the raw result and the extracted
    /// outputs; `record` controls whether the outputs enter the shared
    /// table (map bodies publish through the map result instead).
    async fn step(
        &self,
        node: &Arc<CompiledNode>,
        view: StateView,
        ctx: &RunContext,
        record: bool,
    ) -> Result<(Value, Value)> {
        ctx.checkpoint()?;

        let core = ctx.core();
        ctx.bus().emit(EventPayload::NodeStart {
            node_id: node.id.clone(),
            kind: node.kind.as_str(),
            graph_name: core.graph_name.clone(),
            started_at: wall_clock(),
        });
        let started = tokio::time::Instant::now();

        let result = match &node.next {
            EdgeDescriptor::Fanout(targets) if targets.is_empty() => Err(EngineError::node_error(
                ErrorKind::ParallelEmpty,
                node.id.clone(),
                format!("parallel node '{}' fans out to nothing", node.id),
            )),
            _ => node.invoke(&view, ctx).await,
        };

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match result {
            Ok(raw) => {
                let outputs = node.extract_outputs(&raw);
                if record {
                    ctx.state().record(&node.id, outputs.clone());
                }
                ctx.bus().emit(EventPayload::NodeFinish {
                    node_id: node.id.clone(),
                    status: "success",
                    duration_ms,
                    outputs: outputs.clone(),
                });
                Ok((raw, outputs))
            }
            Err(err) => {
                let status = if err.is_cancelled() { "cancelled" } else { "error" };
                ctx.bus().emit(EventPayload::NodeFinish {
                    node_id: node.id.clone(),
                    status,
                    duration_ms,
                    outputs: Value::Null,
                });
                Err(err.in_node(node.id.clone()))
            }
        }
    }

    /// Drive a map node: evaluate the source, iterate the body under the
    /// concurrency cap, assemble the result list, publish it.
    async fn run_map(&self, node: &Arc<CompiledNode>, ctx: &RunContext) -> Result<Vec<String>> {
        ctx.checkpoint()?;

        let core = ctx.core();
        ctx.bus().emit(EventPayload::NodeStart {
            node_id: node.id.clone(),
            kind: node.kind.as_str(),
            graph_name: core.graph_name.clone(),
            started_at: wall_clock(),
        });
        let started = tokio::time::Instant::now();

        let outcome = self.map_iterations(node, ctx).await;

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(raw) => {
                let outputs = node.extract_outputs(&raw);
                ctx.state().record(&node.id, outputs.clone());
                ctx.bus().emit(EventPayload::NodeFinish {
                    node_id: node.id.clone(),
                    status: "success",
                    duration_ms,
                    outputs,
                });
                match &node.next {
                    EdgeDescriptor::Single(target) => Ok(vec![target.clone()]),
                    _ => Ok(Vec::new()),
                }
            }
            Err(err) => {
                let status = if err.is_cancelled() { "cancelled" } else { "error" };
                ctx.bus().emit(EventPayload::NodeFinish {
                    node_id: node.id.clone(),
                    status,
                    duration_ms,
                    outputs: Value::Null,
                });
                Err(err.in_node(node.id.clone()))
            }
        }
    }

    async fn map_iterations(&self, node: &Arc<CompiledNode>, ctx: &RunContext) -> Result<Value> {
        let spec = node.map.as_ref().ok_or_else(|| {
            EngineError::node_error(
                ErrorKind::MapBodyMissing,
                node.id.clone(),
                format!("node '{}' compiled without a map spec", node.id),
            )
        })?;

        let view = StateView::new(ctx.state().clone());
        let source = spec.over.eval(&view);
        let items = match source {
            Value::Array(items) => items,
            other => {
                return Err(EngineError::node_error(
                    ErrorKind::MapOverNotArray,
                    node.id.clone(),
                    format!(
                        "map source must be a sequence, got {}",
                        type_name(&other)
                    ),
                ))
            }
        };

        if items.is_empty() {
            return Ok(result_mapping(&spec.result_key, Vec::new()));
        }

        let body = self.graph.node(&spec.body)?;
        let scope = ctx.child_scope();
        let semaphore = Arc::new(Semaphore::new(spec.concurrency));
        let mut join = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let driver = self.clone();
            let body = body.clone();
            let iter_ctx = scope.clone();
            let semaphore = semaphore.clone();
            let map_id = node.id.clone();

            join.spawn(async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .map_err(|_| EngineError::cancelled())?;
                iter_ctx.checkpoint()?;

                let overlay = json!({
                    "current_item": item,
                    "current_index": index,
                });
                let view = StateView::new(iter_ctx.state().clone()).with_overlay(map_id.clone(), overlay);

                let result = driver.step(&body, view, &iter_ctx, false).await;
                Ok::<(usize, Result<Value>), EngineError>((
                    index,
                    result.map(|(_, extracted)| extracted),
                ))
            });
        }

        let mut completed: Vec<(usize, Value)> = Vec::new();
        let mut fail_fast_error: Option<EngineError> = None;
        while let Some(joined) = join.join_next().await {
            let iteration = match joined {
                Ok(iteration) => iteration,
                Err(join_err) => Err(EngineError::new(
                    ErrorKind::NodeRuntime,
                    format!("map iteration task failed: {join_err}"),
                )),
            };
            let (index, result) = match iteration {
                Ok(entry) => entry,
                Err(err) => {
                    // Task-level failure (cancelled before the body ran).
                    if fail_fast_error.is_none() {
                        fail_fast_error = Some(err);
                        scope.cancel_token().cancel();
                    }
                    continue;
                }
            };

            match result {
                Ok(extracted) => completed.push((index, extracted)),
                // Cancellation is never a per-element failure; it aborts the
                // iteration set whatever the failure mode says.
                Err(err) if err.is_cancelled() => {
                    if fail_fast_error.is_none() {
                        scope.cancel_token().cancel();
                        fail_fast_error = Some(err);
                    }
                }
                Err(err) => match spec.failure_mode {
                    MapFailureMode::FailFast => {
                        if fail_fast_error.is_none() {
                            scope.cancel_token().cancel();
                            fail_fast_error = Some(err);
                        }
                    }
                    MapFailureMode::CollectErrors => {
                        completed.push((
                            index,
                            json!({
                                "error": {
                                    "kind": err.kind.as_str(),
                                    "message": err.message,
                                }
                            }),
                        ));
                    }
                    MapFailureMode::SkipFailed => {}
                },
            }
        }

        if let Some(err) = fail_fast_error {
            return Err(err);
        }

        if spec.ordered {
            completed.sort_by_key(|(index, _)| *index);
        }
        let results: Vec<Value> = completed.into_iter().map(|(_, value)| value).collect();
        Ok(result_mapping(&spec.result_key, results))
    }
}

fn result_mapping(result_key: &str, results: Vec<Value>) -> Value {
    let mut raw = Map::new();
    raw.insert(result_key.to_string(), Value::Array(results));
    Value::Object(raw)
}

/// Pick a router's successor from its result mapping.
fn route_target(
    node: &CompiledNode,
    routes: &std::collections::BTreeMap<String, String>,
    raw: &Value,
) -> Result<String> {
    let extracted = node.extract_outputs(raw);
    let route = extracted
        .get("route")
        .and_then(Value::as_str)
        .or_else(|| raw.get("route").and_then(Value::as_str));

    if let Some(route) = route {
        if let Some(target) = routes.get(route) {
            return Ok(target.clone());
        }
    }
    if let Some(fallback) = routes.get("default") {
        return Ok(fallback.clone());
    }

    Err(EngineError::node_error(
        ErrorKind::RouterNoMatch,
        node.id.clone(),
        match route {
            Some(route) => format!("no route '{route}' and no default on router '{}'", node.id),
            None => format!("router '{}' returned no route key", node.id),
        },
    ))
}

fn dedup(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_preserves_first_occurrence() {
        let ids = vec!["m".to_string(), "a".to_string(), "m".to_string()];
        assert_eq!(dedup(ids), vec!["m".to_string(), "a".to_string()]);
    }

    #[test]
    fn type_names_cover_the_value_tree() {
        assert_eq!(type_name(&json!(null)), "null");
        assert_eq!(type_name(&json!(1)), "number");
        assert_eq!(type_name(&json!("s")), "string");
        assert_eq!(type_name(&json!([])), "sequence");
        assert_eq!(type_name(&json!({})), "mapping");
    }
}
