//! Run-scoped context and state
//!
//! One [`RunContext`] exists per graph execution. It carries the one-shot
//! cancellation token, the event bus handle, the node-outputs table, the
//! cost tally, and the registries view components receive. Parallel and map
//! scopes clone the context with a child token so cancelling a scope never
//! reaches unrelated branches, while run-level cancellation reaches all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::event::EventBus;
use crate::expr::EvalScope;
use crate::history::HistoryHandle;
use crate::policy::cost::CostTally;
use crate::registry::{ProviderHandle, Resolver};

/// The view of materialized instances exposed to components via `ctx`.
pub struct Registries {
    resolver: Arc<Resolver>,
    histories: HashMap<String, HistoryHandle>,
}

impl Registries {
    pub fn new(resolver: Arc<Resolver>, histories: HashMap<String, HistoryHandle>) -> Self {
        Self {
            resolver,
            histories,
        }
    }

    /// The materialized provider handle for a declared provider id.
    pub fn provider(&self, id: &str) -> Result<ProviderHandle> {
        self.resolver.provider(id)
    }

    /// The history backend declared under an id, if any.
    pub fn history(&self, id: &str) -> Option<HistoryHandle> {
        self.histories.get(id).cloned()
    }

    pub fn history_ids(&self) -> Vec<&str> {
        self.histories.keys().map(String::as_str).collect()
    }
}

/// Context handed to component and tool callables.
#[derive(Clone)]
pub struct CallContext {
    pub run_id: String,
    pub session_id: String,
    pub node_id: String,
    pub registries: Arc<Registries>,
    pub cancel: CancellationToken,
}

/// Mutable per-run state: the input mapping and the node-outputs table.
///
/// Writes happen from the node that finished; readers are its successors.
/// The scheduler's task joins provide the happens-before edge; the lock only
/// guards concurrent sibling access.
pub struct RunState {
    graph_inputs: Value,
    node_outputs: RwLock<HashMap<String, Value>>,
}

impl RunState {
    pub fn new(graph_inputs: Value) -> Self {
        Self {
            graph_inputs,
            node_outputs: RwLock::new(HashMap::new()),
        }
    }

    pub fn graph_inputs(&self) -> &Value {
        &self.graph_inputs
    }

    pub fn record(&self, node_id: &str, outputs: Value) {
        self.node_outputs.write().insert(node_id.to_string(), outputs);
    }

    pub fn output_of(&self, node_id: &str) -> Option<Value> {
        self.node_outputs.read().get(node_id).cloned()
    }

    /// The whole table as a JSON mapping, for run results.
    pub fn outputs_table(&self) -> Value {
        let table = self.node_outputs.read();
        let mut map = Map::new();
        for (id, outputs) in table.iter() {
            map.insert(id.clone(), outputs.clone());
        }
        Value::Object(map)
    }

    /// Snapshot passed to callables as their `state` argument.
    pub fn snapshot(&self) -> Value {
        let mut map = Map::new();
        map.insert("inputs".to_string(), self.graph_inputs.clone());
        map.insert("nodes".to_string(), self.outputs_table());
        Value::Object(map)
    }
}

/// A read view over [`RunState`] with an optional per-scope overlay.
///
/// Map iterations overlay `{current_item, current_index}` under the map
/// node's id so body input expressions can reference the element without the
/// iterations racing on the shared table.
#[derive(Clone)]
pub struct StateView {
    state: Arc<RunState>,
    overlay: Option<(String, Value)>,
}

impl StateView {
    pub fn new(state: Arc<RunState>) -> Self {
        Self {
            state,
            overlay: None,
        }
    }

    pub fn with_overlay(&self, node_id: impl Into<String>, extra: Value) -> Self {
        Self {
            state: self.state.clone(),
            overlay: Some((node_id.into(), extra)),
        }
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.state
    }
}

impl EvalScope for StateView {
    fn graph_inputs(&self) -> &Value {
        self.state.graph_inputs()
    }

    fn node_output(&self, node_id: &str) -> Option<Value> {
        let recorded = self.state.output_of(node_id);
        match &self.overlay {
            Some((id, extra)) if id == node_id => match recorded {
                Some(Value::Object(mut base)) => {
                    if let Value::Object(extra) = extra {
                        for (k, v) in extra {
                            base.insert(k.clone(), v.clone());
                        }
                    }
                    Some(Value::Object(base))
                }
                _ => Some(extra.clone()),
            },
            _ => recorded,
        }
    }
}

/// Everything shared by one run.
pub struct RunCore {
    pub run_id: String,
    pub session_id: String,
    pub graph_name: String,
    pub bus: EventBus,
    pub state: Arc<RunState>,
    pub cost: CostTally,
    pub registries: Arc<Registries>,
    /// Set exactly once when the run's deadline fires.
    pub timed_out: AtomicBool,
}

/// Cloneable per-scope handle on a run.
#[derive(Clone)]
pub struct RunContext {
    core: Arc<RunCore>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(core: Arc<RunCore>, cancel: CancellationToken) -> Self {
        Self { core, cancel }
    }

    pub fn core(&self) -> &Arc<RunCore> {
        &self.core
    }

    pub fn bus(&self) -> &EventBus {
        &self.core.bus
    }

    pub fn state(&self) -> &Arc<RunState> {
        &self.core.state
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A context whose token is a child of this scope's token. Cancelling
    /// the child leaves this scope running; cancelling this scope cancels
    /// the child.
    pub fn child_scope(&self) -> RunContext {
        Self {
            core: self.core.clone(),
            cancel: self.cancel.child_token(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn timed_out(&self) -> bool {
        self.core.timed_out.load(Ordering::SeqCst)
    }

    pub fn mark_timed_out(&self) -> bool {
        !self.core.timed_out.swap(true, Ordering::SeqCst)
    }

    /// Cancellation check at a suspension point.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EngineError::cancelled())
        } else {
            Ok(())
        }
    }

    /// Sleep that resumes early with a cancellation error when the scope's
    /// token fires.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::cancelled()),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub fn call_context(&self, node_id: &str) -> CallContext {
        CallContext {
            run_id: self.core.run_id.clone(),
            session_id: self.core.session_id.clone(),
            node_id: node_id.to_string(),
            registries: self.core.registries.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Per-run options supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Session id exposed to components and history backends; defaults to
    /// the run id.
    pub session_id: Option<String>,
    /// Relative cutoff in seconds from run start.
    pub timeout: Option<f64>,
    /// Absolute cutoff instant. The effective cutoff is the earlier of the
    /// two when both are set.
    pub deadline: Option<tokio::time::Instant>,
    /// External cancellation: firing this token cancels the run.
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_deadline(mut self, deadline: tokio::time::Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The effective cutoff instant, if any.
    pub fn cutoff(&self) -> Option<tokio::time::Instant> {
        let from_timeout = self
            .timeout
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs_f64(secs));
        match (from_timeout, self.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }
}

/// The first fatal failure of a run, by stable kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunError {
    pub kind: String,
    pub message: String,
}

impl From<&EngineError> for RunError {
    fn from(err: &EngineError) -> Self {
        Self {
            kind: err.kind.as_str().to_string(),
            message: err.message.clone(),
        }
    }
}

/// What a run returns to the caller.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: String,
    pub status: crate::event::RunStatus,
    /// Graph outputs keyed by their declared keys.
    pub outputs: Value,
    /// The full node-outputs table, for inspection.
    pub node_outputs: Value,
    /// Tokens accounted across the run's `llm.call`s.
    pub tokens_used: u64,
    /// Present when status is not success.
    pub error: Option<RunError>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == crate::event::RunStatus::Success
    }
}
