//! Typed intermediate representation of a workflow document
//!
//! The normalizer turns the raw document into these records; the builder and
//! scheduler consume them read-only. Identifiers are unique within their
//! kind and every cross-reference has been checked by the time a value of
//! [`WorkflowIr`] exists. The polymorphic `next` field of the document is
//! compiled into [`EdgeDescriptor`] once, here, and never re-parsed at run
//! time.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::expr::{InputExpr, OutputExpr};

/// A non-blocking validation finding, anchored to a document location.
#[derive(Debug, Clone, PartialEq)]
pub struct Warning {
    pub pointer: String,
    pub message: String,
}

impl Warning {
    pub fn new(pointer: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            pointer: pointer.into(),
            message: message.into(),
        }
    }
}

/// `meta` section.
#[derive(Debug, Clone)]
pub struct MetaIr {
    pub version: u64,
    pub name: String,
    pub description: Option<String>,
}

/// `runtime` section. `engine` is an opaque tag; `exporters` descriptors are
/// passed through untouched for the host to consume.
#[derive(Debug, Clone, Default)]
pub struct RuntimeIr {
    pub engine: Option<String>,
    pub default_provider: Option<String>,
    pub factories: FactoryBindings,
    pub exporters: Vec<Value>,
}

/// `runtime.factories.*`: type name to factory identifier, per registry.
#[derive(Debug, Clone, Default)]
pub struct FactoryBindings {
    pub providers: BTreeMap<String, String>,
    pub tools: BTreeMap<String, String>,
    pub components: BTreeMap<String, String>,
}

/// A declared LLM endpoint, materialized lazily into an opaque handle.
#[derive(Debug, Clone)]
pub struct ProviderIr {
    pub id: String,
    pub kind: String,
    pub config: Value,
}

/// A declared tool. `permissions` gates execution via the permission policy.
#[derive(Debug, Clone)]
pub struct ToolIr {
    pub id: String,
    pub kind: String,
    pub provider_ref: Option<String>,
    pub permissions: Vec<String>,
    pub config: Value,
}

/// A declared reusable component.
#[derive(Debug, Clone)]
pub struct ComponentIr {
    pub id: String,
    pub kind: String,
    pub provider_ref: Option<String>,
    pub tool_ref: Option<String>,
    pub inputs: BTreeMap<String, InputExpr>,
    pub outputs: BTreeMap<String, OutputExpr>,
    pub config: Value,
    pub defaults: Value,
}

/// A declared conversation-history backend.
#[derive(Debug, Clone)]
pub struct HistoryIr {
    pub id: String,
    pub backend: String,
    pub config: Value,
}

/// Graph node kind tag. The scheduler dispatches on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Llm,
    Tool,
    Router,
    Map,
    Parallel,
    Component,
}

impl NodeKind {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "llm" => Some(Self::Llm),
            "tool" => Some(Self::Tool),
            "router" => Some(Self::Router),
            "map" => Some(Self::Map),
            "parallel" => Some(Self::Parallel),
            "component" => Some(Self::Component),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Tool => "tool",
            Self::Router => "router",
            Self::Map => "map",
            Self::Parallel => "parallel",
            Self::Component => "component",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compiled form of a node's `next` field.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeDescriptor {
    /// Terminal node.
    None,
    /// Unconditional successor.
    Single(String),
    /// Parallel fan-out (only on `parallel` nodes).
    Fanout(Vec<String>),
    /// Conditional routing (only on `router` nodes); key `default` is the
    /// fallback.
    Routes(BTreeMap<String, String>),
}

impl EdgeDescriptor {
    /// Every node id this descriptor can reach.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::None => Vec::new(),
            Self::Single(id) => vec![id.as_str()],
            Self::Fanout(ids) => ids.iter().map(String::as_str).collect(),
            Self::Routes(routes) => routes.values().map(String::as_str).collect(),
        }
    }
}

/// How one failed map element affects the rest of the iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapFailureMode {
    /// First failure cancels the remaining iterations and fails the map.
    FailFast,
    /// Failures are recorded as error objects alongside successes.
    CollectErrors,
    /// Failed elements are dropped from the result list.
    SkipFailed,
}

impl MapFailureMode {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "fail_fast" => Some(Self::FailFast),
            "collect_errors" => Some(Self::CollectErrors),
            "skip_failed" => Some(Self::SkipFailed),
            _ => None,
        }
    }
}

/// Iteration settings of a `map` node.
#[derive(Debug, Clone)]
pub struct MapSpec {
    /// Body node executed once per element.
    pub body: String,
    /// Expression yielding the iteration source sequence.
    pub over: InputExpr,
    /// Maximum simultaneous iterations, at least 1.
    pub concurrency: usize,
    /// Emit results in input order (true) or completion order (false).
    pub ordered: bool,
    pub failure_mode: MapFailureMode,
    /// Key the result list is published under.
    pub result_key: String,
}

/// A graph vertex.
#[derive(Debug, Clone)]
pub struct NodeIr {
    pub id: String,
    pub kind: NodeKind,
    pub component_ref: Option<String>,
    pub inputs: BTreeMap<String, InputExpr>,
    pub outputs: BTreeMap<String, OutputExpr>,
    pub config: Value,
    pub next: EdgeDescriptor,
    /// Present exactly when `kind == Map`.
    pub map: Option<MapSpec>,
}

/// One declared graph-level output.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphOutputIr {
    pub key: String,
    pub node_id: String,
    pub output_name: String,
}

/// The executable graph description.
#[derive(Debug, Clone)]
pub struct GraphIr {
    pub entry: String,
    pub nodes: BTreeMap<String, NodeIr>,
    pub outputs: Vec<GraphOutputIr>,
}

/// Retry backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Fixed,
    Exponential,
    Jitter,
}

impl RetryStrategy {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "fixed" => Some(Self::Fixed),
            "exponential" => Some(Self::Exponential),
            "jitter" => Some(Self::Jitter),
            _ => None,
        }
    }
}

/// Retry settings for one node.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySpec {
    pub strategy: RetryStrategy,
    /// Total attempts including the first; 1 disables retry.
    pub max_attempts: u32,
    /// Base delay in seconds.
    pub interval: f64,
    /// Uniform extra seconds for the jitter strategy.
    pub jitter: f64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_attempts: 1,
            interval: 0.0,
            jitter: 0.0,
        }
    }
}

/// `policies.retry`.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    pub default: RetrySpec,
    pub overrides: BTreeMap<String, RetrySpec>,
}

impl RetryPolicies {
    /// The effective spec for a node.
    pub fn for_node(&self, node_id: &str) -> &RetrySpec {
        self.overrides.get(node_id).unwrap_or(&self.default)
    }
}

/// Rate limit algorithm and parameters for one scope.
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitSpec {
    TokenBucket { capacity: u32, refill_per_sec: f64 },
    FixedWindow { limit: u32, window_secs: f64 },
}

/// A shared bucket covering several providers under one alias.
#[derive(Debug, Clone)]
pub struct SharedLimit {
    pub providers: Vec<String>,
    pub spec: RateLimitSpec,
}

/// `policies.rate_limit`.
#[derive(Debug, Clone, Default)]
pub struct RateLimitPolicies {
    pub providers: BTreeMap<String, RateLimitSpec>,
    pub nodes: BTreeMap<String, RateLimitSpec>,
    pub shared: BTreeMap<String, SharedLimit>,
}

/// `policies.masking`.
#[derive(Debug, Clone)]
pub struct MaskingSpec {
    /// Dotted payload paths replaced unconditionally.
    pub fields: Vec<String>,
    /// Dotted payload paths masked when their value changes within a run.
    pub diff_fields: Vec<String>,
    pub mask_value: String,
}

impl Default for MaskingSpec {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            diff_fields: Vec::new(),
            mask_value: "***".to_string(),
        }
    }
}

/// `policies.permissions`.
#[derive(Debug, Clone, Default)]
pub struct PermissionsSpec {
    pub default_allow: BTreeSet<String>,
    pub by_target: BTreeMap<String, BTreeSet<String>>,
}

/// `policies.cost`.
#[derive(Debug, Clone, Default)]
pub struct CostSpec {
    /// Hard token ceiling per run; `None` disables accounting aborts.
    pub per_run_tokens: Option<u64>,
}

/// All policy sections.
#[derive(Debug, Clone, Default)]
pub struct PoliciesIr {
    pub retry: RetryPolicies,
    pub rate_limit: RateLimitPolicies,
    pub masking: MaskingSpec,
    pub permissions: PermissionsSpec,
    pub cost: CostSpec,
}

/// The complete validated document.
#[derive(Debug, Clone)]
pub struct WorkflowIr {
    pub meta: MetaIr,
    pub runtime: RuntimeIr,
    pub providers: BTreeMap<String, ProviderIr>,
    pub tools: BTreeMap<String, ToolIr>,
    pub components: BTreeMap<String, ComponentIr>,
    pub histories: BTreeMap<String, HistoryIr>,
    pub graph: GraphIr,
    pub policies: PoliciesIr,
    pub warnings: Vec<Warning>,
}

impl WorkflowIr {
    /// Graph name used in events; falls back to a fixed label when the
    /// document omits `meta.name`.
    pub fn graph_name(&self) -> &str {
        &self.meta.name
    }
}
