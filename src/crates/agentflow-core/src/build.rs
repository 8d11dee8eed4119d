//! Graph compilation
//!
//! Turns the IR plus materialized instances into an [`ExecutableGraph`]: one
//! [`CompiledNode`] per vertex carrying its resolved callable, its edge
//! descriptor, and its policy configuration. Compilation happens once; the
//! scheduler then drives the compiled nodes for any number of runs.
//!
//! A node executor does three things: resolve the input expressions against
//! the running state, invoke the materialized callable (routers and parallel
//! nodes fall back to pass-through when no component is bound), and hand the
//! raw result back for output extraction. The policy stack of
//! [`crate::policy`] wraps every invocation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use crate::error::{EngineError, ErrorKind, Result};
use crate::event::EventPayload;
use crate::expr::{InputExpr, OutputExpr};
use crate::ir::{EdgeDescriptor, MapSpec, NodeIr, NodeKind, WorkflowIr};
use crate::policy::{LimiterRegistry, NodePolicies, PermissionGate};
use crate::registry::{Component, ResolvedComponent, Resolver};
use crate::runtime::{RunContext, StateView};

/// Telemetry identity of an LLM-backed node.
#[derive(Debug, Clone)]
pub struct LlmMeta {
    pub provider_id: String,
    pub model: Option<String>,
    /// Parse the callable's `text` output as JSON into a `json` key.
    pub parse_json: bool,
}

/// Telemetry identity of a tool-backed node.
#[derive(Debug, Clone)]
pub struct ToolMeta {
    pub tool_id: Option<String>,
    pub component_id: String,
    pub required_permissions: Vec<String>,
}

/// One compiled vertex.
pub struct CompiledNode {
    pub id: String,
    pub kind: NodeKind,
    pub next: EdgeDescriptor,
    pub map: Option<MapSpec>,
    inputs: BTreeMap<String, InputExpr>,
    outputs: BTreeMap<String, OutputExpr>,
    component: Option<Arc<dyn Component>>,
    llm: Option<LlmMeta>,
    tool: Option<ToolMeta>,
    policies: NodePolicies,
}

impl CompiledNode {
    /// Evaluate the input expression map against the current state.
    pub fn resolve_inputs(&self, view: &StateView) -> Value {
        let mut resolved = Map::new();
        for (key, expr) in &self.inputs {
            resolved.insert(key.clone(), expr.eval(view));
        }
        Value::Object(resolved)
    }

    /// Extract the declared outputs from a raw result mapping. Nodes without
    /// declared outputs publish the raw result unchanged.
    pub fn extract_outputs(&self, raw: &Value) -> Value {
        if self.outputs.is_empty() {
            return raw.clone();
        }
        let mut extracted = Map::new();
        for (name, path) in &self.outputs {
            extracted.insert(name.clone(), path.eval(raw));
        }
        Value::Object(extracted)
    }

    /// Run the policy-wrapped executor and return the raw result mapping.
    pub async fn invoke(&self, view: &StateView, ctx: &RunContext) -> Result<Value> {
        let inputs = self.resolve_inputs(view);
        let snapshot = view.state().snapshot();

        let kind = self.kind;
        let node_id = self.id.clone();
        let component = self.component.clone();
        let llm = self.llm.clone();
        let tool = self.tool.clone();
        let call_ctx = ctx.call_context(&self.id);
        let run_ctx = ctx.clone();

        let attempt = move || -> BoxFuture<'static, Result<Value>> {
            let node_id = node_id.clone();
            let component = component.clone();
            let llm = llm.clone();
            let tool = tool.clone();
            let call_ctx = call_ctx.clone();
            let run_ctx = run_ctx.clone();
            let snapshot = snapshot.clone();
            let inputs = inputs.clone();

            Box::pin(async move {
                let raw = match &component {
                    Some(component) => {
                        component
                            .before_execute(&call_ctx)
                            .await
                            .map_err(|e| e.in_node(node_id.clone()))?;

                        // The callable observes cancellation at its next
                        // suspension point; the race enforces it even for
                        // callables that never check the token.
                        let result = tokio::select! {
                            _ = call_ctx.cancel.cancelled() => Err(EngineError::cancelled()),
                            result = component.call(&snapshot, inputs.clone(), &call_ctx) => result,
                        };
                        let raw = result.map_err(|e| e.in_node(node_id.clone()))?;

                        component
                            .after_execute(&call_ctx, &raw)
                            .await
                            .map_err(|e| e.in_node(node_id.clone()))?;
                        raw
                    }
                    // A router without a component routes on its own
                    // resolved inputs; a bare parallel node is a fork point.
                    None => match kind {
                        NodeKind::Router => inputs.clone(),
                        _ => json!({}),
                    },
                };

                finish_attempt(&node_id, kind, raw, inputs, &llm, &tool, &run_ctx)
            })
        };

        let result = crate::policy::execute(&self.policies, ctx, &self.id, attempt).await;

        if let Err(err) = &result {
            if let Some(component) = &self.component {
                component.on_error(&ctx.call_context(&self.id), err).await;
            }
        }
        result
    }
}

/// Post-process one successful attempt: JSON mode, telemetry, cost.
fn finish_attempt(
    node_id: &str,
    kind: NodeKind,
    mut raw: Value,
    inputs: Value,
    llm: &Option<LlmMeta>,
    tool: &Option<ToolMeta>,
    ctx: &RunContext,
) -> Result<Value> {
    if let Some(llm) = llm {
        if llm.parse_json {
            let text = raw.get("text").and_then(Value::as_str).ok_or_else(|| {
                EngineError::node_error(
                    ErrorKind::LlmJsonParse,
                    node_id,
                    "JSON mode requires a string 'text' output",
                )
            })?;
            let parsed: Value = serde_json::from_str(text).map_err(|e| {
                EngineError::node_error(
                    ErrorKind::LlmJsonParse,
                    node_id,
                    format!("model output is not valid JSON: {e}"),
                )
            })?;
            if let Some(map) = raw.as_object_mut() {
                map.insert("json".to_string(), parsed);
            }
        }

        let tokens_in = read_tokens(&raw, "tokens_in");
        let tokens_out = read_tokens(&raw, "tokens_out");
        let model = raw
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| llm.model.clone());

        ctx.bus().emit(EventPayload::LlmCall {
            node_id: node_id.to_string(),
            provider_id: Some(llm.provider_id.clone()),
            model,
            tokens_in,
            tokens_out,
            inputs: inputs.clone(),
            outputs: raw.clone(),
        });
        ctx.core().cost.add(tokens_in, tokens_out);
    }

    if kind == NodeKind::Tool {
        if let Some(tool) = tool {
            ctx.bus().emit(EventPayload::ToolCall {
                node_id: node_id.to_string(),
                tool_id: tool.tool_id.clone(),
                component_id: tool.component_id.clone(),
                required_permissions: tool.required_permissions.clone(),
                inputs,
                outputs: raw.clone(),
            });
        }
    }

    Ok(raw)
}

fn read_tokens(raw: &Value, key: &str) -> u64 {
    raw.get("usage")
        .and_then(|usage| usage.get(key))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// The compiled, runnable graph.
pub struct ExecutableGraph {
    ir: Arc<WorkflowIr>,
    nodes: HashMap<String, Arc<CompiledNode>>,
}

impl std::fmt::Debug for ExecutableGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableGraph")
            .field("node_count", &self.nodes.len())
            .finish()
    }
}

impl ExecutableGraph {
    pub fn ir(&self) -> &Arc<WorkflowIr> {
        &self.ir
    }

    pub fn entry(&self) -> &str {
        &self.ir.graph.entry
    }

    pub fn node(&self, id: &str) -> Result<Arc<CompiledNode>> {
        self.nodes.get(id).cloned().ok_or_else(|| {
            EngineError::new(
                ErrorKind::EdgeEndpointInvalid,
                format!("no compiled node '{id}'"),
            )
        })
    }

    pub fn node_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// The edge table: each node's successor semantics, for inspection and
    /// round-trip checks.
    pub fn edge_table(&self) -> BTreeMap<String, EdgeDescriptor> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.next.clone()))
            .collect()
    }
}

/// Compiles IR + resolver into an [`ExecutableGraph`].
pub struct GraphBuilder {
    resolver: Arc<Resolver>,
    limiters: LimiterRegistry,
}

impl GraphBuilder {
    pub fn new(resolver: Arc<Resolver>) -> Self {
        let limiters = LimiterRegistry::from_policies(&resolver.ir().policies.rate_limit);
        Self { resolver, limiters }
    }

    pub fn build(self) -> Result<ExecutableGraph> {
        let ir = Arc::new(self.resolver.ir().clone());

        let mut nodes = HashMap::new();
        for node in ir.graph.nodes.values() {
            let compiled = self.compile_node(&ir, node)?;
            nodes.insert(node.id.clone(), Arc::new(compiled));
        }

        // Map bodies must have compiled, whatever order the section used.
        for node in ir.graph.nodes.values() {
            if let Some(map) = &node.map {
                if !nodes.contains_key(&map.body) {
                    return Err(EngineError::new(
                        ErrorKind::MapBodyMissing,
                        format!("map node '{}' has no compiled body '{}'", node.id, map.body),
                    ));
                }
            }
        }

        Ok(ExecutableGraph { ir, nodes })
    }

    fn compile_node(&self, ir: &WorkflowIr, node: &NodeIr) -> Result<CompiledNode> {
        let resolved = match &node.component_ref {
            Some(component_id) => Some(self.resolver.component(component_id)?),
            None => None,
        };

        if node.kind == NodeKind::Router {
            if let EdgeDescriptor::Routes(routes) = &node.next {
                if routes.is_empty() {
                    return Err(EngineError::new(
                        ErrorKind::RouterNoMatch,
                        format!("router node '{}' declares no routes", node.id),
                    ));
                }
            }
        }

        let llm = if node.kind == NodeKind::Llm {
            let resolved = resolved.as_ref().ok_or_else(|| {
                EngineError::new(
                    ErrorKind::NodeComponentNotFound,
                    format!("llm node '{}' has no component bound", node.id),
                )
            })?;
            Some(self.llm_meta(ir, node, resolved)?)
        } else {
            None
        };

        let tool = resolved.as_ref().and_then(|resolved| {
            resolved.tool_id.as_ref()?;
            Some(ToolMeta {
                tool_id: resolved.tool_id.clone(),
                component_id: resolved.id.clone(),
                required_permissions: resolved.required_permissions.clone(),
            })
        });

        let policies = self.node_policies(ir, node, resolved.as_ref());

        Ok(CompiledNode {
            id: node.id.clone(),
            kind: node.kind,
            next: node.next.clone(),
            map: node.map.clone(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
            component: resolved.map(|r| r.instance),
            llm,
            tool,
            policies,
        })
    }

    fn llm_meta(&self, ir: &WorkflowIr, node: &NodeIr, resolved: &ResolvedComponent) -> Result<LlmMeta> {
        let provider_id = resolved.provider_id.clone().ok_or_else(|| {
            EngineError::new(
                ErrorKind::ProviderMissing,
                format!(
                    "llm node '{}' resolves no provider (component '{}' declares none and \
                     runtime.defaults.provider is unset)",
                    node.id, resolved.id
                ),
            )
        })?;

        let component_model = ir
            .components
            .get(&resolved.id)
            .and_then(|c| c.config.get("model"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let model = node
            .config
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(component_model);

        let parse_json = node
            .config
            .get("parse_json")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(LlmMeta {
            provider_id,
            model,
            parse_json,
        })
    }

    fn node_policies(
        &self,
        ir: &WorkflowIr,
        node: &NodeIr,
        resolved: Option<&ResolvedComponent>,
    ) -> NodePolicies {
        let permission = resolved.and_then(|resolved| {
            if resolved.required_permissions.is_empty() {
                return None;
            }
            let mut allowed = ir.policies.permissions.default_allow.clone();
            if let Some(tool_id) = &resolved.tool_id {
                if let Some(grants) = ir.policies.permissions.by_target.get(tool_id) {
                    allowed.extend(grants.iter().cloned());
                }
            }
            if let Some(grants) = ir.policies.permissions.by_target.get(&node.id) {
                allowed.extend(grants.iter().cloned());
            }
            Some(PermissionGate::new(
                resolved.required_permissions.clone(),
                allowed,
            ))
        });

        let mut limiters = Vec::new();
        if let Some(scoped) = self.limiters.for_node(&node.id) {
            limiters.push(scoped);
        }
        if let Some(provider_id) = resolved.and_then(|r| r.provider_id.as_ref()) {
            if let Some(scoped) = self.limiters.for_provider(provider_id) {
                limiters.push(scoped);
            }
        }

        NodePolicies {
            permission,
            retry: ir.policies.retry.for_node(&node.id).clone(),
            limiters,
        }
    }
}
