//! Document normalization
//!
//! Consumes the raw document tree, checks structure and references, fills
//! defaults, and produces the [`WorkflowIr`] plus an ordered warning list.
//! Warnings never block; only referential or structural errors do. Every
//! failure carries a json-pointer-like path to the offending field.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::error::{EngineError, ErrorKind, Result};
use crate::expr::{InputExpr, OutputExpr};
use crate::ir::*;

/// Supported document schema version.
pub const SUPPORTED_META_VERSION: u64 = 2;

const TOP_LEVEL_KEYS: &[&str] = &[
    "meta",
    "runtime",
    "providers",
    "tools",
    "components",
    "graph",
    "histories",
    "policies",
];

/// Normalize a raw document into the typed IR.
pub fn normalize(doc: &Value) -> Result<WorkflowIr> {
    Normalizer::default().run(doc)
}

#[derive(Default)]
struct Normalizer {
    warnings: Vec<Warning>,
}

impl Normalizer {
    fn run(mut self, doc: &Value) -> Result<WorkflowIr> {
        let root = expect_object(doc, "/")?;

        for key in root.keys() {
            if !TOP_LEVEL_KEYS.contains(&key.as_str()) {
                self.warn(format!("/{key}"), format!("unknown top-level section '{key}'"));
            }
        }

        let meta = self.meta(root)?;
        let runtime = self.runtime(root)?;
        let providers = self.providers(root)?;
        let tools = self.tools(root, &providers)?;
        let components = self.components(root, &providers, &tools)?;
        let mut histories = self.histories(root)?;
        let graph = self.graph(root, &components, &mut histories)?;
        let policies = self.policies(root, &graph)?;

        Ok(WorkflowIr {
            meta,
            runtime,
            providers,
            tools,
            components,
            histories,
            graph,
            policies,
            warnings: self.warnings,
        })
    }

    fn warn(&mut self, pointer: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(Warning::new(pointer, message));
    }

    fn meta(&mut self, root: &Map<String, Value>) -> Result<MetaIr> {
        let meta = match root.get("meta") {
            Some(v) => expect_object(v, "/meta")?,
            None => {
                return Err(EngineError::at(
                    ErrorKind::MetaVersionUnsupported,
                    "/meta",
                    "missing 'meta' section",
                ))
            }
        };

        let version = meta.get("version").and_then(Value::as_u64).ok_or_else(|| {
            EngineError::at(
                ErrorKind::MetaVersionUnsupported,
                "/meta/version",
                "meta.version must be an integer",
            )
        })?;
        if version != SUPPORTED_META_VERSION {
            return Err(EngineError::at(
                ErrorKind::MetaVersionUnsupported,
                "/meta/version",
                format!("unsupported meta.version {version}, expected {SUPPORTED_META_VERSION}"),
            ));
        }

        Ok(MetaIr {
            version,
            name: opt_string(meta, "name", "/meta")?.unwrap_or_else(|| "workflow".to_string()),
            description: opt_string(meta, "description", "/meta")?,
        })
    }

    fn runtime(&mut self, root: &Map<String, Value>) -> Result<RuntimeIr> {
        let runtime = match root.get("runtime") {
            Some(v) => expect_object(v, "/runtime")?,
            None => return Ok(RuntimeIr::default()),
        };

        let mut ir = RuntimeIr {
            engine: opt_string(runtime, "engine", "/runtime")?,
            ..RuntimeIr::default()
        };

        if let Some(defaults) = runtime.get("defaults") {
            let defaults = expect_object(defaults, "/runtime/defaults")?;
            ir.default_provider = opt_string(defaults, "provider", "/runtime/defaults")?;
        }

        if let Some(factories) = runtime.get("factories") {
            let factories = expect_object(factories, "/runtime/factories")?;
            ir.factories.providers =
                string_map(factories.get("providers"), "/runtime/factories/providers")?;
            ir.factories.tools = string_map(factories.get("tools"), "/runtime/factories/tools")?;
            ir.factories.components =
                string_map(factories.get("components"), "/runtime/factories/components")?;
        }

        if let Some(exporters) = runtime.get("exporters") {
            let list = exporters.as_array().ok_or_else(|| {
                EngineError::at(ErrorKind::DocShape, "/runtime/exporters", "expected a list")
            })?;
            ir.exporters = list.clone();
        }

        Ok(ir)
    }

    fn providers(&mut self, root: &Map<String, Value>) -> Result<BTreeMap<String, ProviderIr>> {
        let mut providers = BTreeMap::new();
        for (idx, entry) in section_entries(root, "providers")?.iter().enumerate() {
            let pointer = format!("/providers/{idx}");
            let entry = expect_object(entry, &pointer)?;
            let id = req_string(entry, "id", &pointer)?;
            let kind = req_string(entry, "type", &pointer)?;
            let config = opt_config(entry, "config", &pointer)?;

            if providers.contains_key(&id) {
                return Err(EngineError::at(
                    ErrorKind::ProviderDup,
                    format!("{pointer}/id"),
                    format!("duplicate provider id '{id}'"),
                ));
            }
            providers.insert(id.clone(), ProviderIr { id, kind, config });
        }
        Ok(providers)
    }

    fn tools(
        &mut self,
        root: &Map<String, Value>,
        providers: &BTreeMap<String, ProviderIr>,
    ) -> Result<BTreeMap<String, ToolIr>> {
        let mut tools = BTreeMap::new();
        for (idx, entry) in section_entries(root, "tools")?.iter().enumerate() {
            let pointer = format!("/tools/{idx}");
            let entry = expect_object(entry, &pointer)?;
            let id = req_string(entry, "id", &pointer)?;
            let kind = req_string(entry, "type", &pointer)?;
            let provider_ref = opt_string(entry, "provider", &pointer)?;
            let config = opt_config(entry, "config", &pointer)?;

            if let Some(provider) = &provider_ref {
                if !providers.contains_key(provider) {
                    return Err(EngineError::at(
                        ErrorKind::ToolProviderNotFound,
                        format!("{pointer}/provider"),
                        format!("tool '{id}' references unknown provider '{provider}'"),
                    ));
                }
            }

            let permissions = match entry.get("permissions") {
                None => Vec::new(),
                Some(v) => permission_list(v, &format!("{pointer}/permissions"), &id)?,
            };

            if tools.contains_key(&id) {
                return Err(EngineError::at(
                    ErrorKind::ToolDup,
                    format!("{pointer}/id"),
                    format!("duplicate tool id '{id}'"),
                ));
            }
            tools.insert(
                id.clone(),
                ToolIr {
                    id,
                    kind,
                    provider_ref,
                    permissions,
                    config,
                },
            );
        }
        Ok(tools)
    }

    fn components(
        &mut self,
        root: &Map<String, Value>,
        providers: &BTreeMap<String, ProviderIr>,
        tools: &BTreeMap<String, ToolIr>,
    ) -> Result<BTreeMap<String, ComponentIr>> {
        let mut components = BTreeMap::new();
        for (idx, entry) in section_entries(root, "components")?.iter().enumerate() {
            let pointer = format!("/components/{idx}");
            let entry = expect_object(entry, &pointer)?;
            let id = req_string(entry, "id", &pointer)?;
            let kind = req_string(entry, "type", &pointer)?;
            let provider_ref = opt_string(entry, "provider", &pointer)?;
            let tool_ref = opt_string(entry, "tool", &pointer)?;

            if let Some(provider) = &provider_ref {
                if !providers.contains_key(provider) {
                    return Err(EngineError::at(
                        ErrorKind::ComponentProviderNotFound,
                        format!("{pointer}/provider"),
                        format!("component '{id}' references unknown provider '{provider}'"),
                    ));
                }
            }
            if let Some(tool) = &tool_ref {
                if !tools.contains_key(tool) {
                    return Err(EngineError::at(
                        ErrorKind::ComponentToolNotFound,
                        format!("{pointer}/tool"),
                        format!("component '{id}' references unknown tool '{tool}'"),
                    ));
                }
            }

            let inputs = input_map(entry.get("inputs"), &format!("{pointer}/inputs"))?;
            let outputs = output_map(entry.get("outputs"), &format!("{pointer}/outputs"))?;

            if components.contains_key(&id) {
                return Err(EngineError::at(
                    ErrorKind::ComponentDup,
                    format!("{pointer}/id"),
                    format!("duplicate component id '{id}'"),
                ));
            }
            components.insert(
                id.clone(),
                ComponentIr {
                    id,
                    kind,
                    provider_ref,
                    tool_ref,
                    inputs,
                    outputs,
                    config: opt_config(entry, "config", &pointer)?,
                    defaults: opt_config(entry, "defaults", &pointer)?,
                },
            );
        }
        Ok(components)
    }

    fn histories(&mut self, root: &Map<String, Value>) -> Result<BTreeMap<String, HistoryIr>> {
        let mut histories = BTreeMap::new();
        for (idx, entry) in section_entries(root, "histories")?.iter().enumerate() {
            let pointer = format!("/histories/{idx}");
            let entry = expect_object(entry, &pointer)?;
            let id = req_string(entry, "id", &pointer)?;
            let backend = req_string(entry, "backend", &pointer)?;

            if histories.contains_key(&id) {
                return Err(EngineError::at(
                    ErrorKind::HistoryDup,
                    format!("{pointer}/id"),
                    format!("duplicate history id '{id}'"),
                ));
            }
            histories.insert(
                id.clone(),
                HistoryIr {
                    id,
                    backend,
                    config: opt_config(entry, "config", &pointer)?,
                },
            );
        }
        Ok(histories)
    }

    fn graph(
        &mut self,
        root: &Map<String, Value>,
        components: &BTreeMap<String, ComponentIr>,
        histories: &mut BTreeMap<String, HistoryIr>,
    ) -> Result<GraphIr> {
        let graph = match root.get("graph") {
            Some(v) => expect_object(v, "/graph")?,
            None => {
                return Err(EngineError::at(ErrorKind::DocShape, "/graph", "missing 'graph' section"))
            }
        };

        // Legacy inline history block: synthesize a history record unless the
        // same id is declared in `histories`, which takes precedence.
        if let Some(legacy) = graph.get("history") {
            let pointer = "/graph/history";
            let legacy = expect_object(legacy, pointer)?;
            let id = opt_string(legacy, "id", pointer)?.unwrap_or_else(|| "default".to_string());
            self.warn(
                pointer,
                format!("'graph.history' is deprecated; declare history '{id}' under 'histories'"),
            );
            if histories.contains_key(&id) {
                self.warn(
                    pointer,
                    format!("history '{id}' also declared under 'histories'; that declaration wins"),
                );
            } else {
                let backend =
                    opt_string(legacy, "backend", pointer)?.unwrap_or_else(|| "memory".to_string());
                histories.insert(
                    id.clone(),
                    HistoryIr {
                        id,
                        backend,
                        config: opt_config(legacy, "config", pointer)?,
                    },
                );
            }
        }

        let entry = req_string(graph, "entry", "/graph")?;

        let mut nodes = BTreeMap::new();
        let node_entries = match graph.get("nodes") {
            Some(Value::Array(items)) => items.as_slice(),
            Some(_) => {
                return Err(EngineError::at(ErrorKind::DocShape, "/graph/nodes", "expected a list"))
            }
            None => &[],
        };

        // Document order, for pointers in the post-parse checks below.
        let mut node_order: Vec<(usize, String)> = Vec::with_capacity(node_entries.len());
        for (idx, entry_value) in node_entries.iter().enumerate() {
            let pointer = format!("/graph/nodes/{idx}");
            let node = self.node(entry_value, &pointer, components)?;
            if nodes.contains_key(&node.id) {
                return Err(EngineError::at(
                    ErrorKind::NodeDup,
                    format!("{pointer}/id"),
                    format!("duplicate node id '{}'", node.id),
                ));
            }
            node_order.push((idx, node.id.clone()));
            nodes.insert(node.id.clone(), node);
        }

        if !nodes.contains_key(&entry) {
            return Err(EngineError::at(
                ErrorKind::GraphEntryNotFound,
                "/graph/entry",
                format!("graph entry '{entry}' is not a declared node"),
            ));
        }

        // Edge endpoints and map bodies must name declared nodes.
        for (idx, node_id) in &node_order {
            let node = &nodes[node_id];
            for target in node.next.targets() {
                if !nodes.contains_key(target) {
                    return Err(EngineError::at(
                        ErrorKind::EdgeEndpointInvalid,
                        format!("/graph/nodes/{idx}/next"),
                        format!("node '{}' routes to unknown node '{target}'", node.id),
                    ));
                }
            }
            if let Some(map) = &node.map {
                if !nodes.contains_key(&map.body) {
                    return Err(EngineError::at(
                        ErrorKind::MapBodyMissing,
                        format!("/graph/nodes/{idx}/config/body"),
                        format!("map node '{}' references unknown body node '{}'", node.id, map.body),
                    ));
                }
            }
        }

        // Reachability from the entry (map bodies are reached through their
        // map node). Unreachable nodes are legal but almost always a typo.
        let mut reachable: BTreeSet<&str> = BTreeSet::new();
        let mut pending: Vec<&str> = vec![entry.as_str()];
        while let Some(id) = pending.pop() {
            if !reachable.insert(id) {
                continue;
            }
            let node = &nodes[id];
            for target in node.next.targets() {
                pending.push(target);
            }
            if let Some(map) = &node.map {
                pending.push(map.body.as_str());
            }
        }
        for (idx, node_id) in &node_order {
            if !reachable.contains(node_id.as_str()) {
                self.warn(
                    format!("/graph/nodes/{idx}"),
                    format!("node '{node_id}' is not reachable from the graph entry"),
                );
            }
        }

        let mut outputs = Vec::new();
        let mut seen_keys = BTreeSet::new();
        if let Some(declared) = graph.get("outputs") {
            let declared = declared.as_array().ok_or_else(|| {
                EngineError::at(ErrorKind::DocShape, "/graph/outputs", "expected a list")
            })?;
            for (idx, entry) in declared.iter().enumerate() {
                let pointer = format!("/graph/outputs/{idx}");
                let entry = expect_object(entry, &pointer)?;
                let key = req_string(entry, "key", &pointer)?;
                let node_id = req_string(entry, "node", &pointer)?;
                let output_name = req_string(entry, "output", &pointer)?;

                if !seen_keys.insert(key.clone()) {
                    return Err(EngineError::at(
                        ErrorKind::OutputKeyCollision,
                        format!("{pointer}/key"),
                        format!("duplicate graph output key '{key}'"),
                    ));
                }
                if !nodes.contains_key(&node_id) {
                    return Err(EngineError::at(
                        ErrorKind::EdgeEndpointInvalid,
                        format!("{pointer}/node"),
                        format!("graph output '{key}' reads unknown node '{node_id}'"),
                    ));
                }
                outputs.push(GraphOutputIr {
                    key,
                    node_id,
                    output_name,
                });
            }
        }

        Ok(GraphIr {
            entry,
            nodes,
            outputs,
        })
    }

    fn node(
        &mut self,
        raw: &Value,
        pointer: &str,
        components: &BTreeMap<String, ComponentIr>,
    ) -> Result<NodeIr> {
        let entry = expect_object(raw, pointer)?;
        let id = req_string(entry, "id", pointer)?;
        let kind_text = req_string(entry, "kind", pointer)?;
        let kind = NodeKind::parse(&kind_text).ok_or_else(|| {
            EngineError::at(
                ErrorKind::NodeType,
                format!("{pointer}/kind"),
                format!("unknown node kind '{kind_text}'"),
            )
        })?;

        let component_ref = opt_string(entry, "component", pointer)?;
        if let Some(component) = &component_ref {
            if !components.contains_key(component) {
                return Err(EngineError::at(
                    ErrorKind::NodeComponentNotFound,
                    format!("{pointer}/component"),
                    format!("node '{id}' references unknown component '{component}'"),
                ));
            }
        }
        match kind {
            NodeKind::Llm | NodeKind::Tool | NodeKind::Component => {
                if component_ref.is_none() {
                    return Err(EngineError::at(
                        ErrorKind::NodeComponentNotFound,
                        format!("{pointer}/component"),
                        format!("{kind} node '{id}' requires a component reference"),
                    ));
                }
            }
            _ => {}
        }
        if kind == NodeKind::Tool {
            let component = component_ref.as_ref().expect("checked above");
            if components[component].tool_ref.is_none() {
                return Err(EngineError::at(
                    ErrorKind::ComponentToolNotFound,
                    format!("{pointer}/component"),
                    format!("tool node '{id}' uses component '{component}' which binds no tool"),
                ));
            }
        }

        let next = self.next_descriptor(entry.get("next"), kind, &id, pointer)?;
        let config = opt_config(entry, "config", pointer)?;
        let map = if kind == NodeKind::Map {
            Some(self.map_spec(&config, &id, pointer)?)
        } else {
            None
        };

        Ok(NodeIr {
            id,
            kind,
            component_ref,
            inputs: input_map(entry.get("inputs"), &format!("{pointer}/inputs"))?,
            outputs: output_map(entry.get("outputs"), &format!("{pointer}/outputs"))?,
            config,
            next,
            map,
        })
    }

    fn next_descriptor(
        &mut self,
        raw: Option<&Value>,
        kind: NodeKind,
        node_id: &str,
        pointer: &str,
    ) -> Result<EdgeDescriptor> {
        let pointer = format!("{pointer}/next");
        let invalid = |message: String| EngineError::at(ErrorKind::NodeNextInvalid, pointer.clone(), message);

        let descriptor = match raw {
            None | Some(Value::Null) => EdgeDescriptor::None,
            Some(Value::String(target)) => EdgeDescriptor::Single(target.clone()),
            Some(Value::Array(items)) => {
                let mut targets = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(target) => targets.push(target.to_string()),
                        None => return Err(invalid(format!("node '{node_id}': fan-out entries must be node ids"))),
                    }
                }
                EdgeDescriptor::Fanout(targets)
            }
            Some(Value::Object(routes)) => {
                let mut table = BTreeMap::new();
                for (route, target) in routes {
                    match target.as_str() {
                        Some(target) => {
                            table.insert(route.clone(), target.to_string());
                        }
                        None => return Err(invalid(format!("node '{node_id}': route targets must be node ids"))),
                    }
                }
                EdgeDescriptor::Routes(table)
            }
            Some(_) => return Err(invalid(format!("node '{node_id}': unsupported 'next' shape"))),
        };

        let shape_error = match (kind, &descriptor) {
            (NodeKind::Router, EdgeDescriptor::Routes(_)) => None,
            (NodeKind::Router, _) => Some(format!(
                "router node '{node_id}' requires a route mapping in 'next'"
            )),
            (NodeKind::Parallel, EdgeDescriptor::Fanout(_)) => None,
            (NodeKind::Parallel, _) => Some(format!(
                "parallel node '{node_id}' requires a list in 'next'"
            )),
            (_, EdgeDescriptor::Fanout(_)) => Some(format!(
                "node '{node_id}' is not a parallel node; 'next' cannot be a list"
            )),
            (_, EdgeDescriptor::Routes(_)) => Some(format!(
                "node '{node_id}' is not a router node; 'next' cannot be a mapping"
            )),
            _ => None,
        };
        match shape_error {
            Some(message) => Err(invalid(message)),
            None => Ok(descriptor),
        }
    }

    fn map_spec(&mut self, config: &Value, node_id: &str, pointer: &str) -> Result<MapSpec> {
        let config_pointer = format!("{pointer}/config");
        let config = expect_object(config, &config_pointer)?;

        let body = match config.get("body").and_then(Value::as_str) {
            Some(body) => body.to_string(),
            None => {
                return Err(EngineError::at(
                    ErrorKind::MapBodyMissing,
                    format!("{config_pointer}/body"),
                    format!("map node '{node_id}' declares no body node"),
                ))
            }
        };

        let over_raw = config.get("over").ok_or_else(|| {
            EngineError::at(
                ErrorKind::DocShape,
                format!("{config_pointer}/over"),
                format!("map node '{node_id}' declares no iteration source"),
            )
        })?;
        let over = InputExpr::parse(over_raw, &format!("{config_pointer}/over"))?;

        let concurrency = match config.get("concurrency") {
            None => 1,
            Some(v) => match v.as_u64() {
                Some(n) if n >= 1 => n as usize,
                _ => {
                    return Err(EngineError::at(
                        ErrorKind::DocShape,
                        format!("{config_pointer}/concurrency"),
                        format!("map node '{node_id}': concurrency must be an integer >= 1"),
                    ))
                }
            },
        };

        let ordered = match config.get("ordered") {
            None => true,
            Some(v) => v.as_bool().ok_or_else(|| {
                EngineError::at(
                    ErrorKind::DocShape,
                    format!("{config_pointer}/ordered"),
                    format!("map node '{node_id}': ordered must be a bool"),
                )
            })?,
        };

        let failure_mode = match config.get("failure_mode") {
            None => MapFailureMode::FailFast,
            Some(v) => v
                .as_str()
                .and_then(MapFailureMode::parse)
                .ok_or_else(|| {
                    EngineError::at(
                        ErrorKind::DocShape,
                        format!("{config_pointer}/failure_mode"),
                        format!(
                            "map node '{node_id}': failure_mode must be one of \
                             fail_fast, collect_errors, skip_failed"
                        ),
                    )
                })?,
        };

        let result_key = match config.get("result_key") {
            None => "results".to_string(),
            Some(v) => v
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| {
                    EngineError::at(
                        ErrorKind::DocShape,
                        format!("{config_pointer}/result_key"),
                        format!("map node '{node_id}': result_key must be a string"),
                    )
                })?,
        };

        Ok(MapSpec {
            body,
            over,
            concurrency,
            ordered,
            failure_mode,
            result_key,
        })
    }

    fn policies(&mut self, root: &Map<String, Value>, graph: &GraphIr) -> Result<PoliciesIr> {
        let policies = match root.get("policies") {
            Some(v) => expect_object(v, "/policies")?,
            None => return Ok(PoliciesIr::default()),
        };

        let mut ir = PoliciesIr::default();

        if let Some(retry) = policies.get("retry") {
            let retry = expect_object(retry, "/policies/retry")?;
            if let Some(default) = retry.get("default") {
                ir.retry.default = retry_spec(default, "/policies/retry/default")?;
            }
            if let Some(overrides) = retry.get("overrides") {
                let overrides = expect_object(overrides, "/policies/retry/overrides")?;
                for (node_id, spec) in overrides {
                    let pointer = format!("/policies/retry/overrides/{node_id}");
                    if !graph.nodes.contains_key(node_id) {
                        self.warn(pointer.clone(), format!("retry override for unknown node '{node_id}'"));
                    }
                    ir.retry.overrides.insert(node_id.clone(), retry_spec(spec, &pointer)?);
                }
            }
        }

        if let Some(rate) = policies.get("rate_limit") {
            let rate = expect_object(rate, "/policies/rate_limit")?;
            if let Some(providers) = rate.get("providers") {
                let providers = expect_object(providers, "/policies/rate_limit/providers")?;
                for (id, spec) in providers {
                    let pointer = format!("/policies/rate_limit/providers/{id}");
                    ir.rate_limit.providers.insert(id.clone(), rate_limit_spec(spec, &pointer)?);
                }
            }
            if let Some(nodes) = rate.get("nodes") {
                let nodes = expect_object(nodes, "/policies/rate_limit/nodes")?;
                for (id, spec) in nodes {
                    let pointer = format!("/policies/rate_limit/nodes/{id}");
                    if !graph.nodes.contains_key(id) {
                        self.warn(pointer.clone(), format!("rate limit for unknown node '{id}'"));
                    }
                    ir.rate_limit.nodes.insert(id.clone(), rate_limit_spec(spec, &pointer)?);
                }
            }
            if let Some(shared) = rate.get("shared") {
                let shared = expect_object(shared, "/policies/rate_limit/shared")?;
                for (alias, entry) in shared {
                    let pointer = format!("/policies/rate_limit/shared/{alias}");
                    let entry_map = expect_object(entry, &pointer)?;
                    let providers = match entry_map.get("providers") {
                        Some(Value::Array(items)) => items
                            .iter()
                            .map(|v| {
                                v.as_str().map(str::to_string).ok_or_else(|| {
                                    EngineError::at(
                                        ErrorKind::RlPolicyParam,
                                        format!("{pointer}/providers"),
                                        "shared limit providers must be ids",
                                    )
                                })
                            })
                            .collect::<Result<Vec<_>>>()?,
                        _ => {
                            return Err(EngineError::at(
                                ErrorKind::RlPolicyParam,
                                format!("{pointer}/providers"),
                                format!("shared limit '{alias}' must list provider ids"),
                            ))
                        }
                    };
                    ir.rate_limit.shared.insert(
                        alias.clone(),
                        SharedLimit {
                            providers,
                            spec: rate_limit_spec(entry, &pointer)?,
                        },
                    );
                }
            }
        }

        if let Some(masking) = policies.get("masking") {
            let masking = expect_object(masking, "/policies/masking")?;
            ir.masking.fields = string_list(masking.get("fields"), "/policies/masking/fields")?;
            ir.masking.diff_fields =
                string_list(masking.get("diff_fields"), "/policies/masking/diff_fields")?;
            if let Some(mask_value) = opt_string(masking, "mask_value", "/policies/masking")? {
                ir.masking.mask_value = mask_value;
            }
        }

        if let Some(permissions) = policies.get("permissions") {
            let permissions = expect_object(permissions, "/policies/permissions")?;
            ir.permissions.default_allow =
                string_list(permissions.get("default_allow"), "/policies/permissions/default_allow")?
                    .into_iter()
                    .collect();
            if let Some(by_target) = permissions.get("by_target") {
                let by_target = expect_object(by_target, "/policies/permissions/by_target")?;
                for (target, grants) in by_target {
                    let pointer = format!("/policies/permissions/by_target/{target}");
                    ir.permissions
                        .by_target
                        .insert(target.clone(), string_list(Some(grants), &pointer)?.into_iter().collect());
                }
            }
        }

        if let Some(cost) = policies.get("cost") {
            let cost = expect_object(cost, "/policies/cost")?;
            if let Some(limit) = cost.get("per_run_tokens") {
                let limit = limit.as_u64().ok_or_else(|| {
                    EngineError::at(
                        ErrorKind::DocShape,
                        "/policies/cost/per_run_tokens",
                        "per_run_tokens must be a non-negative integer",
                    )
                })?;
                ir.cost.per_run_tokens = Some(limit);
            }
        }

        Ok(ir)
    }
}

fn retry_spec(raw: &Value, pointer: &str) -> Result<RetrySpec> {
    let invalid = |message: String| EngineError::at(ErrorKind::RetryPredicate, pointer, message);
    let map = raw
        .as_object()
        .ok_or_else(|| invalid("retry policy must be a mapping".to_string()))?;

    let strategy = match map.get("strategy") {
        None => RetryStrategy::Fixed,
        Some(v) => v
            .as_str()
            .and_then(RetryStrategy::parse)
            .ok_or_else(|| invalid(format!("unknown retry strategy {v}")))?,
    };

    let max_attempts = match map.get("max_attempts") {
        None => 1,
        Some(v) => match v.as_u64() {
            Some(n) if n >= 1 => n as u32,
            _ => return Err(invalid("max_attempts must be an integer >= 1".to_string())),
        },
    };

    let interval = match map.get("interval") {
        None => 0.0,
        Some(v) => match v.as_f64() {
            Some(s) if s >= 0.0 => s,
            _ => return Err(invalid("interval must be a number >= 0".to_string())),
        },
    };

    let jitter = match map.get("jitter") {
        None => 0.0,
        Some(v) => match v.as_f64() {
            Some(s) if s >= 0.0 => s,
            _ => return Err(invalid("jitter must be a number >= 0".to_string())),
        },
    };

    Ok(RetrySpec {
        strategy,
        max_attempts,
        interval,
        jitter,
    })
}

fn rate_limit_spec(raw: &Value, pointer: &str) -> Result<RateLimitSpec> {
    let invalid = |message: String| EngineError::at(ErrorKind::RlPolicyParam, pointer, message);
    let map = raw
        .as_object()
        .ok_or_else(|| invalid("rate limit must be a mapping".to_string()))?;

    let algorithm = map
        .get("algorithm")
        .and_then(Value::as_str)
        .unwrap_or("token_bucket");

    match algorithm {
        "token_bucket" => {
            let capacity = match map.get("capacity").and_then(Value::as_u64) {
                Some(c) if c >= 1 => c as u32,
                _ => return Err(invalid("token bucket requires capacity >= 1".to_string())),
            };
            let refill_per_sec = match map.get("refill_per_sec") {
                None => 0.0,
                Some(v) => match v.as_f64() {
                    Some(r) if r >= 0.0 => r,
                    _ => return Err(invalid("refill_per_sec must be a number >= 0".to_string())),
                },
            };
            Ok(RateLimitSpec::TokenBucket {
                capacity,
                refill_per_sec,
            })
        }
        "fixed_window" => {
            let limit = match map.get("limit").and_then(Value::as_u64) {
                Some(l) if l >= 1 => l as u32,
                _ => return Err(invalid("fixed window requires limit >= 1".to_string())),
            };
            let window_secs = match map.get("window_secs").and_then(Value::as_f64) {
                Some(w) if w > 0.0 => w,
                _ => return Err(invalid("fixed window requires window_secs > 0".to_string())),
            };
            Ok(RateLimitSpec::FixedWindow { limit, window_secs })
        }
        other => Err(invalid(format!("unknown rate limit algorithm '{other}'"))),
    }
}

fn expect_object<'a>(value: &'a Value, pointer: &str) -> Result<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| EngineError::at(ErrorKind::DocShape, pointer, "expected a mapping"))
}

fn section_entries<'a>(root: &'a Map<String, Value>, key: &str) -> Result<&'a [Value]> {
    match root.get(key) {
        None => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(EngineError::at(
            ErrorKind::DocShape,
            format!("/{key}"),
            "expected a list",
        )),
    }
}

fn req_string(map: &Map<String, Value>, key: &str, pointer: &str) -> Result<String> {
    match map.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(_) => Err(EngineError::at(
            ErrorKind::DocShape,
            format!("{pointer}/{key}"),
            format!("'{key}' must be a non-empty string"),
        )),
        None => Err(EngineError::at(
            ErrorKind::DocShape,
            format!("{pointer}/{key}"),
            format!("missing required field '{key}'"),
        )),
    }
}

fn opt_string(map: &Map<String, Value>, key: &str, pointer: &str) -> Result<Option<String>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(EngineError::at(
            ErrorKind::DocShape,
            format!("{pointer}/{key}"),
            format!("'{key}' must be a string"),
        )),
    }
}

fn opt_config(map: &Map<String, Value>, key: &str, pointer: &str) -> Result<Value> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(Value::Object(Map::new())),
        Some(v @ Value::Object(_)) => Ok(v.clone()),
        Some(_) => Err(EngineError::at(
            ErrorKind::DocShape,
            format!("{pointer}/{key}"),
            format!("'{key}' must be a mapping"),
        )),
    }
}

fn string_map(value: Option<&Value>, pointer: &str) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let Some(value) = value else { return Ok(out) };
    let map = expect_object(value, pointer)?;
    for (key, entry) in map {
        let text = entry.as_str().ok_or_else(|| {
            EngineError::at(
                ErrorKind::DocShape,
                format!("{pointer}/{key}"),
                "expected a string value",
            )
        })?;
        out.insert(key.clone(), text.to_string());
    }
    Ok(out)
}

fn string_list(value: Option<&Value>, pointer: &str) -> Result<Vec<String>> {
    match value {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    EngineError::at(ErrorKind::DocShape, pointer, "expected a list of strings")
                })
            })
            .collect(),
        Some(_) => Err(EngineError::at(ErrorKind::DocShape, pointer, "expected a list")),
    }
}

fn permission_list(value: &Value, pointer: &str, tool_id: &str) -> Result<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| {
                    EngineError::at(
                        ErrorKind::PermType,
                        pointer,
                        format!("tool '{tool_id}': permissions must be strings"),
                    )
                })
            })
            .collect(),
        _ => Err(EngineError::at(
            ErrorKind::PermType,
            pointer,
            format!("tool '{tool_id}': permissions must be a list of strings"),
        )),
    }
}

fn input_map(value: Option<&Value>, pointer: &str) -> Result<BTreeMap<String, InputExpr>> {
    let mut out = BTreeMap::new();
    let Some(value) = value else { return Ok(out) };
    let map = expect_object(value, pointer)?;
    for (key, raw) in map {
        out.insert(key.clone(), InputExpr::parse(raw, &format!("{pointer}/{key}"))?);
    }
    Ok(out)
}

fn output_map(value: Option<&Value>, pointer: &str) -> Result<BTreeMap<String, OutputExpr>> {
    let mut out = BTreeMap::new();
    let Some(value) = value else { return Ok(out) };
    let map = expect_object(value, pointer)?;
    for (key, raw) in map {
        let entry_pointer = format!("{pointer}/{key}");
        let text = raw.as_str().ok_or_else(|| {
            EngineError::at(ErrorKind::DocShape, entry_pointer.clone(), "output path must be a string")
        })?;
        out.insert(key.clone(), OutputExpr::parse(text, &entry_pointer)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal_doc() -> Value {
        json!({
            "meta": {"version": 2, "name": "t"},
            "components": [
                {"id": "echo", "type": "passthrough"}
            ],
            "graph": {
                "entry": "a",
                "nodes": [
                    {"id": "a", "kind": "component", "component": "echo",
                     "outputs": {"x": "$.x"}}
                ],
                "outputs": [
                    {"key": "out", "node": "a", "output": "x"}
                ]
            }
        })
    }

    #[test]
    fn accepts_minimal_document() {
        let ir = normalize(&minimal_doc()).unwrap();
        assert_eq!(ir.meta.version, 2);
        assert_eq!(ir.graph.entry, "a");
        assert_eq!(ir.graph.outputs.len(), 1);
        assert!(ir.warnings.is_empty());
    }

    #[test]
    fn rejects_wrong_meta_version() {
        let mut doc = minimal_doc();
        doc["meta"]["version"] = json!(1);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MetaVersionUnsupported);
        assert_eq!(err.pointer.as_deref(), Some("/meta/version"));
    }

    #[test]
    fn rejects_duplicate_provider() {
        let mut doc = minimal_doc();
        doc["providers"] = json!([
            {"id": "p", "type": "a"},
            {"id": "p", "type": "b"}
        ]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderDup);
    }

    #[test]
    fn rejects_duplicate_node() {
        let mut doc = minimal_doc();
        doc["graph"]["nodes"] = json!([
            {"id": "a", "kind": "component", "component": "echo"},
            {"id": "a", "kind": "component", "component": "echo"}
        ]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeDup);
    }

    #[test]
    fn rejects_missing_entry() {
        let mut doc = minimal_doc();
        doc["graph"]["entry"] = json!("zz");
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GraphEntryNotFound);
    }

    #[test]
    fn rejects_dangling_edge() {
        let mut doc = minimal_doc();
        doc["graph"]["nodes"][0]["next"] = json!("ghost");
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::EdgeEndpointInvalid);
    }

    #[test]
    fn rejects_output_key_collision() {
        let mut doc = minimal_doc();
        doc["graph"]["outputs"] = json!([
            {"key": "out", "node": "a", "output": "x"},
            {"key": "out", "node": "a", "output": "x"}
        ]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutputKeyCollision);
    }

    #[test]
    fn rejects_router_with_scalar_next() {
        let mut doc = minimal_doc();
        doc["graph"]["nodes"] = json!([
            {"id": "a", "kind": "router", "next": "a"}
        ]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeNextInvalid);
    }

    #[test]
    fn rejects_fanout_on_non_parallel() {
        let mut doc = minimal_doc();
        doc["graph"]["nodes"] = json!([
            {"id": "a", "kind": "component", "component": "echo", "next": ["a"]}
        ]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeNextInvalid);
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut doc = minimal_doc();
        doc["graph"]["nodes"] = json!([{"id": "a", "kind": "subgraph"}]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeType);
    }

    #[test]
    fn rejects_unknown_component_reference() {
        let mut doc = minimal_doc();
        doc["graph"]["nodes"][0]["component"] = json!("ghost");
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeComponentNotFound);
    }

    #[test]
    fn rejects_tool_with_bad_permissions() {
        let mut doc = minimal_doc();
        doc["tools"] = json!([{"id": "t", "type": "http", "permissions": "net"}]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermType);
    }

    #[test]
    fn rejects_component_with_unknown_provider() {
        let mut doc = minimal_doc();
        doc["components"] = json!([
            {"id": "echo", "type": "passthrough", "provider": "nope"}
        ]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ComponentProviderNotFound);
    }

    #[test]
    fn rejects_tool_with_unknown_provider() {
        let mut doc = minimal_doc();
        doc["tools"] = json!([{"id": "t", "type": "http", "provider": "nope"}]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolProviderNotFound);
    }

    #[test]
    fn map_requires_body() {
        let mut doc = minimal_doc();
        doc["graph"]["nodes"] = json!([
            {"id": "a", "kind": "map", "config": {"over": "graph.inputs.items"}}
        ]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MapBodyMissing);
    }

    #[test]
    fn map_body_must_exist() {
        let mut doc = minimal_doc();
        doc["graph"]["nodes"] = json!([
            {"id": "a", "kind": "map",
             "config": {"body": "ghost", "over": "graph.inputs.items"}}
        ]);
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::MapBodyMissing);
    }

    #[test]
    fn map_defaults_fill_in() {
        let mut doc = minimal_doc();
        doc["components"] = json!([{"id": "echo", "type": "passthrough"}]);
        doc["graph"]["nodes"] = json!([
            {"id": "a", "kind": "map",
             "config": {"body": "b", "over": "graph.inputs.items"}},
            {"id": "b", "kind": "component", "component": "echo"}
        ]);
        let ir = normalize(&doc).unwrap();
        let map = ir.graph.nodes["a"].map.as_ref().unwrap();
        assert_eq!(map.concurrency, 1);
        assert!(map.ordered);
        assert_eq!(map.failure_mode, MapFailureMode::FailFast);
        assert_eq!(map.result_key, "results");
    }

    #[test]
    fn legacy_history_block_synthesizes_record() {
        let mut doc = minimal_doc();
        doc["graph"]["history"] = json!({"id": "chat", "backend": "memory"});
        let ir = normalize(&doc).unwrap();
        assert!(ir.histories.contains_key("chat"));
        assert!(ir.warnings.iter().any(|w| w.message.contains("deprecated")));
    }

    #[test]
    fn declared_history_wins_over_legacy() {
        let mut doc = minimal_doc();
        doc["histories"] = json!([{"id": "chat", "backend": "redis"}]);
        doc["graph"]["history"] = json!({"id": "chat", "backend": "memory"});
        let ir = normalize(&doc).unwrap();
        assert_eq!(ir.histories["chat"].backend, "redis");
        assert!(ir.warnings.iter().any(|w| w.message.contains("wins")));
    }

    #[test]
    fn rejects_bad_retry_strategy() {
        let mut doc = minimal_doc();
        doc["policies"] = json!({"retry": {"default": {"strategy": "cubic"}}});
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RetryPredicate);
    }

    #[test]
    fn rejects_zero_attempt_retry() {
        let mut doc = minimal_doc();
        doc["policies"] = json!({"retry": {"default": {"max_attempts": 0}}});
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RetryPredicate);
    }

    #[test]
    fn rejects_bad_rate_limit_params() {
        let mut doc = minimal_doc();
        doc["policies"] = json!({"rate_limit": {"providers": {"p": {"algorithm": "leaky"}}}});
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RlPolicyParam);

        doc["policies"] = json!({"rate_limit": {"providers": {"p": {"capacity": 0}}}});
        let err = normalize(&doc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RlPolicyParam);
    }

    #[test]
    fn unreachable_node_warns() {
        let mut doc = minimal_doc();
        doc["graph"]["nodes"] = json!([
            {"id": "a", "kind": "component", "component": "echo"},
            {"id": "orphan", "kind": "component", "component": "echo"}
        ]);
        let ir = normalize(&doc).unwrap();
        assert!(ir
            .warnings
            .iter()
            .any(|w| w.message.contains("'orphan' is not reachable")));
    }

    #[test]
    fn map_body_counts_as_reachable() {
        let mut doc = minimal_doc();
        doc["graph"]["nodes"] = json!([
            {"id": "a", "kind": "map",
             "config": {"body": "b", "over": "graph.inputs.items"}},
            {"id": "b", "kind": "component", "component": "echo"}
        ]);
        let ir = normalize(&doc).unwrap();
        assert!(ir.warnings.iter().all(|w| !w.message.contains("reachable")));
    }

    #[test]
    fn unknown_top_level_key_warns() {
        let mut doc = minimal_doc();
        doc["extras"] = json!({});
        let ir = normalize(&doc).unwrap();
        assert!(ir.warnings.iter().any(|w| w.pointer == "/extras"));
    }

    #[test]
    fn policies_parse_fully() {
        let mut doc = minimal_doc();
        doc["providers"] = json!([{"id": "p", "type": "openai"}]);
        doc["policies"] = json!({
            "retry": {
                "default": {"strategy": "exponential", "max_attempts": 3, "interval": 0.5},
                "overrides": {"a": {"strategy": "jitter", "max_attempts": 2, "interval": 1.0, "jitter": 0.5}}
            },
            "rate_limit": {
                "providers": {"p": {"capacity": 5, "refill_per_sec": 2.0}},
                "nodes": {"a": {"algorithm": "fixed_window", "limit": 10, "window_secs": 60}},
                "shared": {"acct": {"providers": ["p"], "capacity": 3, "refill_per_sec": 1.0}}
            },
            "masking": {"fields": ["outputs.secret"], "diff_fields": ["outputs.token"], "mask_value": "###"},
            "permissions": {"default_allow": ["net"], "by_target": {"a": ["fs"]}},
            "cost": {"per_run_tokens": 1000}
        });
        let ir = normalize(&doc).unwrap();

        assert_eq!(ir.policies.retry.for_node("a").max_attempts, 2);
        assert_eq!(ir.policies.retry.for_node("b").max_attempts, 3);
        assert!(matches!(
            ir.policies.rate_limit.nodes["a"],
            RateLimitSpec::FixedWindow { limit: 10, .. }
        ));
        assert_eq!(ir.policies.rate_limit.shared["acct"].providers, vec!["p"]);
        assert_eq!(ir.policies.masking.mask_value, "###");
        assert!(ir.policies.permissions.default_allow.contains("net"));
        assert_eq!(ir.policies.cost.per_run_tokens, Some(1000));
    }
}
