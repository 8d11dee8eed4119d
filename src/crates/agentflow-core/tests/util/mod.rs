//! Shared helpers for the scenario tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use agentflow_core::registry::{ComponentDeps, ProviderHandle, ToolFn};
use agentflow_core::runtime::CallContext;
use agentflow_core::{
    CollectingExporter, Component, ComponentFn, EngineError, ErrorKind, Event, FactorySet, Result,
    WorkflowEngine,
};

/// Fails its first `fail_times` calls with an HTTP 429, then succeeds with a
/// fixed LLM-ish payload.
struct Flaky {
    fail_times: u64,
    calls: AtomicUsize,
}

#[async_trait]
impl Component for Flaky {
    async fn call(&self, _state: &Value, _inputs: Value, _ctx: &CallContext) -> Result<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as u64;
        if call < self.fail_times {
            return Err(
                EngineError::new(ErrorKind::NodeRuntime, "upstream rate limited").with_status(429),
            );
        }
        Ok(json!({
            "text": "ok",
            "usage": {"tokens_in": 3, "tokens_out": 5},
        }))
    }
}

/// A factory set covering the component shapes the scenarios need.
pub fn scenario_factories() -> FactorySet {
    let mut factories = FactorySet::new();

    factories.register_provider("mock", |_spec: &agentflow_core::ir::ProviderIr| {
        Ok(Arc::new("mock-client".to_string()) as ProviderHandle)
    });

    // Returns the literal value from its component config.
    factories.register_component(
        "static",
        |spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
            let value = spec.config.get("value").cloned().unwrap_or_else(|| json!({}));
            Ok(ComponentFn::boxed_any(ComponentFn::new(
                move |_state, _inputs, _ctx| {
                    let value = value.clone();
                    async move { Ok(value) }
                },
            )))
        },
    );

    // Echoes its resolved inputs.
    factories.register_component(
        "echo",
        |_spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
            Ok(ComponentFn::boxed_any(ComponentFn::new(
                |_state, inputs, _ctx| async move { Ok(inputs) },
            )))
        },
    );

    // Reads `x`, returns `{y: x + 1}`.
    factories.register_component(
        "incr",
        |_spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
            Ok(ComponentFn::boxed_any(ComponentFn::new(
                |_state, inputs, _ctx| async move {
                    let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!({"y": x + 1}))
                },
            )))
        },
    );

    // Multiplies `item` by ten, failing on the value in config `fail_on`.
    factories.register_component(
        "times_ten",
        |spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
            let fail_on = spec.config.get("fail_on").cloned().unwrap_or(Value::Null);
            Ok(ComponentFn::boxed_any(ComponentFn::new(
                move |_state, inputs, _ctx| {
                    let fail_on = fail_on.clone();
                    async move {
                        let item = inputs.get("item").cloned().unwrap_or(Value::Null);
                        if item == fail_on {
                            return Err(EngineError::new(
                                ErrorKind::NodeRuntime,
                                format!("element {item} is not processable"),
                            ));
                        }
                        let n = item.as_i64().unwrap_or(0);
                        Ok(json!({"val": n * 10}))
                    }
                },
            )))
        },
    );

    // Flaky LLM: fails `fail_times` calls with 429, then succeeds.
    factories.register_component(
        "flaky",
        |spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
            let fail_times = spec
                .config
                .get("fail_times")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let instance: Arc<dyn Component> = Arc::new(Flaky {
                fail_times,
                calls: AtomicUsize::new(0),
            });
            Ok(ComponentFn::boxed_any(instance))
        },
    );

    // Sleeps for config `seconds` before answering.
    factories.register_component(
        "sleeper",
        |spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
            let seconds = spec
                .config
                .get("seconds")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            Ok(ComponentFn::boxed_any(ComponentFn::new(
                move |_state, _inputs, _ctx| async move {
                    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                    Ok(json!({"woke": true}))
                },
            )))
        },
    );

    // A do-nothing tool.
    factories.register_tool(
        "noop_tool",
        |_spec: &agentflow_core::ir::ToolIr, _provider: Option<ProviderHandle>| {
            Ok(ToolFn::boxed_any(ToolFn::new(
                Vec::new(),
                |_state, inputs, _ctx| async move { Ok(inputs) },
            )))
        },
    );

    factories
}

/// Engine + collecting sink for a YAML document.
pub fn engine_with_sink(doc: &str) -> (WorkflowEngine, Arc<CollectingExporter>) {
    engine_with_factories(doc, scenario_factories())
}

pub fn engine_with_factories(
    doc: &str,
    factories: FactorySet,
) -> (WorkflowEngine, Arc<CollectingExporter>) {
    let sink = CollectingExporter::new();
    let engine = WorkflowEngine::from_yaml(doc, factories)
        .expect("document should build")
        .with_exporter(sink.clone());
    (engine, sink)
}

pub fn event_names(events: &[Event]) -> Vec<String> {
    events.iter().map(|e| e.event.clone()).collect()
}

/// Sequence numbers must be strictly increasing, `graph.start` first,
/// `graph.finish` last.
pub fn assert_stream_invariants(events: &[Event]) {
    assert!(!events.is_empty(), "a run must emit events");
    assert_eq!(events.first().unwrap().event, "graph.start");
    assert_eq!(events.last().unwrap().event, "graph.finish");
    for window in events.windows(2) {
        assert!(
            window[1].sequence > window[0].sequence,
            "sequence must be strictly increasing"
        );
    }
}

/// Every node.start has a matching node.finish per node id.
pub fn assert_start_finish_balance(events: &[Event]) {
    use std::collections::HashMap;
    let mut starts: HashMap<String, usize> = HashMap::new();
    let mut finishes: HashMap<String, usize> = HashMap::new();
    for event in events {
        let node_id = event.data.get("node_id").and_then(Value::as_str);
        match (event.event.as_str(), node_id) {
            ("node.start", Some(id)) => *starts.entry(id.to_string()).or_default() += 1,
            ("node.finish", Some(id)) => *finishes.entry(id.to_string()).or_default() += 1,
            _ => {}
        }
    }
    assert_eq!(starts, finishes, "node.start / node.finish must balance");
}
