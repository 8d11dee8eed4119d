//! Map iteration: square every input element with bounded concurrency,
//! collecting errors instead of failing the run.
//! Run with `cargo run --example map_items`.

use std::sync::Arc;

use serde_json::{json, Value};

use agentflow_core::registry::ComponentDeps;
use agentflow_core::{ComponentFn, ConsoleExporter, EngineError, ErrorKind, FactorySet, WorkflowEngine};

const DOC: &str = r#"
meta:
  version: 2
  name: map-demo
components:
  - id: square
    type: square
graph:
  entry: m
  nodes:
    - id: m
      kind: map
      config:
        body: body
        over: graph.inputs.numbers
        concurrency: 2
        ordered: true
        failure_mode: collect_errors
      outputs: {results: $.results}
    - id: body
      kind: component
      component: square
      inputs: {n: node.m.current_item}
      outputs: {squared: $.squared}
  outputs:
    - {key: results, node: m, output: results}
"#;

#[tokio::main]
async fn main() -> agentflow_core::Result<()> {
    tooling::logging::init();

    let mut factories = FactorySet::new();
    factories.register_component("square", |_spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
        Ok(ComponentFn::boxed_any(ComponentFn::new(
            |_state, inputs, _ctx| async move {
                let n = inputs.get("n").and_then(Value::as_i64).ok_or_else(|| {
                    EngineError::new(ErrorKind::NodeRuntime, "element is not a number")
                })?;
                Ok(json!({"squared": n * n}))
            },
        )))
    });

    let engine =
        WorkflowEngine::from_yaml(DOC, factories)?.with_exporter(Arc::new(ConsoleExporter));

    let result = engine
        .run(json!({"numbers": [1, 2, "three", 4]}))
        .await;

    println!("status:  {:?}", result.status);
    println!("results: {}", result.outputs["results"]);

    engine.close().await;
    Ok(())
}
