//! Two-node chain: a constant feeds an incrementer, the graph publishes the
//! result. Run with `cargo run --example simple_chain`.

use std::sync::Arc;

use serde_json::{json, Value};

use agentflow_core::registry::ComponentDeps;
use agentflow_core::{ComponentFn, ConsoleExporter, FactorySet, WorkflowEngine};

const DOC: &str = r#"
meta:
  version: 2
  name: simple-chain
components:
  - id: seed
    type: seed
  - id: bump
    type: bump
graph:
  entry: a
  nodes:
    - id: a
      kind: component
      component: seed
      outputs: {x: $.x}
      next: b
    - id: b
      kind: component
      component: bump
      inputs: {x: node.a.x}
      outputs: {y: $.y}
  outputs:
    - {key: out, node: b, output: y}
"#;

#[tokio::main]
async fn main() -> agentflow_core::Result<()> {
    tooling::logging::init();

    let mut factories = FactorySet::new();
    factories.register_component("seed", |_spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
        Ok(ComponentFn::boxed_any(ComponentFn::new(
            |_state, _inputs, _ctx| async move { Ok(json!({"x": 7})) },
        )))
    });
    factories.register_component("bump", |_spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
        Ok(ComponentFn::boxed_any(ComponentFn::new(
            |_state, inputs, _ctx| async move {
                let x = inputs.get("x").and_then(Value::as_i64).unwrap_or(0);
                Ok(json!({"y": x + 1}))
            },
        )))
    });

    let engine =
        WorkflowEngine::from_yaml(DOC, factories)?.with_exporter(Arc::new(ConsoleExporter));
    let result = engine.run(json!({})).await;

    println!("status:  {:?}", result.status);
    println!("outputs: {}", result.outputs);

    engine.close().await;
    Ok(())
}
