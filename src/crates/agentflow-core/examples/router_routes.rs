//! Conditional routing: the router reads its `route` input and the graph
//! follows the matching branch. Run with `cargo run --example router_routes`.

use std::sync::Arc;

use serde_json::json;

use agentflow_core::registry::ComponentDeps;
use agentflow_core::{ComponentFn, ConsoleExporter, FactorySet, WorkflowEngine};

const DOC: &str = r#"
meta:
  version: 2
  name: router-demo
components:
  - id: shout
    type: say
    config: {phrase: "LOUD AND CLEAR"}
  - id: whisper
    type: say
    config: {phrase: "barely audible"}
graph:
  entry: r
  nodes:
    - id: r
      kind: router
      inputs: {route: graph.inputs.mode}
      next:
        loud: a
        default: b
    - id: a
      kind: component
      component: shout
      outputs: {phrase: $.phrase}
    - id: b
      kind: component
      component: whisper
      outputs: {phrase: $.phrase}
"#;

#[tokio::main]
async fn main() -> agentflow_core::Result<()> {
    tooling::logging::init();

    let mut factories = FactorySet::new();
    factories.register_component("say", |spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
        let phrase = spec
            .config
            .get("phrase")
            .cloned()
            .unwrap_or_else(|| json!("..."));
        Ok(ComponentFn::boxed_any(ComponentFn::new(
            move |_state, _inputs, _ctx| {
                let phrase = phrase.clone();
                async move { Ok(json!({"phrase": phrase})) }
            },
        )))
    });

    let engine =
        WorkflowEngine::from_yaml(DOC, factories)?.with_exporter(Arc::new(ConsoleExporter));

    for mode in ["loud", "anything-else"] {
        let result = engine.run(json!({"mode": mode})).await;
        println!("mode={mode} -> {}", result.node_outputs);
    }

    engine.close().await;
    Ok(())
}
