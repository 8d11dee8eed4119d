//! Engine façade
//!
//! Ties the pipeline together: normalize a document, materialize instances
//! through the registered factories, compile the graph, and execute runs.
//! One engine serves any number of runs; materialized instances live for the
//! engine's lifetime and their `close` hooks fire once at teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::build::{ExecutableGraph, GraphBuilder};
use crate::document;
use crate::error::Result;
use crate::event::EventExporter;
use crate::ir::{Warning, WorkflowIr};
use crate::normalize::normalize;
use crate::registry::{FactorySet, Resolver};
use crate::runtime::{Registries, RunOptions, RunResult};
use crate::scheduler::GraphRunner;

/// A compiled workflow ready to execute.
pub struct WorkflowEngine {
    graph: Arc<ExecutableGraph>,
    resolver: Arc<Resolver>,
    registries: Arc<Registries>,
    exporters: Vec<Arc<dyn EventExporter>>,
    closed: AtomicBool,
}

impl WorkflowEngine {
    /// Build an engine from a raw document tree.
    pub fn from_document(doc: &Value, factories: FactorySet) -> Result<Self> {
        Self::from_ir(Arc::new(normalize(doc)?), factories)
    }

    /// Build an engine from YAML text.
    pub fn from_yaml(text: &str, factories: FactorySet) -> Result<Self> {
        Self::from_document(&document::from_yaml_str(text)?, factories)
    }

    /// Build an engine from an already-normalized IR.
    pub fn from_ir(ir: Arc<WorkflowIr>, factories: FactorySet) -> Result<Self> {
        let resolver = Arc::new(Resolver::new(ir, factories));
        let graph = Arc::new(GraphBuilder::new(resolver.clone()).build()?);
        let histories = resolver.histories()?;
        let registries = Arc::new(Registries::new(resolver.clone(), histories));

        Ok(Self {
            graph,
            resolver,
            registries,
            exporters: Vec::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Attach an event exporter; exporters see every run's full stream.
    pub fn with_exporter(mut self, exporter: Arc<dyn EventExporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    pub fn ir(&self) -> &Arc<WorkflowIr> {
        self.graph.ir()
    }

    /// Validation warnings collected at normalization.
    pub fn warnings(&self) -> &[Warning] {
        &self.graph.ir().warnings
    }

    pub fn graph(&self) -> &Arc<ExecutableGraph> {
        &self.graph
    }

    /// Declared types with no registered factory; empty when every record
    /// can materialize.
    pub fn missing_bindings(&self) -> Vec<Warning> {
        self.resolver.missing_bindings()
    }

    /// Render the graph structure (DOT, Mermaid, or ASCII).
    pub fn render(&self, options: &crate::visualization::RenderOptions) -> String {
        crate::visualization::render(self.graph.ir(), options)
    }

    /// Execute once with default options.
    pub async fn run(&self, inputs: Value) -> RunResult {
        self.run_with(inputs, RunOptions::default()).await
    }

    /// Execute once with explicit options.
    pub async fn run_with(&self, inputs: Value, options: RunOptions) -> RunResult {
        let runner = GraphRunner::new(
            self.graph.clone(),
            self.registries.clone(),
            self.exporters.clone(),
        );
        tooling::logging::timed("workflow.run", runner.run(inputs, options)).await
    }

    /// Tear the engine down, running each materialized component's `close`
    /// hook exactly once. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for component in self.resolver.materialized_components() {
            component.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ComponentDeps, ComponentFn, Component};
    use crate::runtime::CallContext;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const DOC: &str = r#"
meta:
  version: 2
  name: demo
components:
  - id: echo
    type: echo
graph:
  entry: a
  nodes:
    - id: a
      kind: component
      component: echo
      inputs:
        x: graph.inputs.x
      outputs:
        x: $.x
  outputs:
    - key: result
      node: a
      output: x
"#;

    fn echo_factories() -> FactorySet {
        let mut factories = FactorySet::new();
        factories.register_component("echo", |_spec: &crate::ir::ComponentIr, _deps: ComponentDeps| {
            Ok(ComponentFn::boxed_any(ComponentFn::new(
                |_state, inputs, _ctx| async move { Ok(inputs) },
            )))
        });
        factories
    }

    #[tokio::test]
    async fn yaml_to_run_round_trip() {
        let engine = WorkflowEngine::from_yaml(DOC, echo_factories()).unwrap();
        let result = engine.run(json!({"x": 41})).await;

        assert!(result.is_success());
        assert_eq!(result.outputs["result"], 41);
        assert_eq!(result.node_outputs["a"]["x"], 41);
    }

    #[tokio::test]
    async fn close_runs_hooks_exactly_once() {
        struct Closing(Arc<AtomicUsize>);

        #[async_trait]
        impl Component for Closing {
            async fn call(&self, _state: &Value, inputs: Value, _ctx: &CallContext) -> Result<Value> {
                Ok(inputs)
            }
            async fn close(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let closes = Arc::new(AtomicUsize::new(0));
        let closes_in_factory = closes.clone();
        let mut factories = FactorySet::new();
        factories.register_component("echo", move |_spec: &crate::ir::ComponentIr, _deps: ComponentDeps| {
            let instance: Arc<dyn Component> = Arc::new(Closing(closes_in_factory.clone()));
            Ok(ComponentFn::boxed_any(instance))
        });

        let engine = WorkflowEngine::from_yaml(DOC, factories).unwrap();
        engine.run(json!({"x": 1})).await;
        engine.close().await;
        engine.close().await;

        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
