//! # agentflow-core - Graph execution engine for declarative AI workflows
//!
//! Compiles a YAML description of an AI workflow into a directed graph of
//! typed nodes and executes it with concurrency, cancellation, retry, rate
//! limiting, cost accounting, masking, and an ordered telemetry stream.
//!
//! ## Pipeline
//!
//! ```text
//! YAML text ──► raw document ──► WorkflowIr ──► ExecutableGraph ──► RunResult
//!   document::from_yaml_str  normalize()    GraphBuilder        GraphRunner
//! ```
//!
//! - **Normalizer** validates structure and references, fills defaults, and
//!   produces the immutable IR plus a warning list.
//! - **Resolver** materializes providers, tools, and components through
//!   host-registered factories, lazily and memoized per id.
//! - **Graph builder** compiles one executor per node, wired with its input
//!   and output expressions, its edge descriptor, and its policy stack
//!   (permissions → cost → rate limit → retry → masking-on-emit → executor).
//! - **Scheduler** drives the frontier: sequential chains, parallel bursts,
//!   conditional routing, map iteration, cancellation, and deadlines.
//! - **Event bus** assigns every event a sequence number, masks its payload,
//!   and fans it out to the registered exporters.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use agentflow_core::{ComponentFn, FactorySet, WorkflowEngine};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> agentflow_core::Result<()> {
//!     let mut factories = FactorySet::new();
//!     factories.register_component("uppercase", |_spec, _deps| {
//!         Ok(ComponentFn::boxed_any(ComponentFn::new(
//!             |_state, inputs, _ctx| async move {
//!                 let text = inputs["text"].as_str().unwrap_or_default();
//!                 Ok(json!({ "text": text.to_uppercase() }))
//!             },
//!         )))
//!     });
//!
//!     let engine = WorkflowEngine::from_yaml(DOC, factories)?;
//!     let result = engine.run(json!({"question": "hello"})).await;
//!     println!("{}", result.outputs);
//!     engine.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module organization
//!
//! - [`document`] - YAML loading into the raw value tree
//! - [`normalize`] - document validation into [`ir::WorkflowIr`]
//! - [`ir`] - the typed intermediate representation
//! - [`expr`] - input references and restricted JSONPath outputs
//! - [`registry`] - factories and instance materialization
//! - [`build`] - graph compilation into executors
//! - [`scheduler`] - the run loop
//! - [`policy`] - retry, rate limit, permissions, cost
//! - [`event`] - the ordered, masked event bus
//! - [`visualization`] - DOT/Mermaid/ASCII graph rendering
//! - [`mask`] - payload masking rules
//! - [`history`] - pluggable conversation history backends
//! - [`runtime`] - run context, state, options, results
//! - [`engine`] - the [`WorkflowEngine`] façade
//! - [`error`] - the stable error-kind taxonomy

pub mod build;
pub mod document;
pub mod engine;
pub mod error;
pub mod event;
pub mod expr;
pub mod history;
pub mod ir;
pub mod mask;
pub mod normalize;
pub mod policy;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod visualization;

pub use build::{ExecutableGraph, GraphBuilder};
pub use engine::WorkflowEngine;
pub use error::{EngineError, ErrorKind, Result};
pub use event::{
    CollectingExporter, ConsoleExporter, Event, EventBus, EventExporter, EventPayload,
    JsonlExporter, RunStatus,
};
pub use expr::{InputExpr, OutputExpr};
pub use history::{ChatMessage, HistoryBackend, HistoryHandle, MemoryHistory};
pub use ir::{
    EdgeDescriptor, MapFailureMode, NodeKind, RetryStrategy, Warning, WorkflowIr,
};
pub use mask::Masker;
pub use normalize::normalize;
pub use registry::{
    Component, ComponentDeps, ComponentFactory, ComponentFn, FactorySet, HistoryFactory,
    ProviderFactory, ProviderHandle, Resolver, Tool, ToolFactory, ToolFn,
};
pub use runtime::{CallContext, Registries, RunContext, RunOptions, RunResult, StateView};
pub use scheduler::GraphRunner;
pub use visualization::{render, RenderFormat, RenderOptions};
