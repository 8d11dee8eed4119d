//! Factories and instance materialization
//!
//! Provider, tool, and component declarations are materialized through
//! externally supplied factories keyed by each record's `type`. The core
//! never interprets what a factory returns beyond the contracts below:
//! providers are fully opaque handles, tools and components are callables
//! with the `(state, inputs, ctx) -> mapping` shape. Materialization is lazy
//! and memoized per id.
//!
//! Factories hand back their callable as `Box<dyn Any>` holding an
//! `Arc<dyn Component>` / `Arc<dyn Tool>`; a factory that returns anything
//! else fails the build with `SIGNATURE_MISMATCH` naming the offending id.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{EngineError, ErrorKind, Result};
use crate::history::{HistoryHandle, MemoryHistory};
use crate::ir::{ComponentIr, HistoryIr, ProviderIr, ToolIr, Warning, WorkflowIr};
use crate::runtime::CallContext;

/// An opaque materialized provider.
pub type ProviderHandle = Arc<dyn Any + Send + Sync>;

/// A materialized tool: a callable, optionally gated by permissions.
#[async_trait]
pub trait Tool: Send + Sync {
    async fn call(&self, state: &Value, inputs: Value, ctx: &CallContext) -> Result<Value>;

    /// Permission strings this tool demands beyond its declaration.
    fn permissions(&self) -> Vec<String> {
        Vec::new()
    }
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Tool").finish()
    }
}

/// A materialized component: the callable bound to graph nodes.
///
/// The optional hooks default to no-ops; the builder wires whichever ones an
/// implementation overrides. `close` runs once at engine teardown, `on_error`
/// on the final failure (or cancellation) of an invocation.
#[async_trait]
pub trait Component: Send + Sync {
    async fn call(&self, state: &Value, inputs: Value, ctx: &CallContext) -> Result<Value>;

    async fn before_execute(&self, _ctx: &CallContext) -> Result<()> {
        Ok(())
    }

    async fn after_execute(&self, _ctx: &CallContext, _outputs: &Value) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, _ctx: &CallContext, _error: &EngineError) {}

    async fn close(&self) {}
}

/// Dependencies handed to a component factory: the already-resolved provider
/// and tool instances its declaration references.
pub struct ComponentDeps {
    pub provider: Option<ProviderHandle>,
    pub tool: Option<Arc<dyn Tool>>,
}

pub trait ProviderFactory: Send + Sync {
    fn create(&self, spec: &ProviderIr) -> Result<ProviderHandle>;
}

pub trait ToolFactory: Send + Sync {
    fn create(&self, spec: &ToolIr, provider: Option<ProviderHandle>) -> Result<Box<dyn Any + Send + Sync>>;
}

pub trait ComponentFactory: Send + Sync {
    fn create(&self, spec: &ComponentIr, deps: ComponentDeps) -> Result<Box<dyn Any + Send + Sync>>;
}

pub trait HistoryFactory: Send + Sync {
    fn create(&self, spec: &HistoryIr) -> Result<HistoryHandle>;
}

impl<F> HistoryFactory for F
where
    F: Fn(&HistoryIr) -> Result<HistoryHandle> + Send + Sync,
{
    fn create(&self, spec: &HistoryIr) -> Result<HistoryHandle> {
        self(spec)
    }
}

impl<F> ProviderFactory for F
where
    F: Fn(&ProviderIr) -> Result<ProviderHandle> + Send + Sync,
{
    fn create(&self, spec: &ProviderIr) -> Result<ProviderHandle> {
        self(spec)
    }
}

impl<F> ToolFactory for F
where
    F: Fn(&ToolIr, Option<ProviderHandle>) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync,
{
    fn create(&self, spec: &ToolIr, provider: Option<ProviderHandle>) -> Result<Box<dyn Any + Send + Sync>> {
        self(spec, provider)
    }
}

impl<F> ComponentFactory for F
where
    F: Fn(&ComponentIr, ComponentDeps) -> Result<Box<dyn Any + Send + Sync>> + Send + Sync,
{
    fn create(&self, spec: &ComponentIr, deps: ComponentDeps) -> Result<Box<dyn Any + Send + Sync>> {
        self(spec, deps)
    }
}

/// Factory registrations, keyed by record `type`.
///
/// The `memory` history backend is registered out of the box.
pub struct FactorySet {
    providers: HashMap<String, Arc<dyn ProviderFactory>>,
    tools: HashMap<String, Arc<dyn ToolFactory>>,
    components: HashMap<String, Arc<dyn ComponentFactory>>,
    histories: HashMap<String, Arc<dyn HistoryFactory>>,
}

impl Default for FactorySet {
    fn default() -> Self {
        let mut set = Self {
            providers: HashMap::new(),
            tools: HashMap::new(),
            components: HashMap::new(),
            histories: HashMap::new(),
        };
        set.register_history("memory", |_spec: &HistoryIr| {
            Ok(Arc::new(MemoryHistory::new()) as HistoryHandle)
        });
        set
    }
}

impl FactorySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_provider(&mut self, type_name: impl Into<String>, factory: impl ProviderFactory + 'static) -> &mut Self {
        self.providers.insert(type_name.into(), Arc::new(factory));
        self
    }

    pub fn register_tool(&mut self, type_name: impl Into<String>, factory: impl ToolFactory + 'static) -> &mut Self {
        self.tools.insert(type_name.into(), Arc::new(factory));
        self
    }

    pub fn register_component(&mut self, type_name: impl Into<String>, factory: impl ComponentFactory + 'static) -> &mut Self {
        self.components.insert(type_name.into(), Arc::new(factory));
        self
    }

    pub fn register_history(&mut self, type_name: impl Into<String>, factory: impl HistoryFactory + 'static) -> &mut Self {
        self.histories.insert(type_name.into(), Arc::new(factory));
        self
    }
}

/// A component instance plus the resolved identities around it.
#[derive(Clone)]
pub struct ResolvedComponent {
    pub id: String,
    pub instance: Arc<dyn Component>,
    pub provider_id: Option<String>,
    pub tool_id: Option<String>,
    /// Permission strings demanded by the bound tool (declaration plus
    /// instance), empty when no tool is bound.
    pub required_permissions: Vec<String>,
}

impl std::fmt::Debug for ResolvedComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedComponent")
            .field("id", &self.id)
            .field("provider_id", &self.provider_id)
            .field("tool_id", &self.tool_id)
            .field("required_permissions", &self.required_permissions)
            .finish()
    }
}

/// Lazy, memoizing resolver over the declared records.
pub struct Resolver {
    ir: Arc<WorkflowIr>,
    factories: FactorySet,
    providers: Mutex<HashMap<String, ProviderHandle>>,
    tools: Mutex<HashMap<String, (Arc<dyn Tool>, Vec<String>)>>,
    components: Mutex<HashMap<String, ResolvedComponent>>,
}

impl Resolver {
    pub fn new(ir: Arc<WorkflowIr>, factories: FactorySet) -> Self {
        Self {
            ir,
            factories,
            providers: Mutex::new(HashMap::new()),
            tools: Mutex::new(HashMap::new()),
            components: Mutex::new(HashMap::new()),
        }
    }

    pub fn ir(&self) -> &WorkflowIr {
        &self.ir
    }

    /// Materialize (or fetch the cached) provider handle.
    pub fn provider(&self, id: &str) -> Result<ProviderHandle> {
        if let Some(handle) = self.providers.lock().get(id) {
            return Ok(handle.clone());
        }

        let spec = self.ir.providers.get(id).ok_or_else(|| {
            EngineError::new(ErrorKind::ProviderMissing, format!("provider '{id}' is not declared"))
        })?;
        let factory = self.factories.providers.get(&spec.kind).ok_or_else(|| {
            EngineError::new(
                ErrorKind::ProviderMissing,
                format!("no factory registered for provider type '{}'", spec.kind),
            )
        })?;
        let handle = factory.create(spec)?;

        self.providers.lock().insert(id.to_string(), handle.clone());
        Ok(handle)
    }

    /// Materialize (or fetch the cached) tool and its permission demands.
    pub fn tool(&self, id: &str) -> Result<(Arc<dyn Tool>, Vec<String>)> {
        if let Some(entry) = self.tools.lock().get(id) {
            return Ok(entry.clone());
        }

        let spec = self.ir.tools.get(id).ok_or_else(|| {
            EngineError::new(ErrorKind::ToolImport, format!("tool '{id}' is not declared"))
        })?;
        let factory = self.factories.tools.get(&spec.kind).ok_or_else(|| {
            EngineError::new(
                ErrorKind::ToolImport,
                format!("no factory registered for tool type '{}'", spec.kind),
            )
        })?;
        let provider = match &spec.provider_ref {
            Some(provider_id) => Some(self.provider(provider_id)?),
            None => None,
        };
        let instance = downcast_tool(factory.create(spec, provider)?, id)?;

        let mut permissions = spec.permissions.clone();
        for extra in instance.permissions() {
            if !permissions.contains(&extra) {
                permissions.push(extra);
            }
        }

        let entry = (instance, permissions);
        self.tools.lock().insert(id.to_string(), entry.clone());
        Ok(entry)
    }

    /// Materialize (or fetch the cached) component.
    pub fn component(&self, id: &str) -> Result<ResolvedComponent> {
        if let Some(resolved) = self.components.lock().get(id) {
            return Ok(resolved.clone());
        }

        let spec = self.ir.components.get(id).ok_or_else(|| {
            EngineError::new(ErrorKind::ComponentImport, format!("component '{id}' is not declared"))
        })?;
        let factory = self.factories.components.get(&spec.kind).ok_or_else(|| {
            EngineError::new(
                ErrorKind::ComponentImport,
                format!("no factory registered for component type '{}'", spec.kind),
            )
        })?;

        let provider_id = spec
            .provider_ref
            .clone()
            .or_else(|| self.ir.runtime.default_provider.clone());
        // Materialize from the resolved id, so a component leaning on
        // runtime.defaults.provider receives the handle too.
        let provider = match provider_id.as_deref() {
            Some(id) => Some(self.provider(id)?),
            None => None,
        };
        let (tool, required_permissions) = match &spec.tool_ref {
            Some(tool_id) => {
                let (instance, permissions) = self.tool(tool_id)?;
                (Some(instance), permissions)
            }
            None => (None, Vec::new()),
        };

        let instance = downcast_component(factory.create(spec, ComponentDeps { provider, tool })?, id)?;

        let resolved = ResolvedComponent {
            id: id.to_string(),
            instance,
            provider_id,
            tool_id: spec.tool_ref.clone(),
            required_permissions,
        };
        self.components.lock().insert(id.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Declared record types with no registered factory.
    ///
    /// Materialization is lazy, so a missing factory only fails when (and
    /// if) the record is used; this preflight lets hosts surface the gap
    /// up front instead.
    pub fn missing_bindings(&self) -> Vec<Warning> {
        let mut findings = Vec::new();
        for (id, spec) in &self.ir.providers {
            if !self.factories.providers.contains_key(&spec.kind) {
                findings.push(Warning::new(
                    format!("/providers/{id}"),
                    format!("no factory registered for provider type '{}'", spec.kind),
                ));
            }
        }
        for (id, spec) in &self.ir.tools {
            if !self.factories.tools.contains_key(&spec.kind) {
                findings.push(Warning::new(
                    format!("/tools/{id}"),
                    format!("no factory registered for tool type '{}'", spec.kind),
                ));
            }
        }
        for (id, spec) in &self.ir.components {
            if !self.factories.components.contains_key(&spec.kind) {
                findings.push(Warning::new(
                    format!("/components/{id}"),
                    format!("no factory registered for component type '{}'", spec.kind),
                ));
            }
        }
        for (id, spec) in &self.ir.histories {
            if !self.factories.histories.contains_key(&spec.backend) {
                findings.push(Warning::new(
                    format!("/histories/{id}"),
                    format!("no factory registered for history backend '{}'", spec.backend),
                ));
            }
        }
        findings
    }

    /// Materialize every declared history backend.
    pub fn histories(&self) -> Result<HashMap<String, HistoryHandle>> {
        let mut handles = HashMap::new();
        for (id, spec) in &self.ir.histories {
            let factory = self.factories.histories.get(&spec.backend).ok_or_else(|| {
                EngineError::new(
                    ErrorKind::HistoryBackendNotFound,
                    format!("history '{id}': no factory registered for backend '{}'", spec.backend),
                )
            })?;
            handles.insert(id.clone(), factory.create(spec)?);
        }
        Ok(handles)
    }

    /// Every component materialized so far, for teardown.
    pub fn materialized_components(&self) -> Vec<Arc<dyn Component>> {
        self.components
            .lock()
            .values()
            .map(|resolved| resolved.instance.clone())
            .collect()
    }
}

fn downcast_component(boxed: Box<dyn Any + Send + Sync>, id: &str) -> Result<Arc<dyn Component>> {
    boxed.downcast::<Arc<dyn Component>>().map(|arc| *arc).map_err(|_| {
        EngineError::new(
            ErrorKind::SignatureMismatch,
            format!("component '{id}': factory did not return a (state, inputs, ctx) callable"),
        )
    })
}

fn downcast_tool(boxed: Box<dyn Any + Send + Sync>, id: &str) -> Result<Arc<dyn Tool>> {
    boxed.downcast::<Arc<dyn Tool>>().map(|arc| *arc).map_err(|_| {
        EngineError::new(
            ErrorKind::SignatureMismatch,
            format!("tool '{id}': factory did not return a (state, inputs, ctx) callable"),
        )
    })
}

type CallFn =
    Box<dyn Fn(Value, Value, CallContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A component backed by a plain async closure.
///
/// ```rust,ignore
/// let echo = ComponentFn::new(|_state, inputs, _ctx| async move { Ok(inputs) });
/// factories.register_component("echo", move |_spec, _deps| Ok(ComponentFn::boxed_any(echo.clone())));
/// ```
pub struct ComponentFn {
    call: CallFn,
}

impl ComponentFn {
    pub fn new<F, Fut>(f: F) -> Arc<dyn Component>
    where
        F: Fn(Value, Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Arc::new(Self {
            call: Box::new(move |state, inputs, ctx| Box::pin(f(state, inputs, ctx))),
        })
    }

    /// Wrap an already-built component instance for a factory return value.
    pub fn boxed_any(instance: Arc<dyn Component>) -> Box<dyn Any + Send + Sync> {
        Box::new(instance)
    }
}

#[async_trait]
impl Component for ComponentFn {
    async fn call(&self, state: &Value, inputs: Value, ctx: &CallContext) -> Result<Value> {
        (self.call)(state.clone(), inputs, ctx.clone()).await
    }
}

/// A tool backed by a plain async closure plus a static permission list.
pub struct ToolFn {
    call: CallFn,
    permissions: Vec<String>,
}

impl ToolFn {
    pub fn new<F, Fut>(permissions: Vec<String>, f: F) -> Arc<dyn Tool>
    where
        F: Fn(Value, Value, CallContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        Arc::new(Self {
            call: Box::new(move |state, inputs, ctx| Box::pin(f(state, inputs, ctx))),
            permissions,
        })
    }

    /// Wrap an already-built tool instance for a factory return value.
    pub fn boxed_any(instance: Arc<dyn Tool>) -> Box<dyn Any + Send + Sync> {
        Box::new(instance)
    }
}

#[async_trait]
impl Tool for ToolFn {
    async fn call(&self, state: &Value, inputs: Value, ctx: &CallContext) -> Result<Value> {
        (self.call)(state.clone(), inputs, ctx.clone()).await
    }

    fn permissions(&self) -> Vec<String> {
        self.permissions.clone()
    }
}
