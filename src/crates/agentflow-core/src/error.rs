//! Error types for document validation, graph building, and execution
//!
//! Every failure the engine can surface carries a stable [`ErrorKind`] tag, a
//! human-readable message, and — for document-level failures — a
//! json-pointer-like path identifying the offending field. Callers match on
//! the kind, not the message.
//!
//! # Error classes
//!
//! ```text
//! EngineError
//! ├── build-time referential   - duplicate ids, broken refs, bad entrypoint
//! ├── build-time materialize   - factory failures, signature mismatches
//! ├── build-time graph         - unknown kinds, missing providers/bodies
//! ├── runtime                  - node failures, routing, map iteration
//! └── policy                   - permissions, cost, retry/rate-limit config
//! ```

use thiserror::Error;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Stable machine-readable tag for every engine failure.
///
/// The string form (see [`ErrorKind::as_str`]) is part of the public
/// contract: it appears in `error.raised` events and in run results, and it
/// never changes for a given failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // Document loading
    DocParse,
    DocShape,

    // Build-time referential
    MetaVersionUnsupported,
    ProviderDup,
    ToolDup,
    ComponentDup,
    NodeDup,
    HistoryDup,
    OutputKeyCollision,
    GraphEntryNotFound,
    EdgeEndpointInvalid,
    ComponentProviderNotFound,
    ComponentToolNotFound,
    ToolProviderNotFound,
    NodeComponentNotFound,
    NodeNextInvalid,
    ExprInvalid,
    HistoryBackendNotFound,

    // Build-time materialization
    ComponentImport,
    ToolImport,
    SignatureMismatch,
    PermType,

    // Build-time graph
    NodeType,
    ProviderMissing,
    RouterNoMatch,
    MapBodyMissing,

    // Runtime
    NodeRuntime,
    MapOverNotArray,
    ParallelEmpty,
    Cancelled,
    Timeout,

    // Policy
    RetryPredicate,
    RlPolicyParam,
    ToolPermissionDenied,
    CostLimitExceeded,
    LlmJsonParse,
}

impl ErrorKind {
    /// The stable string form used in events and run results.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DocParse => "DOC_PARSE",
            Self::DocShape => "DOC_SHAPE",
            Self::MetaVersionUnsupported => "META_VERSION_UNSUPPORTED",
            Self::ProviderDup => "PROVIDER_DUP",
            Self::ToolDup => "TOOL_DUP",
            Self::ComponentDup => "COMPONENT_DUP",
            Self::NodeDup => "NODE_DUP",
            Self::HistoryDup => "HISTORY_DUP",
            Self::OutputKeyCollision => "OUTPUT_KEY_COLLISION",
            Self::GraphEntryNotFound => "GRAPH_ENTRY_NOT_FOUND",
            Self::EdgeEndpointInvalid => "EDGE_ENDPOINT_INVALID",
            Self::ComponentProviderNotFound => "COMPONENT_PROVIDER_NOT_FOUND",
            Self::ComponentToolNotFound => "COMPONENT_TOOL_NOT_FOUND",
            Self::ToolProviderNotFound => "TOOL_PROVIDER_NOT_FOUND",
            Self::NodeComponentNotFound => "NODE_COMPONENT_NOT_FOUND",
            Self::NodeNextInvalid => "NODE_NEXT_INVALID",
            Self::ExprInvalid => "EXPR_INVALID",
            Self::HistoryBackendNotFound => "HISTORY_BACKEND_NOT_FOUND",
            Self::ComponentImport => "COMPONENT_IMPORT",
            Self::ToolImport => "TOOL_IMPORT",
            Self::SignatureMismatch => "SIGNATURE_MISMATCH",
            Self::PermType => "PERM_TYPE",
            Self::NodeType => "NODE_TYPE",
            Self::ProviderMissing => "PROVIDER_MISSING",
            Self::RouterNoMatch => "ROUTER_NO_MATCH",
            Self::MapBodyMissing => "MAP_BODY_MISSING",
            Self::NodeRuntime => "NODE_RUNTIME",
            Self::MapOverNotArray => "MAP_OVER_NOT_ARRAY",
            Self::ParallelEmpty => "PARALLEL_EMPTY",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::RetryPredicate => "RETRY_PREDICATE",
            Self::RlPolicyParam => "RL_POLICY_PARAM",
            Self::ToolPermissionDenied => "TOOL_PERMISSION_DENIED",
            Self::CostLimitExceeded => "COST_LIMIT_EXCEEDED",
            Self::LlmJsonParse => "LLM_JSON_PARSE",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The engine's error type: a kind tag, a message, and optional context.
///
/// `pointer` locates document-level failures (`/graph/nodes/2/next` style);
/// `node` names the node a runtime failure belongs to; `http_status` carries
/// an underlying HTTP status when a callable surfaced one, which the retry
/// predicate consults.
#[derive(Debug, Error)]
#[error("{kind}: {message}{}", pointer.as_ref().map(|p| format!(" (at {p})")).unwrap_or_default())]
pub struct EngineError {
    /// Stable failure tag.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// json-pointer-like path into the source document, for build errors.
    pub pointer: Option<String>,
    /// Node the failure belongs to, for runtime errors.
    pub node: Option<String>,
    /// HTTP status reported by an underlying callable, if any.
    pub http_status: Option<u16>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pointer: None,
            node: None,
            http_status: None,
        }
    }

    /// Build error anchored to a document location.
    pub fn at(kind: ErrorKind, pointer: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pointer: Some(pointer.into()),
            node: None,
            http_status: None,
        }
    }

    /// Runtime error attributed to a node.
    pub fn node_error(kind: ErrorKind, node: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            pointer: None,
            node: Some(node.into()),
            http_status: None,
        }
    }

    /// Attach the node id a failure surfaced in, keeping an existing one.
    pub fn in_node(mut self, node: impl Into<String>) -> Self {
        if self.node.is_none() {
            self.node = Some(node.into());
        }
        self
    }

    /// Attach an underlying HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// A generic node runtime failure, the default classification for errors
    /// escaping a materialized callable.
    pub fn runtime(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::node_error(ErrorKind::NodeRuntime, node, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "run cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::DocParse, format!("JSON error: {err}"))
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::new(ErrorKind::DocParse, format!("YAML error: {err}"))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::DocParse, format!("I/O error: {err}"))
    }
}
