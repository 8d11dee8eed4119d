//! Event bus
//!
//! A single ordered sink for everything observable about a run. Every event
//! carries the run id, a wall-clock timestamp, and a monotonically increasing
//! sequence number assigned under the bus lock, so all exporters see one
//! identical linear order. Payloads pass through the masker before fan-out;
//! exporter failures are logged and never interrupt the run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::mask::Masker;

/// A masked, sequenced event as exporters receive it.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Catalogue name, e.g. `node.finish`.
    pub event: String,
    pub run_id: String,
    /// Wall-clock seconds with sub-second precision.
    pub ts: f64,
    pub sequence: u64,
    /// Kind-specific payload, already masked.
    pub data: Value,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Typed event payloads; the bus turns these into the wire form.
#[derive(Debug, Clone)]
pub enum EventPayload {
    GraphStart {
        graph_name: String,
        entrypoint: String,
    },
    GraphFinish {
        status: RunStatus,
        outputs: Value,
    },
    NodeStart {
        node_id: String,
        kind: &'static str,
        graph_name: String,
        started_at: f64,
    },
    NodeFinish {
        node_id: String,
        status: &'static str,
        duration_ms: f64,
        outputs: Value,
    },
    LlmCall {
        node_id: String,
        provider_id: Option<String>,
        model: Option<String>,
        tokens_in: u64,
        tokens_out: u64,
        inputs: Value,
        outputs: Value,
    },
    ToolCall {
        node_id: String,
        tool_id: Option<String>,
        component_id: String,
        required_permissions: Vec<String>,
        inputs: Value,
        outputs: Value,
    },
    RetryAttempt {
        node_id: String,
        attempt: u32,
        delay: f64,
        error: String,
    },
    RateLimitWait {
        scope: &'static str,
        target: String,
        wait_time: f64,
    },
    Timeout {
        graph_name: String,
        timeout: f64,
    },
    Cancelled {
        graph_name: String,
    },
    ErrorRaised {
        node_id: Option<String>,
        kind: &'static str,
        message: String,
    },
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GraphStart { .. } => "graph.start",
            Self::GraphFinish { .. } => "graph.finish",
            Self::NodeStart { .. } => "node.start",
            Self::NodeFinish { .. } => "node.finish",
            Self::LlmCall { .. } => "llm.call",
            Self::ToolCall { .. } => "tool.call",
            Self::RetryAttempt { .. } => "retry.attempt",
            Self::RateLimitWait { .. } => "rate.limit.wait",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::ErrorRaised { .. } => "error.raised",
        }
    }

    fn into_data(self) -> Value {
        match self {
            Self::GraphStart {
                graph_name,
                entrypoint,
            } => json!({"graph_name": graph_name, "entrypoint": entrypoint}),
            Self::GraphFinish { status, outputs } => {
                json!({"status": status.as_str(), "outputs": outputs})
            }
            Self::NodeStart {
                node_id,
                kind,
                graph_name,
                started_at,
            } => json!({
                "node_id": node_id, "kind": kind,
                "graph_name": graph_name, "started_at": started_at,
            }),
            Self::NodeFinish {
                node_id,
                status,
                duration_ms,
                outputs,
            } => json!({
                "node_id": node_id, "status": status,
                "duration_ms": duration_ms, "outputs": outputs,
            }),
            Self::LlmCall {
                node_id,
                provider_id,
                model,
                tokens_in,
                tokens_out,
                inputs,
                outputs,
            } => json!({
                "node_id": node_id, "provider_id": provider_id, "model": model,
                "tokens_in": tokens_in, "tokens_out": tokens_out,
                "inputs": inputs, "outputs": outputs,
            }),
            Self::ToolCall {
                node_id,
                tool_id,
                component_id,
                required_permissions,
                inputs,
                outputs,
            } => json!({
                "node_id": node_id, "tool_id": tool_id, "component_id": component_id,
                "required_permissions": required_permissions,
                "inputs": inputs, "outputs": outputs,
            }),
            Self::RetryAttempt {
                node_id,
                attempt,
                delay,
                error,
            } => json!({
                "node_id": node_id, "attempt": attempt, "delay": delay, "error": error,
            }),
            Self::RateLimitWait {
                scope,
                target,
                wait_time,
            } => json!({"scope": scope, "target": target, "wait_time": wait_time}),
            Self::Timeout {
                graph_name,
                timeout,
            } => json!({"graph_name": graph_name, "timeout": timeout}),
            Self::Cancelled { graph_name } => json!({"graph_name": graph_name}),
            Self::ErrorRaised {
                node_id,
                kind,
                message,
            } => json!({"node_id": node_id, "kind": kind, "message": message}),
        }
    }
}

/// An external consumer of the event stream.
///
/// Exporters must tolerate being called from the run's execution path; slow
/// or failing exporters degrade observability, never the run itself.
pub trait EventExporter: Send + Sync {
    fn export(&self, event: &Event) -> std::result::Result<(), String>;
}

/// Wall-clock seconds with sub-second precision.
pub fn wall_clock() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// The run-scoped ordered event sink.
pub struct EventBus {
    run_id: String,
    masker: Masker,
    exporters: Vec<Arc<dyn EventExporter>>,
    sequence: AtomicU64,
    emit_lock: Mutex<()>,
}

impl EventBus {
    pub fn new(run_id: String, masker: Masker, exporters: Vec<Arc<dyn EventExporter>>) -> Self {
        Self {
            run_id,
            masker,
            exporters,
            sequence: AtomicU64::new(0),
            emit_lock: Mutex::new(()),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Mask, sequence, and fan out one event.
    pub fn emit(&self, payload: EventPayload) {
        // One lock around sequencing, masking, and fan-out: exporters must
        // observe the same total order the sequence numbers describe.
        let _guard = self.emit_lock.lock();

        let name = payload.name();
        let mut data = payload.into_data();
        self.masker.mask(&mut data);

        let event = Event {
            event: name.to_string(),
            run_id: self.run_id.clone(),
            ts: wall_clock(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            data,
        };

        for exporter in &self.exporters {
            if let Err(error) = exporter.export(&event) {
                tracing::warn!(event = name, error, "event exporter failed");
            }
        }
    }
}

/// Exporter that logs every event through `tracing`.
#[derive(Default)]
pub struct ConsoleExporter;

impl EventExporter for ConsoleExporter {
    fn export(&self, event: &Event) -> std::result::Result<(), String> {
        tracing::info!(
            target: "agentflow::events",
            event = %event.event,
            run_id = %event.run_id,
            sequence = event.sequence,
            data = %event.data,
            "event"
        );
        Ok(())
    }
}

/// Exporter that appends one JSON object per line to a file.
///
/// Suited for local development and post-hoc timeline reconstruction; each
/// line is a complete [`Event`] with its sequence number, so interleaved
/// runs can be split by `run_id` afterwards.
pub struct JsonlExporter {
    writer: Mutex<std::io::BufWriter<std::fs::File>>,
}

impl JsonlExporter {
    pub fn create(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            writer: Mutex::new(std::io::BufWriter::new(file)),
        })
    }
}

impl EventExporter for JsonlExporter {
    fn export(&self, event: &Event) -> std::result::Result<(), String> {
        use std::io::Write;
        let line = serde_json::to_string(event).map_err(|e| e.to_string())?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}").map_err(|e| e.to_string())?;
        writer.flush().map_err(|e| e.to_string())
    }
}

/// Exporter that buffers events in memory; the assertion surface for tests.
#[derive(Default)]
pub struct CollectingExporter {
    events: Mutex<Vec<Event>>,
}

impl CollectingExporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Events with a given catalogue name, in emission order.
    pub fn named(&self, name: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event == name)
            .cloned()
            .collect()
    }
}

impl EventExporter for CollectingExporter {
    fn export(&self, event: &Event) -> std::result::Result<(), String> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}
