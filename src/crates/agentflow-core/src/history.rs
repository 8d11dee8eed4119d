//! Conversation history backends
//!
//! The engine never looks inside a history; it hands components a backend
//! handle through `ctx.registries` keyed by the declared history id. Storage
//! is pluggable behind [`HistoryBackend`]; an in-memory implementation is
//! provided for tests and single-process runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One stored conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Opaque history storage contract.
#[async_trait]
pub trait HistoryBackend: Send + Sync {
    /// Ordered messages for a session, oldest first.
    async fn get_history(&self, session_id: &str) -> Result<Vec<ChatMessage>>;

    async fn append_message(&self, session_id: &str, role: &str, content: &str) -> Result<()>;

    async fn clear_history(&self, session_id: &str) -> Result<()>;
}

/// Process-local history storage.
#[derive(Default)]
pub struct MemoryHistory {
    sessions: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryBackend for MemoryHistory {
    async fn get_history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        Ok(self
            .sessions
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_message(&self, session_id: &str, role: &str, content: &str) -> Result<()> {
        self.sessions
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .push(ChatMessage::new(role, content));
        Ok(())
    }

    async fn clear_history(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().remove(session_id);
        Ok(())
    }
}

/// Shared handle type stored in the registries view.
pub type HistoryHandle = Arc<dyn HistoryBackend>;
