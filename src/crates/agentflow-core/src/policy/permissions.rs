//! Tool permission gating
//!
//! A tool- or component-backed node may only execute when every permission
//! string its materialized instance demands is granted by the policy: the
//! union of the default allow set and the per-target allow lists. Denials
//! are never retried.

use std::collections::BTreeSet;

use crate::error::{EngineError, ErrorKind, Result};

/// Compiled permission check for one node.
pub struct PermissionGate {
    required: Vec<String>,
    allowed: BTreeSet<String>,
}

impl PermissionGate {
    pub fn new(required: Vec<String>, allowed: BTreeSet<String>) -> Self {
        Self { required, allowed }
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    pub fn check(&self, node_id: &str) -> Result<()> {
        for permission in &self.required {
            if !self.allowed.contains(permission) {
                return Err(EngineError::node_error(
                    ErrorKind::ToolPermissionDenied,
                    node_id,
                    format!("node '{node_id}' requires permission '{permission}' which is not granted"),
                ));
            }
        }
        Ok(())
    }
}
