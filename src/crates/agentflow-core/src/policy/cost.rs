//! Run-scoped token cost accounting
//!
//! Every `llm.call` adds its input and output tokens to the tally. The gate
//! is checked before each node starts; once the tally exceeds the per-run
//! ceiling the run aborts with `COST_LIMIT_EXCEEDED`. Cost failures are
//! never retried.

use parking_lot::Mutex;

use crate::error::{EngineError, ErrorKind, Result};

/// Token tally for one run.
pub struct CostTally {
    limit: Option<u64>,
    used: Mutex<u64>,
}

impl CostTally {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            used: Mutex::new(0),
        }
    }

    /// Record one LLM call's usage.
    pub fn add(&self, tokens_in: u64, tokens_out: u64) {
        *self.used.lock() += tokens_in + tokens_out;
    }

    pub fn used(&self) -> u64 {
        *self.used.lock()
    }

    /// Gate checked before a node starts.
    pub fn check(&self) -> Result<()> {
        let Some(limit) = self.limit else { return Ok(()) };
        let used = self.used();
        if used > limit {
            return Err(EngineError::new(
                ErrorKind::CostLimitExceeded,
                format!("token budget exhausted: {used} used, {limit} allowed per run"),
            ));
        }
        Ok(())
    }
}
