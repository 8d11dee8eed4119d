//! Policy decorators around node executors
//!
//! Every node invocation passes through the same fixed stack, outer to
//! inner:
//!
//! ```text
//! permissions -> cost -> rate limit -> retry -> masking-on-emit -> executor
//! ```
//!
//! Permission and cost failures are checked once per node execution and are
//! never retried. The rate limiter is consulted before **every** attempt, so
//! a retrying node cannot stampede a throttled provider; the retry layer
//! then classifies failures and sleeps between attempts. Masking is applied
//! by the event bus to every payload the inner layers emit.
//!
//! The stack is composed once at build time; per-run state (the cost tally,
//! the diff-mask memory, the cancel token) lives in the run context.

pub mod cost;
pub mod permissions;
pub mod rate_limit;
pub mod retry;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::event::EventPayload;
use crate::runtime::RunContext;

pub use cost::CostTally;
pub use permissions::PermissionGate;
pub use rate_limit::{LimiterRegistry, ScopedLimiter};
pub use retry::{is_retryable, retry_delay};

use crate::ir::RetrySpec;

/// The compiled policy configuration of one node.
pub struct NodePolicies {
    /// Present for tool- and component-backed nodes with demands.
    pub permission: Option<PermissionGate>,
    pub retry: RetrySpec,
    /// Node-scope first, then provider-scope.
    pub limiters: Vec<ScopedLimiter>,
}

impl NodePolicies {
    pub fn unrestricted() -> Self {
        Self {
            permission: None,
            retry: RetrySpec::default(),
            limiters: Vec::new(),
        }
    }
}

/// Drive one node execution through the policy stack.
///
/// `attempt_fn` is the base executor invocation; it is called once per
/// attempt with freshly cloned inputs captured by the builder.
pub async fn execute<F>(
    policies: &NodePolicies,
    ctx: &RunContext,
    node_id: &str,
    attempt_fn: F,
) -> Result<Value>
where
    F: Fn() -> BoxFuture<'static, Result<Value>>,
{
    if let Some(gate) = &policies.permission {
        gate.check(node_id)?;
    }
    ctx.core().cost.check()?;

    let mut failures: u32 = 0;
    loop {
        for limiter in &policies.limiters {
            limiter.acquire(ctx).await?;
        }
        ctx.checkpoint()?;

        match attempt_fn().await {
            Ok(outputs) => return Ok(outputs),
            Err(err) => {
                failures += 1;
                if err.is_cancelled() || ctx.is_cancelled() {
                    return Err(EngineError::cancelled());
                }
                if failures >= policies.retry.max_attempts || !is_retryable(&err) {
                    return Err(err);
                }

                let delay = retry_delay(&policies.retry, failures);
                ctx.bus().emit(EventPayload::RetryAttempt {
                    node_id: node_id.to_string(),
                    attempt: failures,
                    delay: delay.as_secs_f64(),
                    error: err.to_string(),
                });
                ctx.sleep(delay).await?;
            }
        }
    }
}
