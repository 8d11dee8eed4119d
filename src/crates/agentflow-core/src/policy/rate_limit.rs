//! Rate limit scoping and acquisition
//!
//! Buckets are interned once at build time into a registry keyed by resolved
//! scope name: `node:<id>`, `provider:<id>`, or `shared:<alias>` when several
//! providers map onto one bucket. Waiting is cancellable and every wait is
//! announced with a `rate.limit.wait` event carrying the scope, the target,
//! and the computed wait.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tooling::rate_limit::{AcquireOutcome, RateLimiter};

use crate::error::Result;
use crate::event::EventPayload;
use crate::ir::{RateLimitPolicies, RateLimitSpec};
use crate::runtime::RunContext;

fn build_limiter(spec: &RateLimitSpec) -> Arc<RateLimiter> {
    Arc::new(match spec {
        RateLimitSpec::TokenBucket {
            capacity,
            refill_per_sec,
        } => RateLimiter::token_bucket(*capacity, *refill_per_sec),
        RateLimitSpec::FixedWindow { limit, window_secs } => {
            RateLimiter::fixed_window(*limit, Duration::from_secs_f64(*window_secs))
        }
    })
}

/// A bucket bound to the scope it reports in events.
#[derive(Clone)]
pub struct ScopedLimiter {
    scope: &'static str,
    target: String,
    limiter: Arc<RateLimiter>,
}

impl ScopedLimiter {
    /// Take one permit, sleeping (cancellably) as long as the bucket says,
    /// announcing each wait on the bus.
    pub async fn acquire(&self, ctx: &RunContext) -> Result<()> {
        loop {
            match self.limiter.try_acquire().await {
                AcquireOutcome::Ready => return Ok(()),
                AcquireOutcome::WaitFor(wait) => {
                    ctx.bus().emit(EventPayload::RateLimitWait {
                        scope: self.scope,
                        target: self.target.clone(),
                        wait_time: wait.as_secs_f64(),
                    });
                    ctx.sleep(wait).await?;
                }
            }
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

/// All interned buckets plus the provider-to-alias resolution.
pub struct LimiterRegistry {
    nodes: HashMap<String, Arc<RateLimiter>>,
    providers: HashMap<String, Arc<RateLimiter>>,
    /// provider id -> (alias, shared bucket); takes precedence over a
    /// provider-specific bucket.
    aliased: HashMap<String, (String, Arc<RateLimiter>)>,
}

impl LimiterRegistry {
    pub fn from_policies(policies: &RateLimitPolicies) -> Self {
        let mut registry = Self {
            nodes: HashMap::new(),
            providers: HashMap::new(),
            aliased: HashMap::new(),
        };

        for (node_id, spec) in &policies.nodes {
            registry.nodes.insert(node_id.clone(), build_limiter(spec));
        }
        for (provider_id, spec) in &policies.providers {
            registry
                .providers
                .insert(provider_id.clone(), build_limiter(spec));
        }
        for (alias, shared) in &policies.shared {
            let bucket = build_limiter(&shared.spec);
            for provider_id in &shared.providers {
                registry
                    .aliased
                    .insert(provider_id.clone(), (alias.clone(), bucket.clone()));
            }
        }

        registry
    }

    /// The node-scope limiter for a node id, if configured.
    pub fn for_node(&self, node_id: &str) -> Option<ScopedLimiter> {
        self.nodes.get(node_id).map(|limiter| ScopedLimiter {
            scope: "node",
            target: node_id.to_string(),
            limiter: limiter.clone(),
        })
    }

    /// The provider-scope limiter for a provider id, if configured. A shared
    /// alias covering the provider wins over a provider-specific bucket.
    pub fn for_provider(&self, provider_id: &str) -> Option<ScopedLimiter> {
        if let Some((alias, bucket)) = self.aliased.get(provider_id) {
            return Some(ScopedLimiter {
                scope: "provider",
                target: alias.clone(),
                limiter: bucket.clone(),
            });
        }
        self.providers.get(provider_id).map(|limiter| ScopedLimiter {
            scope: "provider",
            target: provider_id.to_string(),
            limiter: limiter.clone(),
        })
    }
}
