//! Shared utilities for the agentflow workspace
//!
//! # Modules
//!
//! - `rate_limit` - Token bucket and fixed window rate limiters with
//!   computed wait times, suitable for cancellable waiting
//! - `logging` - Structured logging setup and timing helpers

pub mod logging;
pub mod rate_limit;

pub use rate_limit::{AcquireOutcome, FixedWindow, RateLimiter, TokenBucket};
