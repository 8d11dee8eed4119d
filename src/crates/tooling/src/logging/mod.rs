//! Logging utilities
//!
//! Helpers for structured logging with tracing. Library crates only emit
//! `tracing` events; installing a subscriber is left to binaries, demos, and
//! tests via [`init`].

use std::time::Instant;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Install a global subscriber reading the `RUST_LOG` environment variable,
/// defaulting to `info`. Safe to call more than once; later calls are no-ops.
pub fn init() {
    init_with_default("info");
}

/// Install a global subscriber with an explicit default filter.
pub fn init_with_default(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Await a future, logging its elapsed time as one structured debug line.
///
/// # Example
///
/// ```rust,ignore
/// use tooling::logging::timed;
///
/// let result = timed("workflow.run", runner.run(inputs, options)).await;
/// ```
pub async fn timed<F, T>(name: &str, future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = Instant::now();
    let result = future.await;
    debug!(
        name,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "timed section finished"
    );
    result
}
