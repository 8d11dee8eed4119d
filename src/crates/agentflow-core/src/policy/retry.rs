//! Retry classification and backoff schedule
//!
//! A failure is retryable when it is transient: a timeout that is not a run
//! cancellation, an underlying HTTP 429 or 5xx, or an error message that
//! reads as temporary. Policy-raised failures (permissions, cost, rate-limit
//! or retry misconfiguration, LLM JSON parsing) are never retried.

use std::time::Duration;

use rand::Rng;

use crate::error::{EngineError, ErrorKind};
use crate::ir::{RetrySpec, RetryStrategy};

const TRANSIENT_MARKERS: &[&str] = &["timeout", "temporarily", "retry"];

/// Whether a failed attempt may be tried again.
pub fn is_retryable(err: &EngineError) -> bool {
    match err.kind {
        // Cancellation aborts; policy decisions are final.
        ErrorKind::Cancelled
        | ErrorKind::ToolPermissionDenied
        | ErrorKind::CostLimitExceeded
        | ErrorKind::RlPolicyParam
        | ErrorKind::RetryPredicate
        | ErrorKind::LlmJsonParse => return false,
        ErrorKind::Timeout => return true,
        _ => {}
    }

    if let Some(status) = err.http_status {
        if status == 429 || (500..=599).contains(&status) {
            return true;
        }
    }

    let message = err.message.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Delay before the attempt following `failures` failed attempts (1-based).
pub fn retry_delay(spec: &RetrySpec, failures: u32) -> Duration {
    let seconds = match spec.strategy {
        RetryStrategy::Fixed => spec.interval,
        RetryStrategy::Exponential => {
            spec.interval * 2f64.powi(failures.saturating_sub(1) as i32)
        }
        RetryStrategy::Jitter => {
            let extra = if spec.jitter > 0.0 {
                rand::thread_rng().gen_range(0.0..spec.jitter)
            } else {
                0.0
            };
            spec.interval + extra
        }
    };
    Duration::from_secs_f64(seconds.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(strategy: RetryStrategy, interval: f64, jitter: f64) -> RetrySpec {
        RetrySpec {
            strategy,
            max_attempts: 3,
            interval,
            jitter,
        }
    }

    #[test]
    fn http_429_and_5xx_are_retryable() {
        let err = EngineError::runtime("n", "rate limited").with_status(429);
        assert!(is_retryable(&err));
        let err = EngineError::runtime("n", "upstream died").with_status(503);
        assert!(is_retryable(&err));
        let err = EngineError::runtime("n", "bad request").with_status(400);
        assert!(!is_retryable(&err));
    }

    #[test]
    fn transient_messages_are_retryable() {
        assert!(is_retryable(&EngineError::runtime("n", "connection TIMEOUT")));
        assert!(is_retryable(&EngineError::runtime("n", "service temporarily unavailable")));
        assert!(is_retryable(&EngineError::runtime("n", "please retry later")));
        assert!(!is_retryable(&EngineError::runtime("n", "schema mismatch")));
    }

    #[test]
    fn policy_failures_are_final() {
        let err = EngineError::new(ErrorKind::ToolPermissionDenied, "denied, retry");
        assert!(!is_retryable(&err));
        let err = EngineError::new(ErrorKind::CostLimitExceeded, "budget, retry");
        assert!(!is_retryable(&err));
        let err = EngineError::new(ErrorKind::LlmJsonParse, "bad json, retry");
        assert!(!is_retryable(&err));
        assert!(!is_retryable(&EngineError::cancelled()));
    }

    #[test]
    fn fixed_schedule_is_constant() {
        let sp = spec(RetryStrategy::Fixed, 0.5, 0.0);
        assert_eq!(retry_delay(&sp, 1), Duration::from_secs_f64(0.5));
        assert_eq!(retry_delay(&sp, 4), Duration::from_secs_f64(0.5));
    }

    #[test]
    fn exponential_schedule_doubles() {
        let sp = spec(RetryStrategy::Exponential, 0.01, 0.0);
        assert_eq!(retry_delay(&sp, 1), Duration::from_secs_f64(0.01));
        assert_eq!(retry_delay(&sp, 2), Duration::from_secs_f64(0.02));
        assert_eq!(retry_delay(&sp, 3), Duration::from_secs_f64(0.04));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let sp = spec(RetryStrategy::Jitter, 1.0, 0.5);
        for _ in 0..50 {
            let delay = retry_delay(&sp, 1).as_secs_f64();
            assert!((1.0..1.5).contains(&delay));
        }

        // Zero jitter degenerates to the base interval.
        let sp = spec(RetryStrategy::Jitter, 1.0, 0.0);
        assert_eq!(retry_delay(&sp, 1), Duration::from_secs(1));
    }
}
