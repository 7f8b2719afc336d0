//! Retry policy for failed retrievals.
//!
//! A [`RetryStrategy`] is a pure decision function: it looks at a
//! [`RetryContext`] and answers whether the orchestrator should try again and
//! after which delay. Only response-class errors are ever worth retrying; cache
//! and processor failures are deterministic and would fail the same way again.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ImageError;
use crate::source::Source;

/// Opaque value a strategy may attach to the next attempt.
pub type RetryUserInfo = Arc<dyn Any + Send + Sync>;

/// State of a retried request. Mutated in place between attempts.
#[derive(Clone)]
pub struct RetryContext {
    pub source: Source,
    pub error: ImageError,
    pub retried_count: u32,
    pub user_info: Option<RetryUserInfo>,
}

impl RetryContext {
    pub fn new(source: Source, error: ImageError) -> Self {
        Self {
            source,
            error,
            retried_count: 0,
            user_info: None,
        }
    }

    /// Record another failure after a retry was performed.
    pub fn increase_retry_count(&mut self, error: ImageError) {
        self.retried_count += 1;
        self.error = error;
    }
}

impl fmt::Debug for RetryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryContext")
            .field("source", &self.source.cache_key())
            .field("error", &self.error)
            .field("retried_count", &self.retried_count)
            .field("has_user_info", &self.user_info.is_some())
            .finish()
    }
}

/// Outcome of a retry decision.
#[derive(Clone)]
pub enum RetryDecision {
    Stop,
    Retry {
        after: Duration,
        user_info: Option<RetryUserInfo>,
    },
}

impl fmt::Debug for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDecision::Stop => f.write_str("Stop"),
            RetryDecision::Retry { after, .. } => {
                f.debug_struct("Retry").field("after", after).finish()
            }
        }
    }
}

/// Decides whether a failed retrieval is tried again.
pub trait RetryStrategy: Send + Sync {
    fn decide(&self, context: &RetryContext) -> RetryDecision;
}

/// How long [`DelayRetryStrategy`] waits before the next attempt.
#[derive(Clone)]
pub enum RetryInterval {
    /// Always the same delay
    Seconds(f64),
    /// `seconds * (retried_count + 1)`
    Accumulated(f64),
    /// Computed from the retried count
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl RetryInterval {
    pub fn timeout(&self, retried_count: u32) -> Duration {
        match self {
            RetryInterval::Seconds(seconds) => secs(*seconds),
            RetryInterval::Accumulated(seconds) => {
                secs(seconds * f64::from(retried_count.saturating_add(1)))
            }
            RetryInterval::Custom(f) => f(retried_count),
        }
    }
}

/// Negative and NaN delays are zero; delays too large for `Duration` saturate.
fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

impl fmt::Debug for RetryInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryInterval::Seconds(s) => f.debug_tuple("Seconds").field(s).finish(),
            RetryInterval::Accumulated(s) => f.debug_tuple("Accumulated").field(s).finish(),
            RetryInterval::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Retries response errors up to `max_retry_count` times.
#[derive(Debug, Clone)]
pub struct DelayRetryStrategy {
    pub max_retry_count: u32,
    pub retry_interval: RetryInterval,
}

impl DelayRetryStrategy {
    pub fn new(max_retry_count: u32, retry_interval: RetryInterval) -> Self {
        Self {
            max_retry_count,
            retry_interval,
        }
    }
}

impl Default for DelayRetryStrategy {
    fn default() -> Self {
        Self::new(3, RetryInterval::Seconds(3.0))
    }
}

impl RetryStrategy for DelayRetryStrategy {
    fn decide(&self, context: &RetryContext) -> RetryDecision {
        if context.retried_count >= self.max_retry_count {
            return RetryDecision::Stop;
        }
        if context.error.is_task_cancelled() || !context.error.is_response_error() {
            return RetryDecision::Stop;
        }
        RetryDecision::Retry {
            after: self.retry_interval.timeout(context.retried_count),
            user_info: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CacheError, ProcessorError, ResponseError};

    fn source() -> Source {
        Source::from_url_str("https://example.com/a.png").unwrap()
    }

    fn response_error() -> ImageError {
        ResponseError::InvalidStatusCode {
            url: "https://example.com/a.png".to_string(),
            status: 500,
        }
        .into()
    }

    #[test]
    fn test_stops_at_max_retry_count() {
        let strategy = DelayRetryStrategy::new(3, RetryInterval::Seconds(0.0));
        let mut context = RetryContext::new(source(), response_error());

        let mut retries = 0;
        while let RetryDecision::Retry { .. } = strategy.decide(&context) {
            retries += 1;
            context.increase_retry_count(response_error());
        }
        assert_eq!(retries, 3);
        assert_eq!(context.retried_count, 3);
    }

    #[test]
    fn test_never_retries_cache_or_processor_errors() {
        let strategy = DelayRetryStrategy::new(10, RetryInterval::Seconds(0.0));
        let cache = RetryContext::new(
            source(),
            CacheError::ImageNotExisting {
                key: "k".to_string(),
            }
            .into(),
        );
        let processor = RetryContext::new(
            source(),
            ProcessorError::ProcessingFailed {
                identifier: "p".to_string(),
                item: "data".to_string(),
            }
            .into(),
        );
        let cancelled = RetryContext::new(source(), ImageError::cancelled("k"));

        assert!(matches!(strategy.decide(&cache), RetryDecision::Stop));
        assert!(matches!(strategy.decide(&processor), RetryDecision::Stop));
        assert!(matches!(strategy.decide(&cancelled), RetryDecision::Stop));
    }

    #[test]
    fn test_interval_variants() {
        assert_eq!(RetryInterval::Seconds(2.0).timeout(5), Duration::from_secs(2));
        assert_eq!(
            RetryInterval::Accumulated(1.5).timeout(1),
            Duration::from_secs(3)
        );
        let custom = RetryInterval::Custom(Arc::new(|n| Duration::from_millis(100 * u64::from(n))));
        assert_eq!(custom.timeout(4), Duration::from_millis(400));
        assert_eq!(RetryInterval::Seconds(-1.0).timeout(0), Duration::ZERO);
    }

    #[test]
    fn test_huge_intervals_saturate() {
        assert_eq!(RetryInterval::Seconds(1e300).timeout(0), Duration::MAX);
        assert_eq!(RetryInterval::Seconds(f64::INFINITY).timeout(0), Duration::MAX);
        assert_eq!(
            RetryInterval::Accumulated(1e300).timeout(u32::MAX),
            Duration::MAX
        );
        assert_eq!(RetryInterval::Seconds(f64::NAN).timeout(0), Duration::ZERO);
        assert_eq!(
            RetryInterval::Accumulated(f64::NEG_INFINITY).timeout(3),
            Duration::ZERO
        );
    }
}
