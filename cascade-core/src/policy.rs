//! Retry, batching and failure handling of a computation, evaluated by its runners.

use std::time::Duration;

use backoff::strategy::exponential::Exponential;

use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
    max_delay: Duration,
    factor: f64,
    /// ratio in `[0, 1]`, `0` keeps the delays exact
    jitter: f64,
    /// Kinds worth retrying; empty retries every kind.
    retry_on: Vec<ErrorKind>,
}

impl RetryPolicy {
    /// Never retries.
    pub const NONE: RetryPolicy = RetryPolicy {
        max_retries: 0,
        delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        factor: 1.0,
        jitter: 0.0,
        retry_on: Vec::new(),
    };

    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.0,
            retry_on: Vec::new(),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self.max_delay = self.max_delay.max(delay);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Spreads every delay randomly within `delay * (1 ± jitter)`, still capped at the max delay.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retry_on = kinds.into_iter().collect();
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn is_retryable(&self, error: &Error) -> bool {
        self.retry_on.is_empty() || self.retry_on.contains(&error.kind())
    }

    /// Delays between attempts, exactly `max_retries` of them.
    pub fn backoff(&self) -> Exponential {
        Exponential::new(self.delay, self.max_delay, self.factor)
            .with_jitter(self.jitter)
            .with_max_attempts(self.max_retries)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComputationPolicy {
    retry: RetryPolicy,
    batch_capacity: usize,
    batch_threshold: Duration,
    continue_on_failure: bool,
    skip_first_failures: u32,
}

impl ComputationPolicy {
    /// No retry, one record per batch, the first failure halts the partition.
    pub const NONE: ComputationPolicy = ComputationPolicy {
        retry: RetryPolicy::NONE,
        batch_capacity: 1,
        batch_threshold: Duration::ZERO,
        continue_on_failure: false,
        skip_first_failures: 0,
    };

    pub fn builder() -> ComputationPolicyBuilder {
        ComputationPolicyBuilder {
            policy: ComputationPolicy::NONE,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    pub fn batch_threshold(&self) -> Duration {
        self.batch_threshold
    }

    pub fn continue_on_failure(&self) -> bool {
        self.continue_on_failure
    }

    pub fn skip_first_failures(&self) -> u32 {
        self.skip_first_failures
    }
}

impl Default for ComputationPolicy {
    fn default() -> Self {
        Self::builder()
            .retry_policy(RetryPolicy::default())
            .batch_policy(10, Duration::from_secs(1))
            .build()
    }
}

#[derive(Debug, Clone)]
pub struct ComputationPolicyBuilder {
    policy: ComputationPolicy,
}

impl ComputationPolicyBuilder {
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.policy.retry = retry;
        self
    }

    /// A batch is handed over once `capacity` records are buffered or `threshold` elapsed since
    /// its first record, whichever comes first.
    pub fn batch_policy(mut self, capacity: usize, threshold: Duration) -> Self {
        self.policy.batch_capacity = capacity.max(1);
        self.policy.batch_threshold = threshold;
        self
    }

    pub fn continue_on_failure(mut self, value: bool) -> Self {
        self.policy.continue_on_failure = value;
        self
    }

    pub fn skip_first_failures(mut self, count: u32) -> Self {
        self.policy.skip_first_failures = count;
        self
    }

    pub fn build(self) -> ComputationPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_strict() {
        let policy = ComputationPolicy::NONE;
        assert_eq!(policy.retry_policy().max_retries(), 0);
        assert_eq!(policy.batch_capacity(), 1);
        assert!(!policy.continue_on_failure());
        assert_eq!(policy.skip_first_failures(), 0);
        assert_eq!(policy.retry_policy().backoff().count(), 0);
    }

    #[test]
    fn backoff_yields_max_retries_delays() {
        let retry = RetryPolicy::new(4)
            .with_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(25));
        let delays: Vec<_> = retry.backoff().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(25),
                Duration::from_millis(25),
            ]
        );
    }

    #[test]
    fn retry_on_filters_kinds() {
        let retry = RetryPolicy::new(1).retry_on([ErrorKind::Append]);
        assert!(retry.is_retryable(&Error::Append("down".into())));
        assert!(!retry.is_retryable(&Error::processing("bad record")));
        assert!(RetryPolicy::new(1).is_retryable(&Error::processing("bad record")));
    }

    #[test]
    fn builder_sets_everything() {
        let policy = ComputationPolicy::builder()
            .retry_policy(RetryPolicy::new(2))
            .batch_policy(0, Duration::from_millis(50))
            .continue_on_failure(true)
            .skip_first_failures(3)
            .build();
        assert_eq!(policy.retry_policy().max_retries(), 2);
        // a batch holds at least one record
        assert_eq!(policy.batch_capacity(), 1);
        assert_eq!(policy.batch_threshold(), Duration::from_millis(50));
        assert!(policy.continue_on_failure());
        assert_eq!(policy.skip_first_failures(), 3);
    }

    #[test]
    fn jitter_spreads_delays() {
        let retry = RetryPolicy::new(20)
            .with_delay(Duration::from_millis(100))
            .with_factor(1.0)
            .with_jitter(0.5);
        assert_eq!(retry.jitter(), 0.5);
        let delays: Vec<_> = retry.backoff().collect();
        assert_eq!(delays.len(), 20);
        for delay in delays {
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
        assert_eq!(RetryPolicy::new(1).with_jitter(7.0).jitter(), 1.0);
    }

    #[test]
    fn delay_raises_max_delay() {
        let retry = RetryPolicy::new(1).with_delay(Duration::from_secs(30));
        assert_eq!(retry.max_delay(), Duration::from_secs(30));
    }
}
