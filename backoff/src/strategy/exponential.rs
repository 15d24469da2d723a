use std::time::Duration;

use rand::Rng;

/// Exponential backoff: the n-th delay (1-based) is `base * factor^(n - 1)`, optionally spread by
/// a jitter ratio, and never more than `max`.
///
/// ```
/// use backoff::strategy::exponential::Exponential;
/// use std::time::Duration;
///
/// let delays: Vec<_> = Exponential::new(Duration::from_millis(100), Duration::from_millis(300), 2.0)
///     .with_max_attempts(4)
///     .collect();
/// assert_eq!(
///     delays,
///     vec![
///         Duration::from_millis(100),
///         Duration::from_millis(200),
///         Duration::from_millis(300),
///         Duration::from_millis(300),
///     ]
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    base: Duration,
    max: Duration,
    /// Growth per attempt, never below `1.0`.
    factor: f64,
    /// Ratio in `[0.0, 1.0]`; a delay `d` becomes a random value in `[d * (1 - j), d * (1 + j)]`.
    jitter: f64,
    /// `None` means unbounded.
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Exponential {
    pub fn new(base: Duration, max: Duration, factor: f64) -> Self {
        Self {
            base,
            max,
            factor: factor.max(1.0),
            jitter: 0.0,
            max_attempts: None,
            attempt: 0,
        }
    }

    pub fn from_millis(base_ms: u64, max_ms: u64, factor: f64) -> Self {
        Self::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            factor,
        )
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Number of delays handed out since creation or the last [`Exponential::reset`].
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut millis = self.base.as_millis() as f64 * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            millis *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }
        // f64 -> u64 saturates, so an overflowing product lands on the cap below.
        Duration::from_millis(millis as u64).min(self.max)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        self.attempt += 1;
        Some(self.delay_for(self.attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_by_factor() {
        let mut backoff = Exponential::from_millis(10, 10_000, 3.0);
        assert_eq!(backoff.next(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(30)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(90)));
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn factor_below_one_is_constant() {
        let mut backoff = Exponential::from_millis(50, 1_000, 0.5);
        assert_eq!(backoff.next(), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn capped_by_max() {
        let backoff = Exponential::from_millis(1_000, 1_500, 2.0).with_max_attempts(3);
        let delays: Vec<_> = backoff.collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1_000),
                Duration::from_millis(1_500),
                Duration::from_millis(1_500)
            ]
        );
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let backoff = Exponential::from_millis(1_000, 60_000, 10.0);
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_millis(60_000));
    }

    #[test]
    fn zero_max_attempts_never_retries() {
        let mut backoff = Exponential::from_millis(1, 1, 1.0).with_max_attempts(0);
        assert_eq!(backoff.next(), None);
    }

    #[test]
    fn reset_restarts_growth() {
        let mut backoff = Exponential::from_millis(1, 100, 2.0).with_max_attempts(2);
        backoff.next();
        backoff.next();
        assert_eq!(backoff.next(), None);
        backoff.reset();
        assert_eq!(backoff.next(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut backoff = Exponential::from_millis(100, 10_000, 2.0).with_jitter(0.2);
        let delay = backoff.next().unwrap();
        assert!(delay >= Duration::from_millis(80));
        assert!(delay <= Duration::from_millis(120));
    }
}
