//! Retry and backoff policy shared by the poller and sink delivery.

use std::time::Duration;

use rand::Rng;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Configuration for exponential backoff with optional jitter.
///
/// Controls how many times to retry a failed operation and how long
/// to wait between attempts. The delay starts at `initial_delay`, grows by
/// `multiplier` on each retry, is capped at `max_delay`, and then has a
/// uniformly random `[0, jitter]` added on top.
///
/// # Example
///
/// ```
/// use sentinel::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new()
///     .with_max_attempts(5)
///     .with_initial_delay(Duration::from_millis(500))
///     .with_max_delay(Duration::from_secs(30))
///     .with_jitter(Duration::from_secs(1));
///
/// assert_eq!(policy.delay_for_retry(0), Duration::from_millis(500));
/// assert_eq!(policy.delay_for_retry(20), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    ///
    /// A value of 1 means no retries; only the initial attempt is made.
    /// The poller ignores this cap and retries until cancelled.
    pub max_attempts: u32,

    /// Delay before the first retry. Doubles as the backoff floor.
    pub initial_delay: Duration,

    /// Maximum delay between retries, before jitter.
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each retry.
    pub multiplier: f64,

    /// Upper bound of the uniform random delay added to every wait.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Default maximum attempts.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Default initial delay (1 second).
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

    /// Default maximum delay (30 seconds).
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

    /// Default multiplier (2.0).
    pub const DEFAULT_MULTIPLIER: f64 = 2.0;

    /// Minimum value for `max_attempts`.
    pub const MIN_MAX_ATTEMPTS: u32 = 1;

    /// Creates a new retry policy with default values and no jitter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_delay: Self::DEFAULT_INITIAL_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
            multiplier: Self::DEFAULT_MULTIPLIER,
            jitter: Duration::ZERO,
        }
    }

    /// Sets the maximum number of attempts.
    ///
    /// # Panics
    ///
    /// Panics if `max_attempts` is less than 1.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        assert!(
            max_attempts >= Self::MIN_MAX_ATTEMPTS,
            "max_attempts must be at least 1"
        );
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the initial delay between retries.
    ///
    /// Zero delay is supported (useful for testing) but creates a tight
    /// retry loop in production.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay between retries.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the delay multiplier.
    ///
    /// # Panics
    ///
    /// Panics if `multiplier` is not positive (must be > 0.0).
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        assert!(multiplier > 0.0, "multiplier must be positive");
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter upper bound.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the delay for a given retry number (0-indexed), without jitter.
    ///
    /// # Arguments
    ///
    /// * `retry` - The retry number (0 = delay before first retry, 1 = delay before second retry, etc.)
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        // Exponents past 64 saturate at max_delay anyway
        let exponent = i32::try_from(retry.min(64)).unwrap_or(64);
        let multiplier = self.multiplier.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Computes the delay for a retry with jitter drawn from `rng`.
    #[must_use]
    pub fn delay_with_jitter<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        self.delay_for_retry(retry) + sample_jitter(self.jitter, rng)
    }

    /// Returns true if the given attempt number should be retried.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt number (1 = first attempt, 2 = first retry, etc.)
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Draws a uniformly random duration in `[0, max]` at millisecond resolution.
pub fn sample_jitter<R: Rng + ?Sized>(max: Duration, rng: &mut R) -> Duration {
    let max_millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.gen_range(0..=max_millis))
}
