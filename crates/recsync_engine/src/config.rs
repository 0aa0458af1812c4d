//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How long an acquired read or write lease stays valid.
    pub lease_duration: Duration,
    /// Delay before a stale query delivers its cached result anyway.
    pub fallback_delay: Duration,
    /// Freshness window used when a caller does not supply one.
    pub default_freshness: Duration,
    /// Request timeout for the HTTP client.
    pub request_timeout: Duration,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl SyncConfig {
    /// Creates a configuration with the default timings.
    pub fn new() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            fallback_delay: Duration::from_secs(3),
            default_freshness: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            event_capacity: 64,
        }
    }

    /// Sets the lease duration.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Sets the fallback notification delay.
    pub fn with_fallback_delay(mut self, delay: Duration) -> Self {
        self.fallback_delay = delay;
        self
    }

    /// Sets the default freshness window.
    pub fn with_default_freshness(mut self, freshness: Duration) -> Self {
        self.default_freshness = freshness;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff policy for retrying a model after a transient failure.
///
/// Retry `n` (1-based) waits `base_delay * growth^(n-1)`, capped at
/// `delay_cap`, plus up to a quarter of that when `jitter` is set.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries per model before the engine gives up until the next success.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub base_delay: Duration,
    /// Upper bound of the computed wait, jitter excluded.
    pub delay_cap: Duration,
    /// Factor applied to the wait after each retry.
    pub growth: f64,
    /// Spread retries of many clients apart.
    pub jitter: bool,
}

impl RetryConfig {
    /// One minute, doubling up to fifteen minutes, with jitter.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(60),
            delay_cap: Duration::from_secs(15 * 60),
            growth: 2.0,
            jitter: true,
        }
    }

    /// Never retries.
    pub fn disabled() -> Self {
        Self::new(0).with_jitter(false)
    }

    /// Sets the wait before the first retry.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the upper bound of the wait.
    pub fn with_delay_cap(mut self, cap: Duration) -> Self {
        self.delay_cap = cap;
        self
    }

    /// Sets the growth factor.
    pub fn with_growth(mut self, growth: f64) -> Self {
        self.growth = growth;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before retry number `retry`, counting from 1.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.max(1) - 1).unwrap_or(i32::MAX);
        let secs = (self.base_delay.as_secs_f64() * self.growth.powi(exponent))
            .min(self.delay_cap.as_secs_f64());
        let spread = if self.jitter { secs * 0.25 * unit_random() } else { 0.0 };
        Duration::try_from_secs_f64(secs + spread).unwrap_or(self.delay_cap)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// A value in `[0, 1]` taken from a random v4 UUID.
fn unit_random() -> f64 {
    let (bits, ..) = uuid::Uuid::new_v4().as_fields();
    f64::from(bits) / f64::from(u32::MAX)
}
