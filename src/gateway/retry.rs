//! Exponential backoff for gateway connects and device reopen

use std::time::Duration;

use rand::Rng;

/// Retry policy for connecting to the gateway
///
/// Controls how many times a failed connect is retried and how
/// long to wait between attempts using exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Give up once the summed delays would exceed this
    pub max_total_wait: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_total_wait: Some(Duration::from_secs(120)),
        }
    }
}

/// Compute the delay before retry number `attempt` (zero-based).
///
/// The delay follows exponential backoff:
/// `min(base_delay * 2^attempt + jitter, max_delay)` with 0-25% jitter.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.25);
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}

/// Attempt counter for one connect (or reconnect) cycle
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
    waited: Duration,
}

impl Backoff {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            waited: Duration::ZERO,
        }
    }

    /// Record a failed attempt and return how long to wait before the next one.
    ///
    /// Returns `None` once the attempt or total-wait budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            return None;
        }

        let delay = delay_for_attempt(&self.policy, self.failures - 1);
        if let Some(cap) = self.policy.max_total_wait {
            if self.waited + delay > cap {
                return None;
            }
        }
        self.waited += delay;
        Some(delay)
    }

    /// Failed attempts so far
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Start a fresh cycle after a success
    pub const fn reset(&mut self) {
        self.failures = 0;
        self.waited = Duration::ZERO;
    }
}
