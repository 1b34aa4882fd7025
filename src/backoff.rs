//! Backoff interval calculator
//!
//! Pure computation: the kernel feeds in its consecutive-failure count and
//! gets back the next sleep interval. Jitter desynchronizes probes that
//! started failing at the same moment.

use std::time::Duration;

use rand::Rng;

/// Smallest interval the calculator will ever return
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Fractional jitter applied to every computed interval
const JITTER: f64 = 0.2;

/// Exponential backoff with a capped exponent, a hard ceiling, and ±20%
/// uniform jitter.
///
/// With zero consecutive failures the result is the base interval times
/// jitter, so a healthy probe keeps its configured cadence.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    max_failures: u32,
}

impl BackoffPolicy {
    pub fn new(
        base_interval: Duration,
        multiplier: f64,
        max_interval: Duration,
        max_failures: u32,
    ) -> Self {
        Self {
            base_interval,
            multiplier,
            max_interval,
            max_failures,
        }
    }

    /// Next sleep interval for the given consecutive-failure count.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        self.delay_with(consecutive_failures, &mut rand::rng())
    }

    /// Same as [`delay`](Self::delay) with a caller-supplied randomness
    /// source, deterministic under a seeded generator.
    pub fn delay_with<R: Rng>(&self, consecutive_failures: u32, rng: &mut R) -> Duration {
        let exponent = consecutive_failures.min(self.max_failures);
        let raw = self.base_interval.as_secs_f64() * self.multiplier.powi(exponent as i32);

        let jitter = rng.random_range(-JITTER..=JITTER);
        let jittered = raw * (1.0 + jitter);

        let capped = jittered.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped).max(MIN_INTERVAL)
    }
}
