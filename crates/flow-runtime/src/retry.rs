//! # Rebind Backoff
//!
//! Exponential backoff with jitter for spacing consecutive receiver rebinds.
//!
//! The first rebind after an acknowledgment failure happens immediately;
//! every further rebind inside the same reconciliation pass waits
//! `initial * multiplier^n`, capped at `max_delay`, so a broker that keeps
//! rejecting acknowledgments is not hammered with reconnects.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy configuration
///
/// # Examples
///
/// ```rust
/// use flow_runtime::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(Duration::from_millis(250), Duration::from_secs(2), 2.0)
///     .without_jitter();
///
/// assert_eq!(policy.calculate_delay(0), Duration::from_millis(250));
/// assert_eq!(policy.calculate_delay(1), Duration::from_millis(500));
/// assert_eq!(policy.calculate_delay(10), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the second rebind of a pass
    #[serde(with = "millis")]
    pub initial_delay: Duration,

    /// Upper bound for any single delay
    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Exponential growth factor (typically 2.0)
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }

    /// Policy that never waits; used where rebinds must be immediate
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1.0).without_jitter()
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Delay for backoff step `attempt` (0-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay_secs =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64()).max(0.0);

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::from_secs_f64(final_delay_secs)
    }

    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

/// Rebind counter for a single reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Rebinds performed so far in this pass
    pub rebinds: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_rebind(&mut self) {
        self.rebinds += 1;
    }

    /// Wait required before the next rebind; zero for the first one
    pub fn next_delay(&self, policy: &RetryPolicy) -> Duration {
        match self.rebinds {
            0 => Duration::ZERO,
            n => policy.calculate_delay(n - 1),
        }
    }

    pub fn can_rebind(&self, max_rebinds: u32) -> bool {
        self.rebinds < max_rebinds
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
