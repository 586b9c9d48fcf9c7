//! Declarative retry policy consumed uniformly by the scheduler.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed {
        #[serde(with = "millis")]
        delay: Duration,
    },
    /// `base * 2^(attempt - 1)`, capped at `max`
    Exponential {
        #[serde(with = "millis")]
        base: Duration,
        #[serde(with = "millis")]
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed {
            delay: Duration::from_secs(1),
        }
    }
}

/// Retry policy for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt (0 = no retries).
    /// `max_attempts = 2` gives up to three attempts in total.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            backoff: Backoff::Fixed {
                delay: Duration::ZERO,
            },
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Whether a task whose attempt number `attempt` (1-based) just failed
    /// may be retried.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Delay before retrying after attempt number `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed { delay } => delay,
            Backoff::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent)
                    .map(|d| d.min(max))
                    .unwrap_or(max)
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Default policy: no retries.
    fn default() -> Self {
        Self::none()
    }
}

/// Serde helper: durations as integer milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
