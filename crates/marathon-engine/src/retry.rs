//! Retry planning
//!
//! A stateless planner shared by workflow retries, task retries, and the
//! adaptive poller's backoff. Given the number of attempts already made and
//! a strategy, it answers either "exhausted" or "wait this long".

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry strategy carried on run options and task requests.
///
/// `max_attempts` counts attempts already made: `plan(attempts, ..)` reports
/// exhaustion once `attempts >= max_attempts`.
///
/// # Example
///
/// ```
/// use marathon_engine::retry::{plan, RetryDecision, RetryStrategy};
///
/// let strategy = RetryStrategy::Exponential {
///     max_attempts: 5,
///     base_delay_ms: 100,
///     factor: 2.0,
///     max_delay_ms: None,
/// };
///
/// // First retry after 100ms, second after 200ms, ...
/// assert_eq!(plan(1, &strategy), RetryDecision::Delay(std::time::Duration::from_millis(100)));
/// assert_eq!(plan(2, &strategy), RetryDecision::Delay(std::time::Duration::from_millis(200)));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Never retry; the first failure is final.
    Never,

    /// Fixed delay between attempts.
    Fixed { max_attempts: u32, delay_ms: u64 },

    /// Exponential backoff: `base · factor^(attempts - 1)`, capped.
    Exponential {
        max_attempts: u32,
        base_delay_ms: u64,
        #[serde(default = "default_factor")]
        factor: f64,
        #[serde(default)]
        max_delay_ms: Option<u64>,
    },

    /// Exponential backoff sampled uniformly in `[half, full]` of the
    /// computed delay, to spread retries across workers.
    Jittered {
        max_attempts: u32,
        base_delay_ms: u64,
        #[serde(default = "default_factor")]
        jitter_factor: f64,
        #[serde(default)]
        max_delay_ms: Option<u64>,
    },
}

fn default_factor() -> f64 {
    2.0
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            max_attempts: 5,
            base_delay_ms: 1_000,
            factor: 2.0,
            max_delay_ms: Some(60_000),
        }
    }
}

impl RetryStrategy {
    /// A strategy that never retries.
    pub fn never() -> Self {
        Self::Never
    }

    /// Fixed-interval strategy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }
}

/// Outcome of planning the next retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// No attempts remain.
    Exhausted,

    /// Wait this long before the next attempt.
    Delay(Duration),
}

impl RetryDecision {
    /// The delay, if one was planned.
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Exhausted => None,
            Self::Delay(d) => Some(*d),
        }
    }

    /// Whether the attempts are used up.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

/// Plan the next retry after `attempts_so_far` attempts have been made.
pub fn plan(attempts_so_far: u32, strategy: &RetryStrategy) -> RetryDecision {
    match strategy {
        RetryStrategy::Never => RetryDecision::Exhausted,

        RetryStrategy::Fixed {
            max_attempts,
            delay_ms,
        } => {
            if attempts_so_far >= *max_attempts {
                RetryDecision::Exhausted
            } else {
                RetryDecision::Delay(Duration::from_millis(*delay_ms))
            }
        }

        RetryStrategy::Exponential {
            max_attempts,
            base_delay_ms,
            factor,
            max_delay_ms,
        } => {
            if attempts_so_far >= *max_attempts {
                return RetryDecision::Exhausted;
            }
            RetryDecision::Delay(backoff_delay(
                attempts_so_far,
                *base_delay_ms,
                *factor,
                *max_delay_ms,
            ))
        }

        RetryStrategy::Jittered {
            max_attempts,
            base_delay_ms,
            jitter_factor,
            max_delay_ms,
        } => {
            if attempts_so_far >= *max_attempts {
                return RetryDecision::Exhausted;
            }
            let full = backoff_delay(attempts_so_far, *base_delay_ms, *jitter_factor, *max_delay_ms);
            let full_ms = full.as_secs_f64() * 1_000.0;
            let sampled = if full_ms > 0.0 {
                rand::thread_rng().gen_range(full_ms / 2.0..=full_ms)
            } else {
                0.0
            };
            RetryDecision::Delay(Duration::from_secs_f64(sampled / 1_000.0))
        }
    }
}

/// `base · factor^(attempts - 1)`, capped at `max_delay_ms` when set.
fn backoff_delay(
    attempts_so_far: u32,
    base_delay_ms: u64,
    factor: f64,
    max_delay_ms: Option<u64>,
) -> Duration {
    let exponent = attempts_so_far.saturating_sub(1);
    let raw = base_delay_ms as f64 * factor.powi(exponent as i32);
    let capped = match max_delay_ms {
        Some(max) => raw.min(max as f64),
        None => raw,
    };
    // An uncapped exponential outgrows what Duration can represent long
    // before u32 attempts run out; saturate instead of panicking in the
    // float conversion.
    let millis = capped.clamp(0.0, u64::MAX as f64);
    Duration::from_secs_f64(millis / 1_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_is_always_exhausted() {
        assert_eq!(plan(1, &RetryStrategy::Never), RetryDecision::Exhausted);
        assert_eq!(plan(7, &RetryStrategy::Never), RetryDecision::Exhausted);
    }

    #[test]
    fn test_fixed_exhausts_at_max_attempts() {
        let strategy = RetryStrategy::Fixed {
            max_attempts: 3,
            delay_ms: 100,
        };

        assert_eq!(
            plan(1, &strategy),
            RetryDecision::Delay(Duration::from_millis(100))
        );
        assert_eq!(
            plan(2, &strategy),
            RetryDecision::Delay(Duration::from_millis(100))
        );
        assert_eq!(plan(3, &strategy), RetryDecision::Exhausted);
        assert_eq!(plan(4, &strategy), RetryDecision::Exhausted);
    }

    #[test]
    fn test_exponential_sequence() {
        let strategy = RetryStrategy::Exponential {
            max_attempts: 10,
            base_delay_ms: 100,
            factor: 2.0,
            max_delay_ms: None,
        };

        assert_eq!(
            plan(1, &strategy),
            RetryDecision::Delay(Duration::from_millis(100))
        );
        assert_eq!(
            plan(2, &strategy),
            RetryDecision::Delay(Duration::from_millis(200))
        );
        assert_eq!(
            plan(3, &strategy),
            RetryDecision::Delay(Duration::from_millis(400))
        );
    }

    #[test]
    fn test_exponential_cap() {
        let strategy = RetryStrategy::Exponential {
            max_attempts: 100,
            base_delay_ms: 100,
            factor: 2.0,
            max_delay_ms: Some(1_000),
        };

        assert_eq!(
            plan(20, &strategy),
            RetryDecision::Delay(Duration::from_millis(1_000))
        );
    }

    #[test]
    fn test_uncapped_exponential_saturates() {
        let strategy = RetryStrategy::Exponential {
            max_attempts: 100,
            base_delay_ms: 100,
            factor: 2.0,
            max_delay_ms: None,
        };

        // Deep attempt counts overflow any practical delay; the planner
        // still answers with a (saturated) delay rather than panicking.
        let deep = plan(90, &strategy).delay().unwrap();
        assert!(deep > Duration::from_secs(3_600));
        assert_eq!(plan(99, &strategy).delay().unwrap(), deep);

        // The jittered variant takes the same saturated path.
        let jittered = RetryStrategy::Jittered {
            max_attempts: 100,
            base_delay_ms: 100,
            jitter_factor: 2.0,
            max_delay_ms: None,
        };
        assert!(plan(90, &jittered).delay().unwrap() > Duration::from_secs(3_600));
    }

    #[test]
    fn test_jittered_stays_in_half_to_full_range() {
        let strategy = RetryStrategy::Jittered {
            max_attempts: 10,
            base_delay_ms: 100,
            jitter_factor: 2.0,
            max_delay_ms: None,
        };

        // Attempt 3: full value is 400ms, sample must land in [200, 400].
        for _ in 0..50 {
            let delay = plan(3, &strategy).delay().unwrap();
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_jittered_exhaustion() {
        let strategy = RetryStrategy::Jittered {
            max_attempts: 2,
            base_delay_ms: 100,
            jitter_factor: 2.0,
            max_delay_ms: None,
        };

        assert!(plan(2, &strategy).is_exhausted());
    }

    #[test]
    fn test_serialization_round_trip() {
        let strategy = RetryStrategy::Exponential {
            max_attempts: 4,
            base_delay_ms: 250,
            factor: 1.5,
            max_delay_ms: Some(10_000),
        };

        let json = serde_json::to_string(&strategy).unwrap();
        assert!(json.contains("\"type\":\"exponential\""));

        let parsed: RetryStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(strategy, parsed);
    }
}
