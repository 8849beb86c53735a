//! Adaptive poll pacing
//!
//! Workers poll for ready runs in a loop. The poller stretches the interval
//! exponentially while polls come back empty and snaps back to the floor as
//! soon as work appears, so an idle deployment costs little and a busy one
//! stays responsive. All state is local to one worker; no coordination.

use std::time::Duration;

use rand::Rng;

use crate::retry::{plan, RetryDecision, RetryStrategy};

/// Configuration for [`AdaptivePoller`]
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Fastest polling interval, used while work keeps arriving.
    pub min_interval: Duration,

    /// Ceiling the backoff saturates at.
    pub max_interval: Duration,

    /// Consecutive empty polls tolerated at the floor interval before
    /// backoff starts.
    pub empty_poll_threshold: u32,

    /// Consecutive productive polls required to leave forced slow mode.
    pub success_reset_threshold: u32,

    /// Relative jitter applied to every interval, sampled uniformly in
    /// `[interval * (1 - f), interval * (1 + f)]`.
    pub jitter_factor: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            empty_poll_threshold: 3,
            success_reset_threshold: 2,
            jitter_factor: 0.1,
        }
    }
}

impl PollerConfig {
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_empty_poll_threshold(mut self, threshold: u32) -> Self {
        self.empty_poll_threshold = threshold;
        self
    }

    pub fn with_success_reset_threshold(mut self, threshold: u32) -> Self {
        self.success_reset_threshold = threshold;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }
}

/// Tracks poll outcomes and derives the next polling interval.
#[derive(Debug)]
pub struct AdaptivePoller {
    config: PollerConfig,
    consecutive_empty: u32,
    consecutive_hits: u32,
    forced_slow: bool,
}

impl AdaptivePoller {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            config,
            consecutive_empty: 0,
            consecutive_hits: 0,
            forced_slow: false,
        }
    }

    /// A poll returned work. Backoff collapses immediately; enough of these
    /// in a row also lifts forced slow mode.
    pub fn record_work_found(&mut self) {
        self.consecutive_empty = 0;
        self.consecutive_hits = self.consecutive_hits.saturating_add(1);
        if self.forced_slow && self.consecutive_hits >= self.config.success_reset_threshold {
            self.forced_slow = false;
        }
    }

    /// A poll returned nothing.
    pub fn record_no_work(&mut self) {
        self.consecutive_hits = 0;
        self.consecutive_empty = self.consecutive_empty.saturating_add(1);
    }

    /// Pin polling at the ceiling until enough productive polls arrive
    /// (e.g. after a broker error burst).
    pub fn force_slow_polling(&mut self) {
        self.forced_slow = true;
        self.consecutive_hits = 0;
    }

    /// Back to a fresh fast-polling state.
    pub fn reset(&mut self) {
        self.consecutive_empty = 0;
        self.consecutive_hits = 0;
        self.forced_slow = false;
    }

    /// The next interval to sleep before polling again, jitter included.
    pub fn next_interval(&self) -> Duration {
        self.jittered(self.base_interval())
    }

    /// The next interval without jitter. Deterministic, used by tests.
    pub fn base_interval(&self) -> Duration {
        if self.forced_slow {
            return self.config.max_interval;
        }
        if self.consecutive_empty <= self.config.empty_poll_threshold {
            return self.config.min_interval;
        }

        // The first poll past the threshold already stretches the interval
        // (attempt numbering starts at the first doubling).
        let excess = self.consecutive_empty - self.config.empty_poll_threshold;
        let strategy = RetryStrategy::Exponential {
            max_attempts: u32::MAX,
            base_delay_ms: self.config.min_interval.as_millis() as u64,
            factor: 2.0,
            max_delay_ms: Some(self.config.max_interval.as_millis() as u64),
        };
        match plan(excess.saturating_add(1), &strategy) {
            RetryDecision::Delay(delay) => delay.max(self.config.min_interval),
            RetryDecision::Exhausted => self.config.max_interval,
        }
    }

    fn jittered(&self, interval: Duration) -> Duration {
        let factor = self.config.jitter_factor;
        if factor <= 0.0 {
            return interval;
        }
        let millis = interval.as_millis() as f64;
        let sampled = rand::thread_rng().gen_range(millis * (1.0 - factor)..=millis * (1.0 + factor));
        Duration::from_millis(sampled.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poller() -> AdaptivePoller {
        AdaptivePoller::new(
            PollerConfig::default()
                .with_min_interval(Duration::from_millis(100))
                .with_max_interval(Duration::from_millis(1_600))
                .with_empty_poll_threshold(3)
                .with_success_reset_threshold(2)
                .with_jitter_factor(0.0),
        )
    }

    #[test]
    fn test_stays_at_floor_within_threshold() {
        let mut poller = poller();
        for _ in 0..3 {
            poller.record_no_work();
            assert_eq!(poller.base_interval(), Duration::from_millis(100));
        }
    }

    #[test]
    fn test_backs_off_past_threshold() {
        let mut poller = poller();
        for _ in 0..4 {
            poller.record_no_work();
        }
        // One poll past the threshold already exceeds the floor.
        assert_eq!(poller.base_interval(), Duration::from_millis(200));

        poller.record_no_work();
        assert_eq!(poller.base_interval(), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_saturates_at_ceiling() {
        let mut poller = poller();
        for _ in 0..50 {
            poller.record_no_work();
        }
        assert_eq!(poller.base_interval(), Duration::from_millis(1_600));
    }

    #[test]
    fn test_work_found_collapses_backoff() {
        let mut poller = poller();
        for _ in 0..10 {
            poller.record_no_work();
        }
        poller.record_work_found();
        assert_eq!(poller.base_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_forced_slow_until_enough_hits() {
        let mut poller = poller();
        poller.force_slow_polling();
        assert_eq!(poller.base_interval(), Duration::from_millis(1_600));

        poller.record_work_found();
        assert_eq!(poller.base_interval(), Duration::from_millis(1_600));

        poller.record_work_found();
        assert_eq!(poller.base_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let mut poller = AdaptivePoller::new(
            PollerConfig::default()
                .with_min_interval(Duration::from_millis(1_000))
                .with_jitter_factor(0.2),
        );
        poller.record_work_found();

        for _ in 0..100 {
            let interval = poller.next_interval();
            assert!(interval >= Duration::from_millis(800), "{interval:?}");
            assert!(interval <= Duration::from_millis(1_200), "{interval:?}");
        }
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut poller = poller();
        for _ in 0..10 {
            poller.record_no_work();
        }
        poller.force_slow_polling();
        poller.reset();
        assert_eq!(poller.base_interval(), Duration::from_millis(100));
    }
}
