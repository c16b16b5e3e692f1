//! Cycle timing for fixed-frequency loops.

use std::time::{Duration, Instant};

/// Computes how long a loop should park so it runs at a target frequency.
///
/// `start()`/`stop()` bracket one iteration. When the iteration finished
/// under its budget, [`RateLimiter::can_sleep`] is true and
/// [`RateLimiter::sleep_duration`] is the remainder of the cycle. Slow
/// iterations never sleep, so the loop simply runs as fast as it can.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    cycle: Duration,
    started: Option<Instant>,
    elapsed: Duration,
}

impl RateLimiter {
    /// Create a limiter targeting `frequency_hz` iterations per second.
    pub fn new(frequency_hz: f32) -> Self {
        let mut limiter = Self {
            cycle: Duration::ZERO,
            started: None,
            elapsed: Duration::ZERO,
        };
        limiter.set_frequency(frequency_hz);
        limiter
    }

    /// Set the target frequency. Zero, negative or non-finite frequencies
    /// disable throttling.
    pub fn set_frequency(&mut self, frequency_hz: f32) {
        self.cycle = if frequency_hz.is_finite() && frequency_hz > 0.0 {
            Duration::from_secs_f64(1.0 / f64::from(frequency_hz))
        } else {
            Duration::ZERO
        };
    }

    /// Target duration of one cycle.
    pub fn cycle_time(&self) -> Duration {
        self.cycle
    }

    /// Mark the beginning of an iteration.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Mark the end of an iteration and record its cost.
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.record(started.elapsed());
        }
    }

    /// Record the cost of an iteration measured elsewhere.
    pub fn record(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
    }

    /// Cost of the last recorded iteration.
    pub fn last_elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Whether the last iteration finished under budget.
    pub fn can_sleep(&self) -> bool {
        self.elapsed < self.cycle
    }

    /// Time left in the current cycle, zero when over budget.
    pub fn sleep_duration(&self) -> Duration {
        self.cycle.saturating_sub(self.elapsed)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_time_from_frequency() {
        let limiter = RateLimiter::new(100.0);
        assert_eq!(limiter.cycle_time(), Duration::from_millis(10));
    }

    #[test]
    fn test_under_budget_sleeps_remainder() {
        let mut limiter = RateLimiter::new(100.0);
        limiter.record(Duration::from_millis(4));
        assert!(limiter.can_sleep());
        assert_eq!(limiter.sleep_duration(), Duration::from_millis(6));
    }

    #[test]
    fn test_over_budget_never_sleeps() {
        let mut limiter = RateLimiter::new(100.0);
        limiter.record(Duration::from_millis(25));
        assert!(!limiter.can_sleep());
        assert_eq!(limiter.sleep_duration(), Duration::ZERO);
    }

    #[test]
    fn test_zero_frequency_is_unthrottled() {
        let mut limiter = RateLimiter::new(0.0);
        limiter.start();
        limiter.stop();
        assert!(!limiter.can_sleep());

        limiter.set_frequency(f32::NAN);
        assert_eq!(limiter.cycle_time(), Duration::ZERO);
    }

    #[test]
    fn test_stop_without_start_keeps_last_cost() {
        let mut limiter = RateLimiter::new(10.0);
        limiter.record(Duration::from_millis(30));
        limiter.stop();
        assert_eq!(limiter.last_elapsed(), Duration::from_millis(30));
    }
}
