//! Exponential backoff with jitter for stream reconnection.

use std::time::{Duration, Instant};

const DEFAULT_MAX_DELAY_SECS: f64 = 60.0;
const DEFAULT_RESET_INTERVAL_SECS: f64 = 60.0;
const DEFAULT_JITTER_RATIO: f64 = 0.5;

/// Delay schedule: `min(first_delay * 2^n, max_delay)` halved and topped up
/// with uniform jitter. The retry counter resets when the previous
/// connection stayed up longer than the reset interval.
#[derive(Debug)]
pub struct BackoffStrategy {
    retry_count: u32,
    first_delay: f64,
    max_delay: f64,
    reset_interval: f64,
    jitter_ratio: f64,
    last_good_run: Option<Instant>,
}

impl BackoffStrategy {
    pub fn new(first_delay_secs: f64) -> Self {
        Self {
            retry_count: 0,
            first_delay: first_delay_secs,
            max_delay: DEFAULT_MAX_DELAY_SECS,
            reset_interval: DEFAULT_RESET_INTERVAL_SECS,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            last_good_run: None,
        }
    }

    /// Record a successful connection open.
    pub fn set_good_run(&mut self) {
        self.last_good_run = Some(Instant::now());
    }

    fn backoff(&self) -> f64 {
        let delay = self.first_delay * 2_f64.powi(self.retry_count as i32);
        delay.min(self.max_delay)
    }

    /// Delay to sleep before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        if let Some(good_run) = self.last_good_run
            && self.reset_interval > 0.0
            && good_run.elapsed().as_secs_f64() > self.reset_interval
        {
            self.retry_count = 0;
        }
        let backoff = self.backoff();
        let delay = backoff / 2.0 + backoff * self.jitter_ratio * fastrand::f64();
        self.retry_count += 1;
        self.last_good_run = None;
        tracing::debug!(delay_secs = delay, retry = self.retry_count, "next reconnect delay");
        Duration::from_secs_f64(delay)
    }
}
