//! Capped exponential backoff.

use crate::config::UploadConfig;
use std::time::Duration;

/// Delay sequence `initial * multiplier^(n-1)`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    failures: u32,
    current: Option<Duration>,
}

impl Backoff {
    /// Creates a backoff with no failures recorded.
    #[must_use]
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial: initial.min(max),
            multiplier: multiplier.max(1.0),
            max,
            failures: 0,
            current: None,
        }
    }

    /// Backoff policy of the upload section.
    #[must_use]
    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(
            config.initial_backoff,
            config.backoff_multiplier,
            config.max_backoff,
        )
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let delay = self.current.map_or(self.initial, |previous| {
            Duration::try_from_secs_f64(previous.as_secs_f64() * self.multiplier)
                .map_or(self.max, |grown| grown.min(self.max))
        });
        self.current = Some(delay);
        delay
    }

    /// Forgets all failures.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.current = None;
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns `true` once the delay has reached the ceiling.
    #[must_use]
    pub fn at_ceiling(&self) -> bool {
        self.current.is_some_and(|d| d >= self.max)
    }
}
