//! Exponential backoff for connection establishment.
//!
//! A retry sequence starts at `backoff`, multiplies the delay after each
//! failed attempt and never waits longer than `max_backoff`.

use std::time::Duration;

/// Configuration for a retry sequence.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    /// Label used in log lines (e.g. "client 10.0.0.2:26257 connection")
    pub tag: String,
    /// Delay after the first failed attempt
    pub backoff: Duration,
    /// Maximum delay between attempts
    pub max_backoff: Duration,
    /// Multiplier applied to the delay after every failed attempt
    pub multiplier: f64,
    /// Maximum number of attempts (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            tag: String::new(),
            backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 0, // Unlimited
        }
    }
}

impl RetryOptions {
    /// Set the log tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Whether `attempts` failed attempts exhaust the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts != 0 && attempts >= self.max_attempts
    }
}

/// Calculates the delay after the `attempt`-th failed attempt (1-based).
pub fn calculate_backoff(attempt: u32, opts: &RetryOptions) -> Duration {
    let max = opts.max_backoff.as_secs_f64();
    let initial = opts.backoff.as_secs_f64().min(max);
    let multiplier = opts.multiplier.max(1.0);

    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let delay = initial * multiplier.powi(exponent);

    Duration::from_secs_f64(delay.min(max))
}

/// Cursor over one retry sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    opts: RetryOptions,
    attempts: u32,
}

impl Backoff {
    pub fn new(opts: RetryOptions) -> Self {
        Self { opts, attempts: 0 }
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay before the next attempt, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.opts.exhausted(self.attempts) {
            return None;
        }
        Some(calculate_backoff(self.attempts, &self.opts))
    }

    /// Number of failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn options(&self) -> &RetryOptions {
        &self.opts
    }
}
