use std::future::Future;
use std::time::Duration;

use crate::config::BackoffConfig;

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// Exponential restart delay.
///
/// The first delay handed out after a reset is zero (retry immediately), then
/// `start_delay`, then `start_delay * multiplier`, and so on. Growth is only
/// bounded by the representable range of [`Duration`]; `max_delay` is carried
/// as configuration and is not applied here.
#[derive(Debug, Clone)]
pub struct Backoff {
    start_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    current_delay: Duration,
    max_multiplicand: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_parts(Duration::from_millis(200), Duration::from_secs(120), 2.0)
    }
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> crate::Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(
            Duration::from_millis(config.start_ms),
            Duration::from_millis(config.max_ms),
            config.multiplier,
        ))
    }

    fn from_parts(start_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            start_delay,
            max_delay,
            multiplier,
            current_delay: Duration::ZERO,
            max_multiplicand: scale(Duration::MAX, 1.0 / multiplier),
        }
    }

    pub fn start_delay(&self) -> Duration {
        self.start_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// The delay the next [`schedule`](Self::schedule) call will wait for.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Advances the delay after a failed attempt.
    pub fn on_failure(&mut self) {
        self.current_delay = if self.current_delay.is_zero() {
            self.start_delay
        } else if self.current_delay > self.max_multiplicand {
            Duration::MAX
        } else {
            scale(self.current_delay, self.multiplier).max(self.current_delay)
        };
    }

    pub fn reset(&mut self) {
        self.current_delay = Duration::ZERO;
    }

    /// Returns the delay in effect before this call and advances the policy.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.on_failure();
        delay
    }

    /// Runs `action` on the tokio runtime after the current delay and
    /// advances the policy. A zero delay spawns it straight away.
    ///
    /// Returns the delay that was applied.
    pub fn schedule<F>(&mut self, action: F) -> Duration
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.next_delay();
        if delay.is_zero() {
            tokio::spawn(action);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                action.await;
            });
        }
        delay
    }
}

fn scale(delay: Duration, factor: f64) -> Duration {
    let nanos = (delay.as_nanos() as f64 * factor).round();
    let secs = (nanos / NANOS_PER_SEC).floor();
    if !secs.is_finite() || secs >= u64::MAX as f64 {
        return Duration::MAX;
    }
    let subsec = (nanos - secs * NANOS_PER_SEC).clamp(0.0, NANOS_PER_SEC - 1.0);
    Duration::new(secs as u64, subsec as u32)
}
