use std::time::Duration;

/// Linear retry delay: `base × attempt`, capped at `max`.
///
/// Attempt 0 has no delay, so the first dispatch of an item is immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn linear(base: Duration) -> Self {
        Self::new(base, Duration::MAX)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt).min(self.max)
    }
}
