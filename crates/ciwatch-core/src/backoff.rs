use std::time::Duration;

pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const MAX_BACKOFF: Duration = Duration::from_millis(7_500);

/// Next retry interval after a failed attempt that waited `current`.
///
/// Grows by 1.5x and stays at [`MAX_BACKOFF`] once it gets there.
pub fn next_backoff(current: Duration) -> Duration {
    if current >= MAX_BACKOFF {
        return MAX_BACKOFF;
    }
    let grown = current.as_nanos().saturating_mul(3) / 2;
    let grown = u64::try_from(grown).map(Duration::from_nanos).unwrap_or(MAX_BACKOFF);
    grown.min(MAX_BACKOFF)
}

/// Retry interval for one channel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait before retrying and advances the interval.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_backoff(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}
