use std::time::{Duration, Instant};

/// A start-time-tracking timer with a "do this no more than once per
/// interval" gate, used for rate-limited periodic logging (e.g. the
/// scanner's "scanned N files" progress line, servlet audit cadence).
pub struct ElapsedTimer {
    start: Instant,
    last: Instant,
}

impl ElapsedTimer {
    pub fn new() -> Self {
        let now = Instant::now();
        Self { start: now, last: now - Duration::from_secs(3600 * 24 * 365) }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last = now - Duration::from_secs(3600 * 24 * 365);
    }

    /// Returns `true` at most once per `interval`, flipping back to `false`
    /// until `interval` has elapsed again.
    pub fn once_every(&mut self, interval: Duration) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last) >= interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

impl Default for ElapsedTimer {
    fn default() -> Self {
        Self::new()
    }
}
