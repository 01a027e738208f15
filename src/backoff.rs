use rand::Rng;
use std::time::Duration;

/// Exponential backoff with full jitter: base doubles per attempt up to a
/// cap, and each delay is drawn uniformly from [base/2, base].
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Serial-link reconnect policy: 1 s base, 30 s cap.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Next delay to wait; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.current;
        self.current = (self.current * 2).min(self.cap);

        let half = ceiling / 2;
        let jitter = ceiling - half;
        if jitter.is_zero() {
            return ceiling;
        }
        half + Duration::from_nanos(rand::thread_rng().gen_range(0..=jitter.as_nanos() as u64))
    }

    /// Call after a successful attempt so the next failure starts over.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
