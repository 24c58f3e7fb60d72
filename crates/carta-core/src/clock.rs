//! Injectable wall clock.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Time source measured as a duration since the Unix epoch.
pub trait Clock {
    fn now(&self) -> Duration;

    fn now_secs(&self) -> u64 {
        self.now().as_secs()
    }
}

/// Reads the operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        // A clock before 1970 is treated as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// Hand-driven clock for deterministic expiry and throttling.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn at_secs(secs: u64) -> Self {
        Self {
            now: Rc::new(Cell::new(Duration::from_secs(secs))),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get().saturating_add(by));
    }

    pub fn set(&self, to: Duration) {
        self.now.set(to);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::Clock;
    use super::ManualClock;
    use std::time::Duration;

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::at_secs(100);
        let view = clock.clone();
        clock.advance(Duration::from_secs(5));
        assert_eq!(view.now_secs(), 105);
    }
}
