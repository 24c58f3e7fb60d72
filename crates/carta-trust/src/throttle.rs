//! Backoff between failed reputation requests.

use tracing::debug;

/// Refuses new checks for a grace period after a failure. The period starts
/// at `min_secs` and doubles with each consecutive failure up to `max_secs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestThrottler {
    min_secs: u64,
    max_secs: u64,
    grace_secs: u64,
    last_failure: Option<u64>,
}

impl RequestThrottler {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        Self {
            min_secs,
            max_secs: max_secs.max(min_secs),
            grace_secs: min_secs,
            last_failure: None,
        }
    }

    /// Records a failure at `now` (seconds) and widens the grace period.
    pub fn request_failed(&mut self, now: u64) {
        self.grace_secs = match self.last_failure {
            None => self.min_secs,
            Some(_) => self.grace_secs.saturating_mul(2).min(self.max_secs),
        };
        self.last_failure = Some(now);
        debug!(grace_secs = self.grace_secs, "sitecheck request throttled");
    }

    pub fn request_succeeded(&mut self) {
        self.grace_secs = self.min_secs;
        self.last_failure = None;
    }

    pub fn allow_request_now(&self, now: u64) -> bool {
        self.last_failure
            .is_none_or(|failed| now >= failed.saturating_add(self.grace_secs))
    }

    pub fn grace_period(&self) -> u64 {
        self.grace_secs
    }
}

#[cfg(test)]
mod tests {
    use super::RequestThrottler;

    #[test]
    fn fresh_throttler_allows_requests() {
        let throttler = RequestThrottler::new(240, 3840);
        assert!(throttler.allow_request_now(0));
        assert_eq!(throttler.grace_period(), 240);
    }

    #[test]
    fn grace_doubles_up_to_the_cap() {
        let mut throttler = RequestThrottler::new(240, 3840);
        let mut now = 1_000;
        for failures in 1..=7_u32 {
            throttler.request_failed(now);
            let expected = (240_u64 << (failures - 1)).min(3840);
            assert_eq!(throttler.grace_period(), expected, "after {failures} failures");
            assert!(!throttler.allow_request_now(now));
            assert!(!throttler.allow_request_now(now + expected - 1));
            assert!(throttler.allow_request_now(now + expected));
            now += expected;
        }
    }

    #[test]
    fn success_resets_the_backoff() {
        let mut throttler = RequestThrottler::new(240, 3840);
        throttler.request_failed(0);
        throttler.request_failed(240);
        assert_eq!(throttler.grace_period(), 480);

        throttler.request_succeeded();
        assert!(throttler.allow_request_now(241));
        throttler.request_failed(1_000);
        assert_eq!(throttler.grace_period(), 240);
    }
}
