use rand::Rng;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Growing retry pacing for navigation against the listing domain.
///
/// The delay doubles per attempt from `base` up to `max`, with up to
/// `jitter_percent` percent of random spread on top so workers retrying
/// the same outage do not align.
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let capped = base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(20)))
            .min(self.max.as_millis() as u64);
        let jitter = if self.jitter_percent > 0 {
            rand::thread_rng().gen_range(0..capped * self.jitter_percent / 100 + 1)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Uniform random pause drawn from a bounds pair, used between tab
/// creations for human-like pacing.
pub fn uniform_pause(bounds: (Duration, Duration)) -> Duration {
    let (min, max) = bounds;
    if max <= min {
        return min;
    }
    let range: RangeInclusive<u64> = min.as_millis() as u64..=max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(range))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(10))
                .with_jitter(0);
        assert_eq!(backoff.delay(0).as_millis(), 100);
        assert_eq!(backoff.delay(1).as_millis(), 200);
        assert_eq!(backoff.delay(2).as_millis(), 400);
    }

    #[test]
    fn delay_caps_at_max() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1))
                .with_jitter(0);
        assert!(backoff.delay(10) <= Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(1000), Duration::from_secs(10));
        for attempt in 0..3 {
            let plain = ExponentialBackoff::new(
                Duration::from_millis(1000),
                Duration::from_secs(10),
            )
            .with_jitter(0)
            .delay(attempt);
            let jittered = backoff.delay(attempt);
            assert!(jittered >= plain);
            assert!(jittered <= plain + plain / 10 + Duration::from_millis(1));
        }
    }

    #[test]
    fn uniform_pause_stays_in_bounds() {
        let bounds = (Duration::from_millis(1000), Duration::from_millis(3000));
        for _ in 0..100 {
            let pause = uniform_pause(bounds);
            assert!(pause >= bounds.0 && pause <= bounds.1);
        }
    }

    #[test]
    fn degenerate_bounds_return_min() {
        let d = Duration::from_millis(500);
        assert_eq!(uniform_pause((d, d)), d);
    }
}
