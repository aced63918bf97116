//! Timing for credential renewal and retries.

use rand::Rng;
use std::time::Duration;

/// Computes how long to wait before renewing a lease of the given duration.
///
/// Renewal is scheduled at roughly two thirds of the lease, jittered to between half and five
/// sixths of it so that many instances holding the same kind of lease do not renew in lockstep.
/// The result is always strictly positive.
pub fn renewal_delay<R: Rng + ?Sized>(lease: Duration, rng: &mut R) -> Duration {
    let jitter = rng.gen::<f64>();
    let secs = lease.as_secs_f64() * 2.0 / 3.0 * (jitter + 1.5) / 2.0;
    Duration::from_secs_f64(secs).max(Duration::from_nanos(1))
}

/// Bounded exponential backoff.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ExponentialBackoff {
    min: Duration,
    max: Duration,
    jitter: f64,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid backoff: {0}")]
pub struct InvalidBackoff(&'static str);

// === impl ExponentialBackoff ===

impl ExponentialBackoff {
    /// Creates a backoff that starts at `min` and doubles on each attempt up to `max`.
    ///
    /// `jitter` is the fraction, in `[0, 1]`, of each delay that may be randomly shaved off.
    pub fn new(min: Duration, max: Duration, jitter: f64) -> Result<Self, InvalidBackoff> {
        if min.is_zero() {
            return Err(InvalidBackoff("minimum must be positive"));
        }
        if max < min {
            return Err(InvalidBackoff("maximum must not be less than the minimum"));
        }
        if !(0.0..=1.0).contains(&jitter) {
            return Err(InvalidBackoff("jitter must be in [0, 1]"));
        }
        Ok(Self { min, max, jitter })
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Returns the delay before retrying after `attempt` consecutive failures (starting at zero).
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let factor = 2f64.powi(attempt.min(64) as i32);
        let base = (self.min.as_secs_f64() * factor).min(self.max.as_secs_f64());
        let jitter = if self.jitter > 0.0 {
            1.0 - self.jitter * rng.gen::<f64>()
        } else {
            1.0
        };
        Duration::from_secs_f64(base * jitter).max(Duration::from_nanos(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn renewal_within_bounds() {
        let lease = Duration::from_secs(60 * 60);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10_000 {
            let d = renewal_delay(lease, &mut rng);
            assert!(d >= Duration::from_secs(30 * 60), "{:?}", d);
            assert!(d < Duration::from_secs(50 * 60), "{:?}", d);
        }
    }

    #[test]
    fn renewal_is_strictly_positive() {
        let mut rng = StdRng::seed_from_u64(1);
        for nanos in [1u64, 2, 3, 1_000] {
            let d = renewal_delay(Duration::from_nanos(nanos), &mut rng);
            assert!(d > Duration::ZERO);
        }
        for secs in [1u64, 60, 900, 86_400] {
            let lease = Duration::from_secs(secs);
            let d = renewal_delay(lease, &mut rng);
            assert!(d > Duration::ZERO && d < lease, "{:?} for {:?}", d, lease);
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let delays = (0..8)
            .map(|a| backoff.delay(a, &mut rng).as_secs())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(backoff.delay(u32::MAX, &mut rng), Duration::from_secs(30));
    }

    #[test]
    fn backoff_jitter_only_shortens() {
        let backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10), 0.5).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for attempt in 0..10 {
            let d = backoff.delay(attempt, &mut rng);
            let base = Duration::from_secs((1u64 << attempt).min(10));
            assert!(d <= base && d >= base / 2, "{:?} vs {:?}", d, base);
        }
    }

    #[test]
    fn invalid_backoff() {
        assert!(ExponentialBackoff::new(Duration::ZERO, Duration::from_secs(1), 0.0).is_err());
        assert!(
            ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(1), 0.0).is_err()
        );
        assert!(
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(1), 1.5).is_err()
        );
    }
}
