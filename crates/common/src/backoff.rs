use std::time::Duration;

use rand::Rng;

/// Retry pacing for the background workers: the window doubles on every
/// consecutive failure up to a cap, and the actual delay is drawn uniformly
/// from the window so a fleet of stalled workers does not thunder back in
/// step.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self {
            initial,
            cap,
            consecutive_failures: 0,
        }
    }

    /// Record a failure and pick the delay before the next attempt.
    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        let exponent = self.consecutive_failures.min(31);
        self.consecutive_failures += 1;
        let window = self.initial.saturating_mul(1 << exponent).min(self.cap);
        window.mul_f64(rng.random::<f64>())
    }

    /// The work succeeded; the next failure starts a fresh window.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    use super::Backoff;

    #[test]
    fn test_window_doubles_up_to_cap() {
        let initial = Duration::from_secs(1);
        let cap = Duration::from_secs(8);
        let mut backoff = Backoff::new(initial, cap);
        let mut rng = ChaCha12Rng::seed_from_u64(7);

        for failures in 0..20u32 {
            let delay = backoff.fail(&mut rng);
            let window = initial
                .saturating_mul(1 << failures.min(31))
                .min(cap);
            assert!(
                delay <= window,
                "attempt {failures}: {delay:?} exceeds window {window:?}"
            );
            assert!(delay <= cap);
        }
    }

    #[test]
    fn test_reset_restarts_the_window() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(64));
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        for _ in 0..6 {
            backoff.fail(&mut rng);
        }
        backoff.reset();
        // Back inside the first window.
        assert!(backoff.fail(&mut rng) <= Duration::from_secs(1));
    }
}
