use std::time::Duration;

/// Capped exponential backoff applied between worker restarts.
///
/// The first restart waits `first`; each consecutive failure multiplies the
/// previous delay by `factor` up to `max`. A run that stays alive for at
/// least `stable_after` resets the schedule to `first`.
#[derive(Clone, Copy, Debug)]
pub struct BackoffStrategy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub stable_after: Duration,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            stable_after: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        match prev {
            None => self.first,
            Some(d) => {
                let next = (d.as_secs_f64() * self.factor).min(self.max.as_secs_f64());
                Duration::from_secs_f64(next)
            }
        }
    }

    /// Whether a run that lasted `uptime` clears the accumulated delay.
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.stable_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_to_cap() {
        let s = BackoffStrategy::default();
        let mut prev = None;
        let expected: [u64; 8] = [1, 2, 4, 8, 16, 32, 60, 60];
        for want in expected {
            let d = s.next(prev);
            assert_eq!(d, Duration::from_secs(want));
            prev = Some(d);
        }
    }

    #[test]
    fn stable_run_resets() {
        let s = BackoffStrategy::default();
        assert!(!s.is_stable(Duration::from_secs(29)));
        assert!(s.is_stable(Duration::from_secs(30)));
        // After a reset the caller passes None again.
        assert_eq!(s.next(None), Duration::from_secs(1));
    }
}
