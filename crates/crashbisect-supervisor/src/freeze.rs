//! Hang detection from CPU samples.
//!
//! A target that is working keeps the CPU busy. When usage stays under the
//! threshold for longer than the grace window the operation is assumed to
//! have stalled before starting, and the monitor retries the trigger once
//! per window. A hang is never reported as a crash.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeDecision {
    /// CPU at or above the threshold; the quiet timer is cleared.
    Progressing,
    /// Below threshold for `elapsed`, still inside the grace window.
    Quiet { elapsed: Duration },
    /// Below threshold for longer than the grace window. The quiet timer
    /// restarts from this observation.
    Hang { elapsed: Duration },
}

#[derive(Debug, Clone)]
pub struct FreezePolicy {
    threshold_pct: f64,
    max_quiet: Duration,
    quiet_since: Option<Duration>,
}

impl FreezePolicy {
    #[must_use]
    pub const fn new(threshold_pct: f64, max_quiet: Duration) -> Self {
        Self {
            threshold_pct,
            max_quiet,
            quiet_since: None,
        }
    }

    /// Feed one CPU sample taken at `now` (clock time).
    pub fn observe(&mut self, now: Duration, cpu_pct: f64) -> FreezeDecision {
        if cpu_pct >= self.threshold_pct {
            self.quiet_since = None;
            return FreezeDecision::Progressing;
        }
        let since = *self.quiet_since.get_or_insert(now);
        let elapsed = now.saturating_sub(since);
        if elapsed > self.max_quiet {
            self.quiet_since = Some(now);
            FreezeDecision::Hang { elapsed }
        } else {
            FreezeDecision::Quiet { elapsed }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_busy_cpu_is_progressing() {
        let mut policy = FreezePolicy::new(5.0, secs(60));
        assert_eq!(policy.observe(secs(0), 80.0), FreezeDecision::Progressing);
        assert_eq!(policy.observe(secs(10), 5.0), FreezeDecision::Progressing);
    }

    #[test]
    fn test_quiet_longer_than_window_is_hang_and_restarts() {
        let mut policy = FreezePolicy::new(5.0, secs(60));
        assert_eq!(
            policy.observe(secs(0), 1.0),
            FreezeDecision::Quiet { elapsed: secs(0) }
        );
        assert_eq!(
            policy.observe(secs(60), 1.0),
            FreezeDecision::Quiet { elapsed: secs(60) }
        );
        assert_eq!(
            policy.observe(secs(70), 1.0),
            FreezeDecision::Hang { elapsed: secs(70) }
        );
        assert_eq!(
            policy.observe(secs(80), 1.0),
            FreezeDecision::Quiet { elapsed: secs(10) }
        );
    }

    #[test]
    fn test_activity_resets_quiet_timer() {
        let mut policy = FreezePolicy::new(5.0, secs(60));
        policy.observe(secs(0), 1.0);
        policy.observe(secs(50), 1.0);
        policy.observe(secs(55), 40.0);
        assert_eq!(
            policy.observe(secs(100), 1.0),
            FreezeDecision::Quiet { elapsed: secs(0) }
        );
    }

    proptest! {
        #[test]
        fn prop_hangs_are_at_least_one_window_apart(
            samples in proptest::collection::vec((1u64..20, 0.0f64..10.0), 1..200),
        ) {
            let window = secs(30);
            let mut policy = FreezePolicy::new(5.0, window);
            let mut now = Duration::ZERO;
            let mut last_hang: Option<Duration> = None;
            for (step, cpu) in samples {
                now += secs(step);
                if let FreezeDecision::Hang { elapsed } = policy.observe(now, cpu) {
                    prop_assert!(elapsed > window);
                    if let Some(prev) = last_hang {
                        prop_assert!(now - prev > window);
                    }
                    last_hang = Some(now);
                }
            }
        }
    }
}
