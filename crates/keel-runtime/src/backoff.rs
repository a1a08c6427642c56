//! Retry backoff with jitter.
//!
//! Exponential delay with jitter to keep contending clients from
//! retrying in lockstep. Every knob lives on the policy struct.

use std::time::Duration;

use rand::Rng;

/// Configurable backoff policy for sync retries.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Multiplier applied per attempt.
    pub multiplier: f64,
    /// Jitter fraction of the computed delay (0.25 → ±25%).
    pub jitter: f64,
    /// Attempts before a round is abandoned and rescheduled.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given 0-based attempt, jittered.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(32) as i32);
        let base = self.initial.as_secs_f64() * exp;
        let base = base.min(self.max.as_secs_f64());
        let spread = base * self.jitter;
        let jittered = if spread > 0.0 {
            let offset = rand::rng().random_range(-spread..=spread);
            (base + offset).max(0.0)
        } else {
            base
        };
        Duration::from_secs_f64(jittered.min(self.max.as_secs_f64()))
    }

    /// Whether another retry is allowed after `attempt` failures.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        // Far past the cap.
        assert_eq!(policy.delay(30), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = BackoffPolicy::default();
        for attempt in 0..8 {
            let base = BackoffPolicy {
                jitter: 0.0,
                ..policy.clone()
            }
            .delay(attempt)
            .as_secs_f64();
            for _ in 0..32 {
                let d = policy.delay(attempt).as_secs_f64();
                assert!(d >= base * 0.74 && d <= (base * 1.26).min(30.0));
            }
        }
    }

    #[test]
    fn retry_budget() {
        let policy = BackoffPolicy {
            max_retries: 3,
            ..BackoffPolicy::default()
        };
        assert!(policy.allows(0));
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }
}
