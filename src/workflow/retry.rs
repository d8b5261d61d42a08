use crate::shared::errors::PipelineError;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with uniform jitter. Delay for attempt `k`
/// (0-indexed) is `min(base * 2^k + jitter, cap)` where jitter is drawn
/// uniformly from +/-25% of `base * 2^k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = (self.base_ms as f64) * 2f64.powi(attempt.min(31) as i32);
        let jitter = rand::thread_rng().gen_range(-0.25..=0.25) * exp;
        let delay = (exp + jitter).max(0.0).min(self.cap_ms as f64);
        Duration::from_millis(delay as u64)
    }

    /// Whether attempt `attempt` (0-indexed, already failed) may be
    /// followed by another try.
    pub fn should_retry(&self, attempt: u32, error: &PipelineError) -> bool {
        attempt + 1 < self.max_attempts && error.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_within_the_jitter_envelope() {
        let policy = RetryPolicy {
            base_ms: 1_000,
            cap_ms: 60_000,
            max_attempts: 5,
        };
        for attempt in 0..4u32 {
            let exp = 1_000u64 * 2u64.pow(attempt);
            let low = (exp as f64 * 0.75) as u64;
            let high = (exp as f64 * 1.25) as u64;
            for _ in 0..50 {
                let delay = policy.delay_for_attempt(attempt).as_millis() as u64;
                assert!(
                    delay >= low && delay <= high.min(60_000),
                    "attempt {attempt} delay {delay} outside [{low}, {high}]"
                );
            }
        }
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy {
            base_ms: 1_000,
            cap_ms: 2_500,
            max_attempts: 10,
        };
        for _ in 0..20 {
            assert!(policy.delay_for_attempt(8).as_millis() as u64 <= 2_500);
        }
    }

    #[test]
    fn non_retryable_kinds_are_refused() {
        let policy = RetryPolicy::default();
        let invalid = PipelineError::InvalidTransition {
            from: "inbox".to_string(),
            to: "done".to_string(),
        };
        assert!(!policy.should_retry(0, &invalid));

        let lock = PipelineError::LockTimeout {
            stem: "s".to_string(),
            waited_ms: 10,
        };
        assert!(policy.should_retry(0, &lock));
        assert!(!policy.should_retry(4, &lock), "attempts are bounded");
    }
}
