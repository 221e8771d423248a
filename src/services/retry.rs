use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

use crate::models::job::Job;

/// Delay between email delivery attempts.
pub const EMAIL_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

/// First payment-charge retry delay; doubles per attempt.
pub const CHARGE_RETRY_BASE: Duration = Duration::from_secs(60);

/// Upper bound on a single payment-charge retry delay.
pub const CHARGE_RETRY_CAP: Duration = Duration::from_secs(60 * 60);

/// How a failed job is rescheduled.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Same delay after every failure.
    Fixed(Duration),
    /// `min(base * 2^attempts, cap)` plus uniform jitter in `[0, jitter)`.
    Exponential {
        base: Duration,
        cap: Duration,
        jitter: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Reschedule(DateTime<Utc>),
    GiveUp,
}

impl RetryPolicy {
    pub fn email() -> Self {
        Self::Fixed(EMAIL_RETRY_DELAY)
    }

    pub fn charge() -> Self {
        Self::Exponential {
            base: CHARGE_RETRY_BASE,
            cap: CHARGE_RETRY_CAP,
            jitter: Duration::ZERO,
        }
    }

    /// Decide the fate of `job` after a failed attempt.
    ///
    /// `job.attempts` already counts the attempt that just failed.
    pub fn next_attempt(&self, job: &Job, now: DateTime<Utc>) -> RetryDecision {
        if job.attempts_exhausted() {
            return RetryDecision::GiveUp;
        }
        let delay = self.delay_for(job.attempts);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        match now.checked_add_signed(delay) {
            Some(at) => RetryDecision::Reschedule(at),
            None => RetryDecision::GiveUp,
        }
    }

    /// Delay before the next attempt once `attempts` attempts have failed.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, cap, jitter } => {
                let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
                let backoff = base.checked_mul(factor).unwrap_or(*cap).min(*cap);
                backoff + random_jitter(*jitter)
            }
        }
    }
}

fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_attempts(attempts: u32, max_attempts: u32) -> Job {
        let now = Utc::now();
        let mut job = Job::new("retry-charge", serde_json::json!({}), now, max_attempts, now);
        job.attempts = attempts;
        job
    }

    #[test]
    fn test_fixed_policy_ignores_attempt_count() {
        let policy = RetryPolicy::email();
        assert_eq!(policy.delay_for(1), Duration::from_secs(300));
        assert_eq!(policy.delay_for(2), Duration::from_secs(300));
    }

    #[test]
    fn test_exponential_policy_doubles_then_caps() {
        let policy = RetryPolicy::charge();
        assert_eq!(policy.delay_for(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for(2), Duration::from_secs(240));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1920));
        assert_eq!(policy.delay_for(6), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(40), Duration::from_secs(3600));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy::Exponential {
            base: Duration::from_secs(60),
            cap: Duration::from_secs(3600),
            jitter: Duration::from_secs(60),
        };
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_secs(120));
            assert!(delay < Duration::from_secs(180));
        }
    }

    #[test]
    fn test_gives_up_once_attempts_reach_ceiling() {
        let policy = RetryPolicy::email();
        let now = Utc::now();
        assert_eq!(
            policy.next_attempt(&job_with_attempts(3, 3), now),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.next_attempt(&job_with_attempts(2, 3), now),
            RetryDecision::Reschedule(now + chrono::Duration::minutes(5))
        );
    }
}
