//! Failure classification and backoff schedule for upstream errors.

use std::time::{Duration, SystemTime};

use crate::{config::RetrySettings, upstream::UpstreamError};

/// What to do with claimed intents after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Leave in `failed`, claimable again at the given time.
    RetryAt(SystemTime),
    /// Leave in terminal `failed` for operator inspection.
    GiveUp,
    /// Quarantine every outstanding intent of the actor.
    Quarantine,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    unavailable_cooldown: Duration,
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            base_delay: settings.base_delay(),
            max_delay: settings.max_delay(),
            max_attempts: settings.max_attempts,
            unavailable_cooldown: settings.unavailable_cooldown(),
        }
    }

    /// Delay before the next attempt after `attempt` failures: base, 2×base, 4×base… capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Decide the follow-up for `error`. For transient errors `attempt` is the number of
    /// transient failures including this one; other classes ignore it.
    ///
    /// Throttling and maintenance windows always reschedule.
    pub fn classify(&self, error: &UpstreamError, attempt: u32, now: SystemTime) -> FailureAction {
        match error {
            UpstreamError::RateLimited { resume_at } => FailureAction::RetryAt((*resume_at).max(now)),
            UpstreamError::ServiceUnavailable { .. } => {
                FailureAction::RetryAt(now + self.unavailable_cooldown)
            }
            UpstreamError::Unauthorized { .. } => FailureAction::Quarantine,
            UpstreamError::NotFound { .. } | UpstreamError::Permanent { .. } => {
                FailureAction::GiveUp
            }
            UpstreamError::Transient { .. } if attempt >= self.max_attempts => {
                FailureAction::GiveUp
            }
            UpstreamError::Transient { .. } => FailureAction::RetryAt(now + self.backoff(attempt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(&RetrySettings::default())
    }

    fn transient() -> UpstreamError {
        UpstreamError::Transient {
            message: "502".into(),
        }
    }

    #[test]
    fn backoff_doubles_from_one_minute_and_caps_at_eight_hours() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(5), Duration::from_secs(960));
        assert_eq!(policy.backoff(9), Duration::from_secs(15_360));
        assert_eq!(policy.backoff(10), Duration::from_secs(8 * 3_600));
        assert_eq!(policy.backoff(40), Duration::from_secs(8 * 3_600));
    }

    #[test]
    fn transient_errors_give_up_after_max_attempts() {
        let policy = policy();
        let now = SystemTime::UNIX_EPOCH;
        assert_eq!(
            policy.classify(&transient(), 3, now),
            FailureAction::RetryAt(now + Duration::from_secs(240))
        );
        assert_eq!(policy.classify(&transient(), 10, now), FailureAction::GiveUp);
    }

    #[test]
    fn rate_limit_follows_upstream_resume_time() {
        let policy = policy();
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let resume_at = now + Duration::from_secs(42);
        assert_eq!(
            policy.classify(&UpstreamError::RateLimited { resume_at }, 50, now),
            FailureAction::RetryAt(resume_at)
        );

        let past = UpstreamError::RateLimited {
            resume_at: SystemTime::UNIX_EPOCH,
        };
        assert_eq!(policy.classify(&past, 1, now), FailureAction::RetryAt(now));
    }

    #[test]
    fn unavailable_uses_fixed_cooldown() {
        let now = SystemTime::UNIX_EPOCH;
        let err = UpstreamError::ServiceUnavailable {
            message: "blocked".into(),
        };
        assert_eq!(
            policy().classify(&err, 1, now),
            FailureAction::RetryAt(now + Duration::from_secs(600))
        );
    }

    #[test]
    fn authorization_and_permanent_errors_are_not_retried() {
        let now = SystemTime::UNIX_EPOCH;
        let policy = policy();
        let unauthorized = UpstreamError::Unauthorized {
            message: "401".into(),
        };
        let missing = UpstreamError::NotFound {
            message: "no such target".into(),
        };
        assert_eq!(policy.classify(&unauthorized, 1, now), FailureAction::Quarantine);
        assert_eq!(policy.classify(&missing, 1, now), FailureAction::GiveUp);
    }
}
