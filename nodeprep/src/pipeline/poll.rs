//! Bounded, schedule-driven polling of external state.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

/// Wait schedule for a poll: one immediate check, then one check after each wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Waits between checks, in order.
    pub schedule: Vec<Duration>,
}

impl Default for PollPolicy {
    /// The two-phase verification schedule: a quick recheck, then an
    /// extended grace period.
    fn default() -> Self {
        Self::from_secs(&[60, 120])
    }
}

impl PollPolicy {
    /// Creates a policy from an explicit schedule.
    #[must_use]
    pub fn new(schedule: Vec<Duration>) -> Self {
        Self { schedule }
    }

    /// Creates a policy from waits expressed in seconds.
    #[must_use]
    pub fn from_secs(secs: &[u64]) -> Self {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// A policy that checks exactly once.
    #[must_use]
    pub fn immediate() -> Self {
        Self::new(Vec::new())
    }

    /// Upper bound on the number of condition evaluations.
    #[must_use]
    pub fn max_checks(&self) -> usize {
        self.schedule.len() + 1
    }

    /// Sum of all waits.
    #[must_use]
    pub fn total_wait(&self) -> Duration {
        self.schedule.iter().sum()
    }
}

/// Result of a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The condition held on the given check (1-based).
    Success {
        /// Number of checks performed.
        checks: usize,
    },
    /// The schedule was exhausted.
    TimedOut {
        /// Number of checks performed.
        checks: usize,
    },
}

impl PollOutcome {
    /// Returns true if the condition held.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Number of checks performed.
    #[must_use]
    pub fn checks(&self) -> usize {
        match self {
            Self::Success { checks } | Self::TimedOut { checks } => *checks,
        }
    }
}

/// Pull-based poller driven by a [`PollPolicy`].
#[derive(Debug, Clone, Default)]
pub struct VerificationPoller {
    policy: PollPolicy,
}

impl VerificationPoller {
    /// Creates a poller for the given policy.
    #[must_use]
    pub fn new(policy: PollPolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy.
    #[must_use]
    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Polls `check` until it returns true or the schedule runs out.
    ///
    /// The condition is evaluated at most `schedule.len() + 1` times.
    pub async fn poll<F, Fut>(&self, mut check: F) -> PollOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let mut checks = 1;
        if check().await {
            return PollOutcome::Success { checks };
        }

        for wait in &self.policy.schedule {
            debug!(
                wait_secs = wait.as_secs_f64(),
                checks,
                "Condition not met, waiting before next check"
            );
            tokio::time::sleep(*wait).await;

            checks += 1;
            if check().await {
                info!(checks, "Condition met");
                return PollOutcome::Success { checks };
            }
        }

        PollOutcome::TimedOut { checks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_policy_is_two_phase() {
        let policy = PollPolicy::default();
        assert_eq!(
            policy.schedule,
            vec![Duration::from_secs(60), Duration::from_secs(120)]
        );
        assert_eq!(policy.max_checks(), 3);
        assert_eq!(policy.total_wait(), Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_bounded_when_never_true() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let poller = VerificationPoller::new(PollPolicy::from_secs(&[60, 120]));
        let started = tokio::time::Instant::now();

        let outcome = poller
            .poll(|| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    false
                }
            })
            .await;

        assert_eq!(outcome, PollOutcome::TimedOut { checks: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_immediate_success_does_not_wait() {
        let poller = VerificationPoller::new(PollPolicy::from_secs(&[60, 120]));
        let started = tokio::time::Instant::now();

        let outcome = poller.poll(|| async { true }).await;

        assert_eq!(outcome, PollOutcome::Success { checks: 1 });
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_succeeds_after_first_wait() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let poller = VerificationPoller::new(PollPolicy::from_secs(&[10, 300]));
        let started = tokio::time::Instant::now();

        let outcome = poller
            .poll(|| {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) + 1 >= 2 }
            })
            .await;

        assert_eq!(outcome, PollOutcome::Success { checks: 2 });
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10));
        assert!(elapsed < Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_immediate_policy_checks_once() {
        let outcome = VerificationPoller::new(PollPolicy::immediate())
            .poll(|| async { false })
            .await;
        assert_eq!(outcome, PollOutcome::TimedOut { checks: 1 });
        assert_eq!(outcome.checks(), 1);
    }
}
