//! Failure classification and remediation strategy selection.
//!
//! Every stage failure is classified into an `ErrorKind`, then an ordered
//! strategy chain is consulted: the first strategy whose `can_handle` accepts
//! the kind and attempt count produces the `RecoveryDecision`. The chain ends
//! in `ManualIntervention`, which always applies — the engine never drops a
//! failure on the floor.

use std::time::Duration;

use rand::Rng;

use crate::config::RecoverySection;
use crate::errors::EngineError;

/// Classified failure kinds the strategies dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Likely to succeed on retry (rate limit, transport fault, lost write race)
    Transient,
    /// Branch integration hit conflicting edits
    MergeConflict,
    /// Verification failed; fixable with the failing output as context
    TestFailure,
    /// A stage or task exceeded its deadline. Retried like Transient, but
    /// kept distinct so repeated expiries are visible in checkpoints.
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::MergeConflict => "merge_conflict",
            Self::TestFailure => "test_failure",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

/// Map an engine error onto its recovery kind.
pub fn classify(error: &EngineError) -> ErrorKind {
    match error {
        EngineError::MergeConflict(_) => ErrorKind::MergeConflict,
        EngineError::TestFailure { .. } => ErrorKind::TestFailure,
        EngineError::StageTimeout { .. } => ErrorKind::Timeout,
        EngineError::ExternalService { retryable: true, .. } => ErrorKind::Transient,
        EngineError::StateConflict { .. } => ErrorKind::Transient,
        _ => ErrorKind::Unknown,
    }
}

/// What the engine should do about a classified failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryDecision {
    /// Name of the strategy that produced this decision
    pub strategy: &'static str,
    /// Wait before the next attempt
    pub next_attempt_delay: Duration,
    /// True when the item must stop and wait for a human
    pub escalate: bool,
}

/// One remediation policy in the ordered chain.
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this strategy applies to the failure kind at this attempt
    /// count. The count is the stage's retry counter, except for
    /// `TestFailure` where the caller passes the separate fix-attempt
    /// counter.
    fn can_handle(&self, kind: ErrorKind, attempts: u32) -> bool;

    fn decide(&self, kind: ErrorKind, attempts: u32) -> RecoveryDecision;
}

/// Exponential backoff with jitter for transient failures and timeouts.
struct Retry {
    max_retries: u32,
    base: Duration,
    cap: Duration,
}

impl RecoveryStrategy for Retry {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn can_handle(&self, kind: ErrorKind, attempts: u32) -> bool {
        matches!(kind, ErrorKind::Transient | ErrorKind::Timeout) && attempts < self.max_retries
    }

    fn decide(&self, _kind: ErrorKind, attempts: u32) -> RecoveryDecision {
        RecoveryDecision {
            strategy: self.name(),
            next_attempt_delay: backoff_with_jitter(self.base, self.cap, attempts),
            escalate: false,
        }
    }
}

/// Automated rebase/merge pass before re-entering the stage.
struct ConflictResolution {
    max_retries: u32,
}

impl RecoveryStrategy for ConflictResolution {
    fn name(&self) -> &'static str {
        "conflict_resolution"
    }

    fn can_handle(&self, kind: ErrorKind, attempts: u32) -> bool {
        kind == ErrorKind::MergeConflict && attempts < self.max_retries
    }

    fn decide(&self, _kind: ErrorKind, _attempts: u32) -> RecoveryDecision {
        RecoveryDecision {
            strategy: self.name(),
            next_attempt_delay: Duration::ZERO,
            escalate: false,
        }
    }
}

/// Route back to Implementation with failing test output attached, bounded
/// by the fix-attempt counter.
struct TestFix {
    max_fix_attempts: u32,
}

impl RecoveryStrategy for TestFix {
    fn name(&self) -> &'static str {
        "test_fix"
    }

    fn can_handle(&self, kind: ErrorKind, attempts: u32) -> bool {
        kind == ErrorKind::TestFailure && attempts < self.max_fix_attempts
    }

    fn decide(&self, _kind: ErrorKind, _attempts: u32) -> RecoveryDecision {
        RecoveryDecision {
            strategy: self.name(),
            next_attempt_delay: Duration::ZERO,
            escalate: false,
        }
    }
}

/// Fallback: stop touching the item and ask a human.
struct ManualIntervention;

impl RecoveryStrategy for ManualIntervention {
    fn name(&self) -> &'static str {
        "manual_intervention"
    }

    fn can_handle(&self, _kind: ErrorKind, _attempts: u32) -> bool {
        true
    }

    fn decide(&self, _kind: ErrorKind, _attempts: u32) -> RecoveryDecision {
        RecoveryDecision {
            strategy: self.name(),
            next_attempt_delay: Duration::ZERO,
            escalate: true,
        }
    }
}

/// `base * 2^(attempt-1)` capped, then jittered by a factor in [0.5, 1.5)
/// and capped again.
fn backoff_with_jitter(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exponent).min(cap);
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    raw.mul_f64(factor).min(cap)
}

/// Ordered strategy chain with classification.
pub struct RecoveryManager {
    strategies: Vec<Box<dyn RecoveryStrategy>>,
}

impl RecoveryManager {
    pub fn new(config: &RecoverySection) -> Self {
        Self {
            strategies: vec![
                Box::new(Retry {
                    max_retries: config.max_retries,
                    base: Duration::from_secs(config.backoff_base_secs),
                    cap: Duration::from_secs(config.backoff_cap_secs),
                }),
                Box::new(ConflictResolution {
                    max_retries: config.max_retries,
                }),
                Box::new(TestFix {
                    max_fix_attempts: config.max_fix_attempts,
                }),
                Box::new(ManualIntervention),
            ],
        }
    }

    /// Select the first applicable strategy's decision. Always returns a
    /// decision: `ManualIntervention` terminates the chain.
    pub fn select(&self, kind: ErrorKind, attempts: u32) -> RecoveryDecision {
        for strategy in &self.strategies {
            if strategy.can_handle(kind, attempts) {
                return strategy.decide(kind, attempts);
            }
        }
        // The chain always ends with a catch-all; unreachable in practice.
        ManualIntervention.decide(kind, attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RecoveryManager {
        RecoveryManager::new(&RecoverySection {
            max_retries: 3,
            max_fix_attempts: 2,
            backoff_base_secs: 2,
            backoff_cap_secs: 300,
        })
    }

    #[test]
    fn classification_covers_the_taxonomy() {
        assert_eq!(classify(&EngineError::transient("503")), ErrorKind::Transient);
        assert_eq!(
            classify(&EngineError::MergeConflict("overlapping hunks".into())),
            ErrorKind::MergeConflict
        );
        assert_eq!(
            classify(&EngineError::TestFailure {
                summary: "1 failed".into(),
                output: String::new(),
            }),
            ErrorKind::TestFailure
        );
        assert_eq!(
            classify(&EngineError::StageTimeout {
                stage: "qa".into(),
                elapsed_secs: 10,
            }),
            ErrorKind::Timeout
        );
        assert_eq!(classify(&EngineError::permanent("bad request")), ErrorKind::Unknown);
        assert_eq!(
            classify(&EngineError::Configuration("missing".into())),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn transient_retries_until_the_bound() {
        let manager = manager();

        for attempts in 1..3 {
            let decision = manager.select(ErrorKind::Transient, attempts);
            assert_eq!(decision.strategy, "retry");
            assert!(!decision.escalate);
        }
    }

    #[test]
    fn exhausted_retries_fall_through_to_manual_intervention() {
        let manager = manager();
        let decision = manager.select(ErrorKind::Transient, 3);
        assert_eq!(decision.strategy, "manual_intervention");
        assert!(decision.escalate);
    }

    #[test]
    fn timeout_is_retried_like_transient() {
        let manager = manager();
        let decision = manager.select(ErrorKind::Timeout, 1);
        assert_eq!(decision.strategy, "retry");
    }

    #[test]
    fn merge_conflict_routes_to_conflict_resolution() {
        let manager = manager();
        let decision = manager.select(ErrorKind::MergeConflict, 1);
        assert_eq!(decision.strategy, "conflict_resolution");
        assert!(!decision.escalate);
        assert_eq!(decision.next_attempt_delay, Duration::ZERO);
    }

    #[test]
    fn test_failure_uses_the_separate_fix_bound() {
        let manager = manager();

        let decision = manager.select(ErrorKind::TestFailure, 1);
        assert_eq!(decision.strategy, "test_fix");

        // fix-attempt bound (2) is lower than max_retries (3)
        let decision = manager.select(ErrorKind::TestFailure, 2);
        assert_eq!(decision.strategy, "manual_intervention");
        assert!(decision.escalate);
    }

    #[test]
    fn unknown_goes_straight_to_manual_intervention() {
        let manager = manager();
        let decision = manager.select(ErrorKind::Unknown, 0);
        assert_eq!(decision.strategy, "manual_intervention");
        assert!(decision.escalate);
    }

    #[test]
    fn backoff_grows_and_respects_the_cap() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(300);

        for attempt in 1..=10 {
            let delay = backoff_with_jitter(base, cap, attempt);
            assert!(delay <= cap, "attempt {}: {:?} exceeds cap", attempt, delay);
        }

        // First attempt is jittered around the base: within [base/2, base*1.5]
        let first = backoff_with_jitter(base, cap, 1);
        assert!(first >= base / 2);
        assert!(first <= base * 3 / 2);
    }
}
