//! Recovery planning after a classified failure.
//!
//! Pure functions: given the policy of the active error category, the
//! attempt that just failed and the parameters it ran with, decide whether
//! to resubmit, with what, and after how long.

use std::time::Duration;

use kiln_core::adjuster::shrink;
use kiln_core::classifier::{ErrorCategory, RecoveryPolicy, RecoveryStrategy};
use kiln_core::job::JobError;
use kiln_core::params::GenerationParams;

/// A classified failure of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub category: ErrorCategory,
    pub message: String,
}

impl Failure {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl From<Failure> for JobError {
    fn from(failure: Failure) -> Self {
        JobError {
            category: failure.category,
            message: failure.message,
        }
    }
}

/// Why recovery gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUp {
    /// The category's strategy is `abort`.
    Aborted,
    /// The category's retry budget is spent.
    Exhausted,
}

/// Outcome of recovery planning.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryPlan {
    Fail(GiveUp),
    Resubmit {
        delay: Duration,
        parameters: GenerationParams,
    },
}

/// Exponential backoff before retry number `attempt`: `min(unit * 2^attempt, cap)`.
pub fn backoff_delay(attempt: u32, unit: Duration, cap: Duration) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    unit.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Decide what follows failed attempt number `attempt` (1-based).
///
/// Attempt `n` is retry number `n - 1`; a category allows `max_retries`
/// retries, so attempt `max_retries + 1` is the last one.
pub fn plan_recovery(
    policy: &RecoveryPolicy,
    attempt: u32,
    parameters: &GenerationParams,
    backoff_unit: Duration,
    backoff_cap: Duration,
) -> RecoveryPlan {
    if policy.strategy == RecoveryStrategy::Abort {
        return RecoveryPlan::Fail(GiveUp::Aborted);
    }
    if attempt.saturating_sub(1) >= policy.max_retries {
        return RecoveryPlan::Fail(GiveUp::Exhausted);
    }

    match policy.strategy {
        RecoveryStrategy::ShrinkParameters => RecoveryPlan::Resubmit {
            delay: Duration::ZERO,
            parameters: shrink(parameters, &policy.adjustments),
        },
        RecoveryStrategy::RetryWithBackoff => RecoveryPlan::Resubmit {
            delay: backoff_delay(attempt, backoff_unit, backoff_cap),
            parameters: parameters.clone(),
        },
        RecoveryStrategy::SwitchResource => RecoveryPlan::Resubmit {
            delay: Duration::ZERO,
            parameters: parameters.clone(),
        },
        RecoveryStrategy::Abort => RecoveryPlan::Fail(GiveUp::Aborted),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use kiln_core::classifier::ErrorClassifier;
    use kiln_core::params::ParamValue;

    use super::*;

    const UNIT: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(30);

    fn params() -> GenerationParams {
        GenerationParams::from([
            ("width".to_string(), ParamValue::Int(1024)),
            ("steps".to_string(), ParamValue::Int(40)),
            ("prompt".to_string(), ParamValue::Text("fox".into())),
        ])
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let delays: Vec<u64> = (1..=6).map(|a| backoff_delay(a, UNIT, CAP).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff_delay(200, UNIT, CAP), CAP);
    }

    #[test]
    fn abort_fails_on_first_attempt() {
        let classifier = ErrorClassifier::default();
        let policy = classifier.policy_for(ErrorCategory::MissingDependency);
        assert_eq!(
            plan_recovery(policy, 1, &params(), UNIT, CAP),
            RecoveryPlan::Fail(GiveUp::Aborted)
        );
    }

    #[test]
    fn backoff_budget_allows_max_retries_resubmissions() {
        let classifier = ErrorClassifier::default();
        let policy = classifier.policy_for(ErrorCategory::TransientTimeout);
        assert_eq!(policy.max_retries, 2);

        assert_matches!(
            plan_recovery(policy, 1, &params(), UNIT, CAP),
            RecoveryPlan::Resubmit { delay, parameters } if delay == Duration::from_secs(2) && parameters == params()
        );
        assert_matches!(plan_recovery(policy, 2, &params(), UNIT, CAP), RecoveryPlan::Resubmit { .. });
        assert_eq!(
            plan_recovery(policy, 3, &params(), UNIT, CAP),
            RecoveryPlan::Fail(GiveUp::Exhausted)
        );
    }

    #[test]
    fn unknown_gets_one_retry() {
        let classifier = ErrorClassifier::default();
        let (category, policy) = classifier.classify("something odd happened");
        assert_eq!(category, ErrorCategory::Unknown);
        assert_matches!(plan_recovery(policy, 1, &params(), UNIT, CAP), RecoveryPlan::Resubmit { .. });
        assert_matches!(plan_recovery(policy, 2, &params(), UNIT, CAP), RecoveryPlan::Fail(_));
    }

    #[test]
    fn shrink_resubmits_immediately_with_smaller_parameters() {
        let classifier = ErrorClassifier::default();
        let policy = classifier.policy_for(ErrorCategory::ResourceExhaustion);

        let RecoveryPlan::Resubmit { delay, parameters } =
            plan_recovery(policy, 1, &params(), UNIT, CAP)
        else {
            panic!("expected resubmission");
        };
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(parameters["width"], ParamValue::Int(768));
        assert_eq!(parameters["steps"], ParamValue::Int(30));
        assert_eq!(parameters["prompt"], ParamValue::Text("fox".into()));
    }

    #[test]
    fn switch_resource_keeps_parameters() {
        let policy = RecoveryPolicy::new(RecoveryStrategy::SwitchResource, 1);
        assert_eq!(
            plan_recovery(&policy, 1, &params(), UNIT, CAP),
            RecoveryPlan::Resubmit {
                delay: Duration::ZERO,
                parameters: params()
            }
        );
    }
}
