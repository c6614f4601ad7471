//! Failure classification and recovery policies.
//!
//! [`ErrorClassifier::classify`] maps a free-form failure message to an
//! [`ErrorCategory`] and the [`RecoveryPolicy`] attached to it. Matching is
//! case-insensitive and walks the pattern table in declaration order; the
//! first matching pattern wins. Messages nothing matches fall back to the
//! `unknown` pattern, which allows a single retry.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::adjuster::{AdjustmentRule, AdjustmentRules};

// ---------------------------------------------------------------------------
// Categories and strategies
// ---------------------------------------------------------------------------

/// Finite vocabulary of failure reasons exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    ResourceExhaustion,
    TransientTimeout,
    MissingDependency,
    TransientNetwork,
    ResourceExhaustedStorage,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ResourceExhaustion => "resource-exhaustion",
            ErrorCategory::TransientTimeout => "transient-timeout",
            ErrorCategory::MissingDependency => "missing-dependency",
            ErrorCategory::TransientNetwork => "transient-network",
            ErrorCategory::ResourceExhaustedStorage => "resource-exhausted-storage",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Parse from the kebab-case form, defaulting to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "resource-exhaustion" => ErrorCategory::ResourceExhaustion,
            "transient-timeout" => ErrorCategory::TransientTimeout,
            "missing-dependency" => ErrorCategory::MissingDependency,
            "transient-network" => ErrorCategory::TransientNetwork,
            "resource-exhausted-storage" => ErrorCategory::ResourceExhaustedStorage,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator does after a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryStrategy {
    /// Wait `min(2^attempt, cap)` seconds and resubmit unchanged.
    RetryWithBackoff,
    /// Shrink the parameter set with the policy's adjustments and resubmit.
    ShrinkParameters,
    /// Resubmit immediately so the engine can place the work elsewhere.
    SwitchResource,
    /// Give up; the job fails.
    Abort,
}

/// Recovery behaviour attached to an error category.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    pub strategy: RecoveryStrategy,
    /// Number of resubmissions allowed after the first attempt.
    pub max_retries: u32,
    /// Adjustments used by [`RecoveryStrategy::ShrinkParameters`].
    pub adjustments: AdjustmentRules,
}

impl RecoveryPolicy {
    pub fn new(strategy: RecoveryStrategy, max_retries: u32) -> Self {
        Self {
            strategy,
            max_retries,
            adjustments: AdjustmentRules::new(),
        }
    }

    pub fn with_adjustment(mut self, key: &str, rule: AdjustmentRule) -> Self {
        self.adjustments.insert(key.to_string(), rule);
        self
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// One text-matching rule of an [`ErrorPattern`].
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Case-insensitive substring. Stored lowercased.
    Contains(String),
    /// Regular expression, evaluated against the raw message.
    Pattern(Regex),
}

impl Matcher {
    pub fn contains(needle: &str) -> Self {
        Matcher::Contains(needle.to_lowercase())
    }

    fn is_match(&self, raw: &str, lowered: &str) -> bool {
        match self {
            Matcher::Contains(needle) => lowered.contains(needle.as_str()),
            Matcher::Pattern(re) => re.is_match(raw),
        }
    }
}

/// Static classification rule: matchers plus the policy they select.
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub category: ErrorCategory,
    pub matchers: Vec<Matcher>,
    pub policy: RecoveryPolicy,
}

impl ErrorPattern {
    pub fn new(category: ErrorCategory, policy: RecoveryPolicy) -> Self {
        Self {
            category,
            matchers: Vec::new(),
            policy,
        }
    }

    pub fn matching(mut self, needles: &[&str]) -> Self {
        self.matchers
            .extend(needles.iter().map(|needle| Matcher::contains(needle)));
        self
    }

    pub fn matching_regex(mut self, re: Regex) -> Self {
        self.matchers.push(Matcher::Pattern(re));
        self
    }

    fn is_match(&self, raw: &str, lowered: &str) -> bool {
        self.matchers.iter().any(|m| m.is_match(raw, lowered))
    }
}

/// `oom` as a whole word, so "room" or "zoom" do not count.
static OOM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\boom\b").expect("valid regex"));

/// 5xx status codes next to a status-ish word, e.g. "error (503)" or "HTTP 502".
static SERVER_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:status|error|http)\W{0,3}5\d\d\b").expect("valid regex")
});

/// The built-in rule table, in matching order.
pub fn default_patterns() -> Vec<ErrorPattern> {
    vec![
        ErrorPattern::new(
            ErrorCategory::ResourceExhaustion,
            RecoveryPolicy::new(RecoveryStrategy::ShrinkParameters, 3)
                .with_adjustment("width", AdjustmentRule::reduce(0.75, 256))
                .with_adjustment("height", AdjustmentRule::reduce(0.75, 256))
                .with_adjustment("steps", AdjustmentRule::reduce(0.75, 10))
                .with_adjustment("batch_size", AdjustmentRule::divide(2.0, 1))
                .with_adjustment("frame_count", AdjustmentRule::divide(2.0, 8)),
        )
        .matching(&[
            "out of memory",
            "outofmemory",
            "cannot allocate memory",
            "memory allocation",
            "insufficient memory",
            "resource exhausted",
            "allocation on device",
        ])
        .matching_regex(OOM_RE.clone()),
        ErrorPattern::new(
            ErrorCategory::TransientTimeout,
            RecoveryPolicy::new(RecoveryStrategy::RetryWithBackoff, 2),
        )
        .matching(&["timed out", "timeout", "deadline exceeded"]),
        ErrorPattern::new(
            ErrorCategory::MissingDependency,
            RecoveryPolicy::new(RecoveryStrategy::Abort, 0),
        )
        .matching(&[
            "not found",
            "no such file",
            "does not exist",
            "value not in list",
            "cannot find",
            "missing model",
        ]),
        ErrorPattern::new(
            ErrorCategory::TransientNetwork,
            RecoveryPolicy::new(RecoveryStrategy::RetryWithBackoff, 3),
        )
        .matching(&[
            "connection refused",
            "connection reset",
            "connection closed",
            "broken pipe",
            "error sending request",
            "network unreachable",
            "bad gateway",
            "service unavailable",
        ])
        .matching_regex(SERVER_ERROR_RE.clone()),
        ErrorPattern::new(
            ErrorCategory::ResourceExhaustedStorage,
            RecoveryPolicy::new(RecoveryStrategy::Abort, 0),
        )
        .matching(&[
            "no space left",
            "disk full",
            "disk quota exceeded",
            "storage full",
            "not enough space",
        ]),
    ]
}

/// Fallback used when no pattern matches: one conservative retry.
pub fn unknown_pattern() -> ErrorPattern {
    ErrorPattern::new(
        ErrorCategory::Unknown,
        RecoveryPolicy::new(RecoveryStrategy::RetryWithBackoff, 1),
    )
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Immutable rule table, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    patterns: Vec<ErrorPattern>,
    fallback: ErrorPattern,
}

impl ErrorClassifier {
    /// Build a classifier from a custom table. The `unknown` fallback is
    /// always appended implicitly.
    pub fn new(patterns: Vec<ErrorPattern>) -> Self {
        Self {
            patterns,
            fallback: unknown_pattern(),
        }
    }

    /// Classify a failure message. Never fails.
    pub fn classify(&self, message: &str) -> (ErrorCategory, &RecoveryPolicy) {
        let lowered = message.to_lowercase();
        let pattern = self
            .patterns
            .iter()
            .find(|p| p.is_match(message, &lowered))
            .unwrap_or(&self.fallback);
        (pattern.category, &pattern.policy)
    }

    /// Policy for a category known without message matching (e.g. an
    /// attempt timeout). Falls back to the `unknown` policy when the table
    /// has no entry for the category.
    pub fn policy_for(&self, category: ErrorCategory) -> &RecoveryPolicy {
        self.patterns
            .iter()
            .find(|p| p.category == category)
            .map(|p| &p.policy)
            .unwrap_or(&self.fallback.policy)
    }

    pub fn patterns(&self) -> &[ErrorPattern] {
        &self.patterns
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(default_patterns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURES: &[(&str, ErrorCategory)] = &[
        ("CUDA out of memory. Tried to allocate 2.00 GiB", ErrorCategory::ResourceExhaustion),
        ("torch.cuda.OutOfMemoryError: Allocation on device", ErrorCategory::ResourceExhaustion),
        ("OOM when allocating tensor", ErrorCategory::ResourceExhaustion),
        ("RuntimeError: Cannot allocate memory", ErrorCategory::ResourceExhaustion),
        ("Request timed out after 30s", ErrorCategory::TransientTimeout),
        ("read timeout", ErrorCategory::TransientTimeout),
        ("context deadline exceeded", ErrorCategory::TransientTimeout),
        ("model not found: sdxl_base.safetensors", ErrorCategory::MissingDependency),
        ("Value not in list: ckpt_name: 'x.safetensors'", ErrorCategory::MissingDependency),
        ("No such file or directory: /models/lora.pt", ErrorCategory::MissingDependency),
        ("Connection refused (os error 111)", ErrorCategory::TransientNetwork),
        ("connection reset by peer", ErrorCategory::TransientNetwork),
        ("Render engine API error (503): overloaded", ErrorCategory::TransientNetwork),
        ("HTTP 502 Bad Gateway", ErrorCategory::TransientNetwork),
        ("No space left on device", ErrorCategory::ResourceExhaustedStorage),
        ("disk quota exceeded", ErrorCategory::ResourceExhaustedStorage),
        ("something odd happened", ErrorCategory::Unknown),
        ("", ErrorCategory::Unknown),
    ];

    #[test]
    fn fixtures_classify_deterministically() {
        let classifier = ErrorClassifier::default();
        for (message, expected) in FIXTURES {
            for _ in 0..3 {
                let (category, _) = classifier.classify(message);
                assert_eq!(category, *expected, "message: {message:?}");
            }
        }
    }

    #[test]
    fn matching_is_case_insensitive() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify("MODEL NOT FOUND").0,
            ErrorCategory::MissingDependency
        );
    }

    #[test]
    fn oom_requires_whole_word() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify("zoom level invalid").0,
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn plain_numbers_are_not_server_errors() {
        let classifier = ErrorClassifier::default();
        assert_eq!(
            classifier.classify("width 512 rejected by node").0,
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn default_policies_match_table() {
        let classifier = ErrorClassifier::default();
        let expected = [
            (ErrorCategory::ResourceExhaustion, RecoveryStrategy::ShrinkParameters, 3),
            (ErrorCategory::TransientTimeout, RecoveryStrategy::RetryWithBackoff, 2),
            (ErrorCategory::MissingDependency, RecoveryStrategy::Abort, 0),
            (ErrorCategory::TransientNetwork, RecoveryStrategy::RetryWithBackoff, 3),
            (ErrorCategory::ResourceExhaustedStorage, RecoveryStrategy::Abort, 0),
            (ErrorCategory::Unknown, RecoveryStrategy::RetryWithBackoff, 1),
        ];
        for (category, strategy, max_retries) in expected {
            let policy = classifier.policy_for(category);
            assert_eq!(policy.strategy, strategy, "{category}");
            assert_eq!(policy.max_retries, max_retries, "{category}");
        }
    }

    #[test]
    fn first_match_wins_in_declaration_order() {
        let classifier = ErrorClassifier::new(vec![
            ErrorPattern::new(
                ErrorCategory::TransientNetwork,
                RecoveryPolicy::new(RecoveryStrategy::RetryWithBackoff, 5),
            )
            .matching(&["boom"]),
            ErrorPattern::new(
                ErrorCategory::MissingDependency,
                RecoveryPolicy::new(RecoveryStrategy::Abort, 0),
            )
            .matching(&["boom"]),
        ]);
        let (category, policy) = classifier.classify("boom");
        assert_eq!(category, ErrorCategory::TransientNetwork);
        assert_eq!(policy.max_retries, 5);
    }

    #[test]
    fn resource_exhaustion_shrinks_dimensions_and_steps() {
        let classifier = ErrorClassifier::default();
        let policy = classifier.policy_for(ErrorCategory::ResourceExhaustion);
        assert!(policy.adjustments.contains_key("width"));
        assert!(policy.adjustments.contains_key("steps"));
    }

    #[test]
    fn category_round_trips_through_str() {
        for category in [
            ErrorCategory::ResourceExhaustion,
            ErrorCategory::TransientTimeout,
            ErrorCategory::MissingDependency,
            ErrorCategory::TransientNetwork,
            ErrorCategory::ResourceExhaustedStorage,
            ErrorCategory::Unknown,
        ] {
            assert_eq!(ErrorCategory::parse(category.as_str()), category);
        }
    }
}
