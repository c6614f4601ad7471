//! Quality gate checks, thresholds and scoring.
//!
//! The gate runs after a job completes and never feeds back into recovery:
//! a failing result is informational. File inspection happens in the
//! pipeline; this module only turns measurements into check outcomes and
//! a [`QualityResult`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Check names
// ---------------------------------------------------------------------------

/// Number of produced artifacts versus the number expected.
pub const CHECK_COMPLETENESS: &str = "asset_completeness";
/// Pixel dimensions of image artifacts against the configured minimum.
pub const CHECK_RESOLUTION: &str = "resolution";
/// The artifact could be opened and read at all.
pub const CHECK_READABLE: &str = "artifact_readable";

/// Default overall score needed to pass.
pub const DEFAULT_PASS_SCORE: f64 = 0.7;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
        }
    }

    /// Contribution of the check to the overall score.
    pub fn weight(&self) -> f64 {
        match self {
            CheckStatus::Pass => 1.0,
            CheckStatus::Warn => 0.5,
            CheckStatus::Fail => 0.0,
        }
    }
}

/// Evaluate a score against warn/fail thresholds.
///
/// Higher score = better. Returns:
/// - `Pass` if `score >= warn_threshold`
/// - `Warn` if `score >= fail_threshold`
/// - `Fail` otherwise
pub fn evaluate_score(score: f64, warn_threshold: f64, fail_threshold: f64) -> CheckStatus {
    if score >= warn_threshold {
        CheckStatus::Pass
    } else if score >= fail_threshold {
        CheckStatus::Warn
    } else {
        CheckStatus::Fail
    }
}

// ---------------------------------------------------------------------------
// Criteria
// ---------------------------------------------------------------------------

/// Warn/fail thresholds for one style score (0.0..=1.0, higher = better).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StyleThreshold {
    pub warn: f64,
    pub fail: f64,
}

/// Validate threshold values.
///
/// Both must be in `[0.0, 1.0]` and `warn >= fail`.
pub fn validate_threshold(warn: f64, fail: f64) -> Result<(), CoreError> {
    if !(0.0..=1.0).contains(&warn) {
        return Err(CoreError::Validation(format!(
            "warn threshold must be between 0.0 and 1.0, got {warn}"
        )));
    }
    if !(0.0..=1.0).contains(&fail) {
        return Err(CoreError::Validation(format!(
            "fail threshold must be between 0.0 and 1.0, got {fail}"
        )));
    }
    if warn < fail {
        return Err(CoreError::Validation(format!(
            "warn threshold ({warn}) must be >= fail threshold ({fail})"
        )));
    }
    Ok(())
}

/// What a completed job is measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityCriteria {
    /// Artifacts the job is expected to produce. `0` disables the check.
    pub expected_outputs: usize,
    /// Minimum image width in pixels. `0` disables the check.
    pub min_width: u32,
    /// Minimum image height in pixels. `0` disables the check.
    pub min_height: u32,
    /// Style checks by name.
    pub style_thresholds: BTreeMap<String, StyleThreshold>,
    /// Overall score needed to pass.
    pub pass_score: f64,
}

impl Default for QualityCriteria {
    fn default() -> Self {
        Self {
            expected_outputs: 1,
            min_width: 0,
            min_height: 0,
            style_thresholds: BTreeMap::new(),
            pass_score: DEFAULT_PASS_SCORE,
        }
    }
}

impl QualityCriteria {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(0.0..=1.0).contains(&self.pass_score) {
            return Err(CoreError::Validation(format!(
                "pass score must be between 0.0 and 1.0, got {}",
                self.pass_score
            )));
        }
        for threshold in self.style_thresholds.values() {
            validate_threshold(threshold.warn, threshold.fail)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

/// Result of one named check, with a human-readable note when not passing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub check: String,
    pub status: CheckStatus,
    pub detail: Option<String>,
}

impl CheckOutcome {
    pub fn pass(check: &str) -> Self {
        Self {
            check: check.to_string(),
            status: CheckStatus::Pass,
            detail: None,
        }
    }

    pub fn with_status(check: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            status,
            detail: Some(detail.into()),
        }
    }
}

/// Compare produced artifacts with the expected count.
pub fn completeness_check(produced: usize, expected: usize) -> CheckOutcome {
    if produced >= expected {
        CheckOutcome::pass(CHECK_COMPLETENESS)
    } else if produced == 0 {
        CheckOutcome::with_status(
            CHECK_COMPLETENESS,
            CheckStatus::Fail,
            format!("no artifacts produced (expected {expected})"),
        )
    } else {
        CheckOutcome::with_status(
            CHECK_COMPLETENESS,
            CheckStatus::Warn,
            format!("{produced} of {expected} expected artifacts produced"),
        )
    }
}

/// Strict dimension check; anything under the minimum fails.
pub fn resolution_check(
    artifact: &str,
    width: u32,
    height: u32,
    criteria: &QualityCriteria,
) -> CheckOutcome {
    if width >= criteria.min_width && height >= criteria.min_height {
        CheckOutcome::pass(CHECK_RESOLUTION)
    } else {
        CheckOutcome::with_status(
            CHECK_RESOLUTION,
            CheckStatus::Fail,
            format!(
                "{artifact} is {width}x{height}, below minimum {}x{}",
                criteria.min_width, criteria.min_height
            ),
        )
    }
}

/// Evaluate style scores against the configured thresholds.
///
/// A configured check with no reported score fails.
pub fn style_checks(scores: &BTreeMap<String, f64>, criteria: &QualityCriteria) -> Vec<CheckOutcome> {
    criteria
        .style_thresholds
        .iter()
        .map(|(name, threshold)| match scores.get(name) {
            Some(&score) => match evaluate_score(score, threshold.warn, threshold.fail) {
                CheckStatus::Pass => CheckOutcome::pass(name),
                status => CheckOutcome::with_status(
                    name,
                    status,
                    format!("{name} scored {score:.2} ({})", status.as_str()),
                ),
            },
            None => CheckOutcome::with_status(
                name,
                CheckStatus::Fail,
                format!("{name} score missing"),
            ),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

/// Score attached to a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityResult {
    pub score: f64,
    pub passed: bool,
    pub issues: Vec<String>,
}

impl QualityResult {
    /// Result used when the gate could not inspect the artifact at all.
    pub fn inspection_failed(reason: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            passed: false,
            issues: vec![reason.into()],
        }
    }
}

/// Fold check outcomes into a result.
///
/// The score is the mean check weight (an empty set scores 1.0). The job
/// passes when the score reaches `pass_score` and no check failed outright.
pub fn summarize(checks: &[CheckOutcome], pass_score: f64) -> QualityResult {
    let score = if checks.is_empty() {
        1.0
    } else {
        checks.iter().map(|c| c.status.weight()).sum::<f64>() / checks.len() as f64
    };
    let any_failed = checks.iter().any(|c| c.status == CheckStatus::Fail);
    let issues = checks
        .iter()
        .filter(|c| c.status != CheckStatus::Pass)
        .map(|c| {
            c.detail
                .clone()
                .unwrap_or_else(|| format!("{} {}", c.check, c.status.as_str()))
        })
        .collect();

    QualityResult {
        score,
        passed: score >= pass_score && !any_failed,
        issues,
    }
}
