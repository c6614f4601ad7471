//! Parameter adjustment applied when a failure calls for smaller work.
//!
//! [`adjust`] is pure: it returns a new parameter document and never
//! mutates its input. [`shrink`] layers the monotonic guarantee on top so
//! a parameter can only move down across successive attempts.

use std::collections::BTreeMap;

use crate::params::{GenerationParams, ParamValue};

/// How a single numeric parameter is reduced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    /// `new = floor(old * factor)`
    Reduce { factor: f64 },
    /// `new = floor(old / divisor)`
    Divide { divisor: f64 },
}

/// An adjustment plus the floor it may never go below.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustmentRule {
    pub adjustment: Adjustment,
    pub min_value: i64,
}

impl AdjustmentRule {
    pub const fn reduce(factor: f64, min_value: i64) -> Self {
        Self {
            adjustment: Adjustment::Reduce { factor },
            min_value,
        }
    }

    pub const fn divide(divisor: f64, min_value: i64) -> Self {
        Self {
            adjustment: Adjustment::Divide { divisor },
            min_value,
        }
    }

    /// Apply the rule to one value, floor-clamped to `min_value`.
    ///
    /// Non-finite intermediate results (division by zero, NaN factors)
    /// collapse to `min_value`.
    pub fn apply(&self, value: f64) -> i64 {
        let raw = match self.adjustment {
            Adjustment::Reduce { factor } => value * factor,
            Adjustment::Divide { divisor } => value / divisor,
        };
        let floored = raw.floor();
        if !floored.is_finite() {
            return self.min_value;
        }
        (floored as i64).max(self.min_value)
    }
}

/// Adjustment rules keyed by parameter name.
pub type AdjustmentRules = BTreeMap<String, AdjustmentRule>;

/// Apply `rules` to every numeric key present in both maps.
///
/// Keys missing from `params`, and text values, are skipped silently.
/// Adjusted values are always integers.
pub fn adjust(params: &GenerationParams, rules: &AdjustmentRules) -> GenerationParams {
    let mut adjusted = params.clone();
    for (key, rule) in rules {
        if let Some(value) = params.get(key).and_then(ParamValue::as_f64) {
            adjusted.insert(key.clone(), ParamValue::Int(rule.apply(value)));
        }
    }
    adjusted
}

/// Like [`adjust`], but a value never grows: when the rule's floor sits
/// above the current value the current value is kept.
pub fn shrink(params: &GenerationParams, rules: &AdjustmentRules) -> GenerationParams {
    let mut shrunk = adjust(params, rules);
    for (key, value) in shrunk.iter_mut() {
        let (Some(before), Some(after)) = (
            params.get(key).and_then(ParamValue::as_f64),
            value.as_f64(),
        ) else {
            continue;
        };
        if after > before {
            if let Some(original) = params.get(key) {
                *value = original.clone();
            }
        }
    }
    shrunk
}
