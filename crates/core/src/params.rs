//! Generation parameter documents.
//!
//! A job carries a flat mapping of parameter names to numeric or string
//! values. Numeric entries are what the recovery adjuster shrinks; string
//! entries (prompts, model names) pass through untouched.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum number of entries accepted in a single parameter document.
pub const MAX_PARAMS: usize = 256;

/// Maximum length of a parameter name.
const MAX_KEY_LEN: usize = 128;

/// A single parameter value.
///
/// Deserialized untagged: JSON integers become [`ParamValue::Int`], other
/// numbers [`ParamValue::Float`], strings [`ParamValue::Text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Numeric view of the value, `None` for text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            ParamValue::Text(_) => None,
        }
    }

    /// Convert into a JSON value, keeping the numeric type.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Int(v) => serde_json::Value::from(*v),
            ParamValue::Float(v) => serde_json::Value::from(*v),
            ParamValue::Text(v) => serde_json::Value::from(v.as_str()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

/// Parameter document submitted to the render engine.
pub type GenerationParams = BTreeMap<String, ParamValue>;

/// Validate a parameter document before it is accepted into the queue.
///
/// Rules:
/// - At most [`MAX_PARAMS`] entries.
/// - Keys are non-empty and at most 128 characters.
/// - Float values are finite.
pub fn validate_params(params: &GenerationParams) -> Result<(), CoreError> {
    if params.len() > MAX_PARAMS {
        return Err(CoreError::Validation(format!(
            "Too many parameters: {} (max {MAX_PARAMS})",
            params.len()
        )));
    }
    for (key, value) in params {
        if key.is_empty() {
            return Err(CoreError::Validation(
                "Parameter names must not be empty".to_string(),
            ));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(CoreError::Validation(format!(
                "Parameter name exceeds {MAX_KEY_LEN} characters: '{key}'"
            )));
        }
        if let ParamValue::Float(v) = value {
            if !v.is_finite() {
                return Err(CoreError::Validation(format!(
                    "Parameter '{key}' must be a finite number"
                )));
            }
        }
    }
    Ok(())
}
