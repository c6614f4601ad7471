//! Workflow templates with `{{name}}` placeholders.
//!
//! A template is a ComfyUI API-format workflow where string values may
//! reference generation parameters. A string that is exactly one
//! placeholder is replaced by the parameter with its JSON type intact
//! (`"{{steps}}"` becomes `30`); placeholders embedded in longer strings
//! are spliced in as text.

use std::path::Path;
use std::sync::LazyLock;

use kiln_core::params::GenerationParams;
use regex::Regex;

use crate::gateway::GatewayError;

/// Regex pattern matching `{{placeholder}}` tokens.
pub const PLACEHOLDER_PATTERN: &str = r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_.]*)\s*\}\}";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PLACEHOLDER_PATTERN).expect("valid regex"));

static WHOLE_PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{PLACEHOLDER_PATTERN}$")).expect("valid regex")
});

#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    template: serde_json::Value,
}

impl WorkflowTemplate {
    pub fn new(template: serde_json::Value) -> Self {
        Self { template }
    }

    /// Load a template from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Workflow(format!("Cannot read template {}: {e}", path.display()))
        })?;
        let template = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::Workflow(format!("Invalid template {}: {e}", path.display()))
        })?;
        Ok(Self::new(template))
    }

    /// Every placeholder name referenced by the template, sorted.
    pub fn placeholders(&self) -> Vec<String> {
        let mut names = Vec::new();
        collect_placeholders(&self.template, &mut names);
        names.sort();
        names.dedup();
        names
    }

    /// Substitute `params` into a copy of the template.
    ///
    /// Fails on the first placeholder with no matching parameter.
    pub fn render(&self, params: &GenerationParams) -> Result<serde_json::Value, GatewayError> {
        let mut workflow = self.template.clone();
        substitute(&mut workflow, params)?;
        Ok(workflow)
    }
}

/// The parameter document as a plain JSON object, for engines that take
/// parameters directly instead of a templated workflow.
pub fn params_document(params: &GenerationParams) -> serde_json::Value {
    serde_json::Value::Object(
        params
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

fn collect_placeholders(value: &serde_json::Value, names: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            names.extend(PLACEHOLDER_RE.captures_iter(s).map(|c| c[1].to_string()));
        }
        serde_json::Value::Array(items) => {
            items.iter().for_each(|item| collect_placeholders(item, names));
        }
        serde_json::Value::Object(map) => {
            map.values().for_each(|item| collect_placeholders(item, names));
        }
        _ => {}
    }
}

fn substitute(value: &mut serde_json::Value, params: &GenerationParams) -> Result<(), GatewayError> {
    match value {
        serde_json::Value::String(s) => {
            let whole = WHOLE_PLACEHOLDER_RE
                .captures(s)
                .map(|caps| lookup(params, &caps[1]).map(|v| v.to_json()))
                .transpose()?;
            if let Some(replacement) = whole {
                *value = replacement;
                return Ok(());
            }
            if !PLACEHOLDER_RE.is_match(s) {
                return Ok(());
            }
            let mut rendered = String::with_capacity(s.len());
            let mut last = 0;
            for caps in PLACEHOLDER_RE.captures_iter(s) {
                let whole = caps.get(0).map_or(0..0, |m| m.range());
                rendered.push_str(&s[last..whole.start]);
                rendered.push_str(&lookup(params, &caps[1])?.to_string());
                last = whole.end;
            }
            rendered.push_str(&s[last..]);
            *s = rendered;
        }
        serde_json::Value::Array(items) => {
            for item in items {
                substitute(item, params)?;
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                substitute(item, params)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn lookup<'a>(
    params: &'a GenerationParams,
    name: &str,
) -> Result<&'a kiln_core::params::ParamValue, GatewayError> {
    params
        .get(name)
        .ok_or_else(|| GatewayError::Workflow(format!("Template placeholder '{name}' has no parameter")))
}
