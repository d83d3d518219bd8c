//! Input template resolution.
//!
//! Step inputs are arbitrary JSON. Strings may reference earlier results:
//!
//! - `{{ inputs.<path> }}`: caller-supplied run inputs
//! - `{{ steps.<id>.output.<path> }}`: output of a completed step
//! - `{{ item.<path> }}` / `{{ index }}`: current element inside a loop
//!
//! A string that is exactly one placeholder is replaced by the referenced
//! JSON value. Placeholders embedded in longer text are interpolated.
//! References to missing outputs resolve to `null`. Loop placeholders
//! outside a loop scope are left verbatim for the loop handler to render.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::domain::{StepState, StepStatus};

/// Template errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("Unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("Unknown reference '{0}' (expected inputs.*, steps.*, item or index)")]
    UnknownReference(String),
}

/// Values a template can reference
#[derive(Debug, Clone, Copy)]
pub struct TemplateScope<'a> {
    pub inputs: &'a Value,
    pub steps: &'a BTreeMap<String, StepState>,
    /// Current loop element and its index
    pub item: Option<(&'a Value, usize)>,
}

impl<'a> TemplateScope<'a> {
    pub fn new(inputs: &'a Value, steps: &'a BTreeMap<String, StepState>) -> Self {
        Self {
            inputs,
            steps,
            item: None,
        }
    }

    pub fn with_item(self, item: &'a Value, index: usize) -> Self {
        Self {
            item: Some((item, index)),
            ..self
        }
    }

    /// Look up a dotted reference; `None` defers a loop placeholder
    fn lookup(&self, expr: &str) -> Result<Option<Value>, TemplateError> {
        let (root, rest) = match expr.split_once('.') {
            Some((root, rest)) => (root, rest),
            None => (expr, ""),
        };

        match root {
            "inputs" => Ok(Some(
                lookup_path(self.inputs, rest).cloned().unwrap_or(Value::Null),
            )),
            "steps" => {
                let (step_id, path) = rest.split_once('.').unwrap_or((rest, ""));
                let output = self
                    .steps
                    .get(step_id)
                    .filter(|s| s.status == StepStatus::Completed)
                    .and_then(|s| s.output.as_ref());
                let path = match path {
                    "output" => "",
                    other => other.strip_prefix("output.").unwrap_or(other),
                };

                Ok(Some(
                    output
                        .and_then(|o| lookup_path(o, path))
                        .cloned()
                        .unwrap_or(Value::Null),
                ))
            }
            "item" => Ok(self
                .item
                .map(|(item, _)| lookup_path(item, rest).cloned().unwrap_or(Value::Null))),
            "index" if rest.is_empty() => Ok(self.item.map(|(_, index)| Value::from(index))),
            _ => Err(TemplateError::UnknownReference(expr.to_string())),
        }
    }
}

/// Follow a dotted path (`a.b.0.c`) into a JSON value. Empty path is the value itself.
pub fn lookup_path<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Resolve every placeholder in `template`
pub fn resolve(template: &Value, scope: &TemplateScope<'_>) -> Result<Value, TemplateError> {
    match template {
        Value::String(text) => resolve_string(text, scope),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| resolve(value, scope).map(|v| (key.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

fn resolve_string(text: &str, scope: &TemplateScope<'_>) -> Result<Value, TemplateError> {
    // Whole-string placeholder keeps the referenced JSON type
    let trimmed = text.trim();
    if let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !inner.contains("{{") && !inner.contains("}}") {
            return Ok(scope
                .lookup(inner.trim())?
                .unwrap_or_else(|| Value::String(text.to_string())));
        }
    }

    if !text.contains("{{") {
        return Ok(Value::String(text.to_string()));
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(text.to_string()))?;

        match scope.lookup(after[..end].trim())? {
            None => out.push_str(&rest[start..start + end + 4]),
            Some(Value::Null) => {}
            Some(Value::String(s)) => out.push_str(&s),
            Some(other) => out.push_str(&other.to_string()),
        }

        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(Value::String(out))
}
