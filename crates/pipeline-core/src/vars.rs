//! Merging of declared flow variables with caller-supplied input.
//!
//! The result is the `{"var": {...}}` map handed to the evaluation
//! context and to the wrapper-job run configuration.

use thiserror::Error;

use crate::types::{Flow, JsonMap};

/// All variable problems found during a merge, reported together.
#[derive(Debug, Error)]
#[error("variable errors: {}", .problems.join("; "))]
pub struct VariableError {
    pub problems: Vec<String>,
}

/// Merge the flow's declared variables with caller input.
///
/// The caller map may already be wrapped under `var` or flat. Unknown
/// caller-supplied keys are preserved so trigger-provided values (e.g.
/// `trigger.git_sha` from a webhook) reach the run. Declared defaults
/// fill absent keys, caller values win, and every `required` variable
/// must be present after the merge.
pub fn generate_variables_map(flow: &Flow, vars: &JsonMap) -> Result<JsonMap, VariableError> {
    let mut problems = Vec::new();

    let effective = match vars.get("var") {
        Some(serde_json::Value::Object(inner)) => inner.clone(),
        _ => vars.clone(),
    };

    // Start from the caller map so undeclared input survives the merge.
    let mut result = effective.clone();

    for variable in &flow.variables {
        let segments: Vec<&str> = variable.name.split('.').collect();

        match segments.as_slice() {
            [namespace, name] => {
                let ns_entry = result
                    .entry((*namespace).to_string())
                    .or_insert_with(|| serde_json::Value::Object(JsonMap::new()));

                let Some(ns_map) = ns_entry.as_object_mut() else {
                    problems.push(format!("invalid variable namespace: {namespace}"));
                    continue;
                };

                if let Some(default) = &variable.default {
                    if !ns_map.contains_key(*name) {
                        ns_map.insert((*name).to_string(), default.clone());
                    }
                }

                let provided = effective
                    .get(*namespace)
                    .and_then(|v| v.as_object())
                    .is_some_and(|m| m.contains_key(*name));
                if variable.required && !provided && variable.default.is_none() {
                    problems.push(format!("missing required variable: {namespace}.{name}"));
                }
            }
            [name] => {
                if let Some(default) = &variable.default {
                    if !result.contains_key(*name) {
                        result.insert((*name).to_string(), default.clone());
                    }
                }

                if variable.required
                    && !effective.contains_key(*name)
                    && variable.default.is_none()
                {
                    problems.push(format!("missing required variable: {name}"));
                }
            }
            _ => {
                problems.push(format!("invalid variable name: {}", variable.name));
            }
        }
    }

    if !problems.is_empty() {
        return Err(VariableError { problems });
    }

    let mut wrapped = JsonMap::new();
    wrapped.insert("var".to_string(), serde_json::Value::Object(result));
    Ok(wrapped)
}
