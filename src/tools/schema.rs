//! Pre-dispatch validation of tool calls proposed by the reasoning engine.
//!
//! Arguments arrive as raw JSON text that may be malformed or may not
//! match the tool's parameter schema. Validation never fails outright: it
//! produces a [`ValidationResult`], and invalid calls can be turned into
//! retry guidance for the engine's next turn.

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{normalize_tool_name, FunctionSpec};
use crate::error::ToolError;

/// A call proposed by the reasoning engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    /// Raw JSON text, possibly malformed.
    pub arguments: String,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into(),
        }
    }
}

/// How strictly schemas are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Unknown schema keywords tolerated, `format` not enforced.
    #[default]
    Permissive,
    /// `format` keywords enforced.
    Strict,
}

impl ValidationMode {
    pub fn from_strict(strict: bool) -> Self {
        if strict {
            ValidationMode::Strict
        } else {
            ValidationMode::Permissive
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub call: ToolCallRequest,
    pub valid: bool,
    /// One entry per violation, `<path>: <message>` for schema errors.
    pub errors: Vec<String>,
    /// Parsed arguments. Present for schema failures too, for diagnostics;
    /// `None` only when the tool is unknown or the JSON does not parse.
    pub sanitized_args: Option<Value>,
    /// Expected schema, attached when the arguments violated it.
    pub schema: Option<Value>,
    pub failure: Option<ToolError>,
}

impl ValidationResult {
    fn reject(call: &ToolCallRequest, failure: ToolError, errors: Vec<String>) -> Self {
        Self {
            call: call.clone(),
            valid: false,
            errors,
            sanitized_args: None,
            schema: None,
            failure: Some(failure),
        }
    }
}

/// Order-preserving partition of a batch.
#[derive(Debug, Clone, Default)]
pub struct ValidationBatch {
    pub valid: Vec<ValidationResult>,
    pub invalid: Vec<ValidationResult>,
}

impl ValidationBatch {
    pub fn all_valid(&self) -> bool {
        self.invalid.is_empty()
    }
}

fn find_spec<'a>(name: &str, available: &'a [FunctionSpec]) -> Option<&'a FunctionSpec> {
    available.iter().find(|t| t.name == name).or_else(|| {
        let wanted = normalize_tool_name(name);
        available.iter().find(|t| normalize_tool_name(&t.name) == wanted)
    })
}

/// Validate one call in permissive mode.
pub fn validate_tool_call(call: &ToolCallRequest, available: &[FunctionSpec]) -> ValidationResult {
    validate_tool_call_with(call, available, ValidationMode::Permissive)
}

pub fn validate_tool_call_with(
    call: &ToolCallRequest,
    available: &[FunctionSpec],
    mode: ValidationMode,
) -> ValidationResult {
    let Some(spec) = find_spec(&call.name, available) else {
        let err = ToolError::UnknownTool(call.name.clone());
        return ValidationResult::reject(call, err.clone(), vec![err.to_string()]);
    };

    let parsed: Value = match serde_json::from_str(&call.arguments) {
        Ok(v) => v,
        Err(e) => {
            let msg = format!("Invalid JSON in tool arguments: {e}");
            return ValidationResult::reject(
                call,
                ToolError::MalformedArguments(msg.clone()),
                vec![msg],
            );
        }
    };

    let compiled = JSONSchema::options()
        .should_validate_formats(mode == ValidationMode::Strict)
        .compile(&spec.parameters);
    let compiled = match compiled {
        Ok(c) => c,
        Err(e) => {
            let msg = format!("Validation system error: invalid schema for '{}': {e}", spec.name);
            tracing::warn!(tool = %spec.name, error = %e, "tool schema does not compile");
            return ValidationResult::reject(
                call,
                ToolError::MalformedArguments(msg.clone()),
                vec![msg],
            );
        }
    };

    let errors: Vec<String> = match compiled.validate(&parsed) {
        Ok(()) => Vec::new(),
        Err(iter) => iter
            .map(|err| {
                let path = err.instance_path.to_string();
                let path = if path.is_empty() { "root".to_string() } else { path };
                format!("{path}: {err}")
            })
            .collect(),
    };

    if errors.is_empty() {
        return ValidationResult {
            call: call.clone(),
            valid: true,
            errors,
            sanitized_args: Some(parsed),
            schema: None,
            failure: None,
        };
    }

    ValidationResult {
        call: call.clone(),
        valid: false,
        failure: Some(ToolError::MalformedArguments(errors.join("; "))),
        errors,
        sanitized_args: Some(parsed),
        schema: Some(spec.parameters.clone()),
    }
}

/// Validate a batch, keeping input order within each partition.
pub fn validate_tool_calls(calls: &[ToolCallRequest], available: &[FunctionSpec]) -> ValidationBatch {
    validate_tool_calls_with(calls, available, ValidationMode::Permissive)
}

pub fn validate_tool_calls_with(
    calls: &[ToolCallRequest],
    available: &[FunctionSpec],
    mode: ValidationMode,
) -> ValidationBatch {
    let mut batch = ValidationBatch::default();
    for call in calls {
        let result = validate_tool_call_with(call, available, mode);
        if result.valid {
            batch.valid.push(result);
        } else {
            batch.invalid.push(result);
        }
    }
    batch
}

/// Build the message fed back to the reasoning engine after a batch with
/// invalid calls.
pub fn create_retry_guidance(invalid: &[ValidationResult], available: &[FunctionSpec]) -> String {
    let details = invalid
        .iter()
        .map(|r| {
            let name = if r.call.name.is_empty() { "unknown" } else { &r.call.name };
            let mut detail = format!("Tool \"{name}\":\n  Errors: {}", r.errors.join("; "));
            if let Some(schema) = &r.schema {
                let pretty =
                    serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
                detail.push_str(&format!("\n\nCorrect schema for {name}:\n{pretty}"));
            }
            detail
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let names = available
        .iter()
        .map(|t| t.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "Your previous tool call(s) failed validation:\n\n\
         {details}\n\n\
         CRITICAL REQUIREMENTS:\n\
         1. Use EXACT tool names from the available tools list\n\
         2. Provide ALL required parameters\n\
         3. Match parameter types exactly (string, number, boolean, array, object)\n\
         4. For enum parameters, use ONLY the allowed values from the schema\n\
         5. Ensure all JSON is properly formatted\n\n\
         Available tools: {names}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather() -> FunctionSpec {
        FunctionSpec {
            name: "get_weather".into(),
            description: "weather".into(),
            parameters: json!({
                "type": "object",
                "properties": { "when": { "type": "string", "format": "date-time" } },
                "required": ["when"]
            }),
        }
    }

    #[test]
    fn formats_are_ignored_in_permissive_mode() {
        let call = ToolCallRequest::new("get_weather", r#"{"when":"tomorrow"}"#);
        assert!(validate_tool_call(&call, &[weather()]).valid);
    }

    #[test]
    fn formats_are_enforced_in_strict_mode() {
        let call = ToolCallRequest::new("get_weather", r#"{"when":"tomorrow"}"#);
        let res = validate_tool_call_with(&call, &[weather()], ValidationMode::Strict);
        assert!(!res.valid, "strict mode should reject a non date-time string");
        assert!(res.errors[0].starts_with("/when:"), "got {:?}", res.errors);
    }
}
