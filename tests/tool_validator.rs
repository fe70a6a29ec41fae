//! Integration tests for tool-call validation and retry guidance.

use serde_json::json;
use toolgate::tools::schema::{validate_tool_call_with, ValidationMode};
use toolgate::tools::{
    create_retry_guidance, validate_tool_call, validate_tool_calls, ToolCallRequest,
};
use toolgate::tools::FunctionSpec;

fn specs() -> Vec<FunctionSpec> {
    vec![
        FunctionSpec {
            name: "roll_dice".into(),
            description: "Roll dice".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "dieType": { "type": "string", "pattern": "^d[0-9]+$" },
                    "count": { "type": "integer", "minimum": 1, "maximum": 100 }
                },
                "required": ["dieType"],
                "additionalProperties": false
            }),
        },
        FunctionSpec {
            name: "send_email".into(),
            description: "Send an email".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "to": { "type": "string", "format": "email" },
                    "priority": { "type": "string", "enum": ["low", "high"] }
                },
                "required": ["to"]
            }),
        },
    ]
}

#[test]
fn valid_args_are_returned_as_parsed() {
    let call = ToolCallRequest::new("roll_dice", r#"{"dieType":"d20","count":3}"#);
    let res = validate_tool_call(&call, &specs());
    assert!(res.valid, "errors: {:?}", res.errors);
    assert_eq!(res.sanitized_args, Some(json!({"dieType": "d20", "count": 3})));
    assert!(res.failure.is_none());
    assert!(res.schema.is_none());
}

#[test]
fn missing_required_field_is_named() {
    let call = ToolCallRequest::new("roll_dice", r#"{"count":3}"#);
    let res = validate_tool_call(&call, &specs());
    assert!(!res.valid);
    assert!(
        res.errors.iter().any(|e| e.contains("dieType")),
        "error should name the missing field: {:?}",
        res.errors
    );
    assert!(res.schema.is_some(), "schema attached for guidance");
    assert_eq!(res.failure.as_ref().map(|f| f.code()), Some("malformed_arguments"));
}

#[test]
fn nested_violations_carry_their_path() {
    let call = ToolCallRequest::new("roll_dice", r#"{"dieType":"d6","count":0}"#);
    let res = validate_tool_call(&call, &specs());
    assert!(!res.valid);
    assert!(
        res.errors.iter().any(|e| e.starts_with("/count")),
        "got: {:?}",
        res.errors
    );
}

#[test]
fn malformed_json_is_reported() {
    let call = ToolCallRequest::new("roll_dice", "{dieType: d6");
    let res = validate_tool_call(&call, &specs());
    assert!(!res.valid);
    assert!(res.errors[0].starts_with("Invalid JSON in tool arguments:"));
    assert!(res.sanitized_args.is_none());
}

#[test]
fn unknown_tool_is_reported() {
    let call = ToolCallRequest::new("bitcon_price", "{}");
    let res = validate_tool_call(&call, &specs());
    assert!(!res.valid);
    assert_eq!(res.errors, vec!["Tool 'bitcon_price' not found in available tools"]);
    assert_eq!(res.failure.as_ref().map(|f| f.code()), Some("unknown_tool"));
}

#[test]
fn names_match_after_normalization() {
    let call = ToolCallRequest::new("Roll-Dice", r#"{"dieType":"d6"}"#);
    assert!(validate_tool_call(&call, &specs()).valid);
}

#[test]
fn email_format_only_checked_in_strict_mode() {
    let call = ToolCallRequest::new("send_email", r#"{"to":"not-an-address"}"#);
    assert!(validate_tool_call(&call, &specs()).valid);
    let strict = validate_tool_call_with(&call, &specs(), ValidationMode::Strict);
    assert!(!strict.valid);
}

#[test]
fn batch_keeps_input_order() {
    let calls = vec![
        ToolCallRequest::new("roll_dice", r#"{"dieType":"d6"}"#),
        ToolCallRequest::new("send_email", r#"{"priority":"urgent"}"#),
        ToolCallRequest::new("send_email", r#"{"to":"a@example.com"}"#),
    ];
    let batch = validate_tool_calls(&calls, &specs());
    assert!(!batch.all_valid());

    let valid: Vec<&str> = batch.valid.iter().map(|r| r.call.arguments.as_str()).collect();
    assert_eq!(valid, vec![calls[0].arguments.as_str(), calls[2].arguments.as_str()]);
    assert_eq!(batch.invalid.len(), 1);
    assert_eq!(batch.invalid[0].call, calls[1]);
}

#[test]
fn guidance_lists_invalid_calls_and_available_tools() {
    let calls = vec![
        ToolCallRequest::new("bitcon_price", "{}"),
        ToolCallRequest::new("send_email", r#"{"priority":"urgent"}"#),
    ];
    let batch = validate_tool_calls(&calls, &specs());
    let guidance = create_retry_guidance(&batch.invalid, &specs());

    assert!(guidance.starts_with("Your previous tool call(s) failed validation:"));
    assert!(guidance.contains("Tool \"bitcon_price\":"));
    assert!(guidance.contains("Tool \"send_email\":"));
    assert!(guidance.contains("Correct schema for send_email:"));
    assert!(guidance.contains("CRITICAL REQUIREMENTS:"));
    assert!(guidance.ends_with("Available tools: roll_dice, send_email"));
}
