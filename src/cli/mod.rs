//! Invocation facade handlers.
//!
//! Keeps `main.rs` slim: clap parsing stays there, the request handling
//! lives here. Every request produces exactly one [`Response`]: a single
//! JSON line for stdout plus the process exit code.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::orchestrator::Orchestrator;
use crate::tools::registry::InvocationContext;
use crate::tools::ToolRegistry;

pub const USER_ID_ENV: &str = "TOOLGATE_USER_ID";
pub const CONVERSATION_ID_ENV: &str = "TOOLGATE_CONVERSATION_ID";
pub const AUTH_TOKEN_ENV: &str = "TOOLGATE_AUTH_TOKEN";

const LIST_HINT: &str =
    "Run a tool with: toolgate --tool <tool_name> --args '{\"key\":\"value\"}'";

// ── Public types ─────────────────────────────────────────────────────────────

/// One facade request, as parsed from the command line.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub tool: Option<String>,
    /// Raw JSON text for the tool arguments.
    pub args: Option<String>,
    /// Raw JSON object merged into the engine context extras.
    pub context: Option<String>,
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub auth_token: Option<String>,
}

impl Invocation {
    /// Fill unset identity fields from `TOOLGATE_*` environment variables.
    pub fn with_env_fallbacks(mut self) -> Self {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        if self.user_id.is_none() {
            self.user_id = env(USER_ID_ENV);
        }
        if self.conversation_id.is_none() {
            self.conversation_id = env(CONVERSATION_ID_ENV);
        }
        if self.auth_token.is_none() {
            self.auth_token = env(AUTH_TOKEN_ENV);
        }
        self
    }
}

/// What the binary prints and how it exits.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub body: Value,
    pub exit_code: i32,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { body, exit_code: 0 }
    }

    /// `{success: false, error, tool}` with a non-zero exit status.
    pub fn failure(error: impl Into<String>, tool: Option<&str>) -> Self {
        Self {
            body: json!({
                "success": false,
                "error": error.into(),
                "tool": tool,
            }),
            exit_code: 1,
        }
    }

    /// The single stdout line.
    pub fn line(&self) -> String {
        self.body.to_string()
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Trim and turn dashes into underscores; `None` for blank input.
pub fn normalize_cli_tool_name(name: Option<&str>) -> Option<String> {
    let name = name?.trim();
    if name.is_empty() {
        return None;
    }
    Some(name.replace('-', "_"))
}

fn parse_json_flag(flag: &str, raw: Option<&str>) -> Result<Value, String> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(Value::Object(Map::new())),
        Some(text) => serde_json::from_str(text)
            .map_err(|e| format!("Failed to parse {flag} JSON: {e}")),
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// `--list`: native tool names plus every registry tool name.
pub async fn list_tools(registry: &ToolRegistry) -> Response {
    registry.ensure_initialized().await;
    let native = registry.native_names();
    let mut all: Vec<String> = registry
        .get_all_tools_including_plugins()
        .into_iter()
        .map(|d| d.name)
        .collect();
    all.sort();
    Response::ok(json!({
        "success": true,
        "nativeTools": native,
        "registryTools": all,
        "hint": LIST_HINT,
    }))
}

/// Run one tool and return its envelope.
///
/// Tool-level failures (unknown tool, executor error) come back as the
/// registry's error envelope with exit code 0; only facade errors (missing
/// tool name, unparsable flags) exit non-zero.
pub async fn invoke(orchestrator: &Orchestrator, invocation: Invocation) -> Response {
    let Some(tool) = normalize_cli_tool_name(invocation.tool.as_deref()) else {
        return Response::failure(
            "Missing required --tool argument. Use --list to see available tools.",
            None,
        );
    };

    let args = match parse_json_flag("--args", invocation.args.as_deref()) {
        Ok(v) => v,
        Err(e) => return Response::failure(e, Some(&tool)),
    };

    let extras = match parse_json_flag("--context", invocation.context.as_deref()) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Response::failure("--context must be a JSON object", Some(&tool)),
        Err(e) => return Response::failure(e, Some(&tool)),
    };

    let context = InvocationContext {
        user_id: invocation.user_id.clone(),
        conversation_id: invocation.conversation_id.clone(),
        extras,
    };

    debug!(tool = %tool, conversation_id = ?context.conversation_id, "facade invoking tool");

    let envelope = orchestrator
        .registry()
        .execute_tool(&tool, args, invocation.auth_token.as_deref(), &context)
        .await;
    Response::ok(envelope)
}
