//! Tool contract.
//!
//! Every capability the reasoning engine can invoke is described by a
//! [`ToolDescriptor`]: canonical name, JSON-Schema parameters, execution
//! mode, source, and the executor that runs it. Executors are one of
//!
//! - [`Tool`] for one-shot synchronous calls,
//! - [`AsyncTool`] for stepped long-running work with progress, or
//! - a [`TriggerFactory`] producing persistent event sources.
//!
//! Results always leave the registry as a JSON envelope carrying
//! `success` and `error` alongside the tool's own fields.

pub mod async_exec;
pub mod builtins;
pub mod plugins;
pub mod registry;
pub mod schema;

pub use async_exec::{AsyncJobQueue, AsyncTool, JobStatus, ProgressEvent, StepOutcome};
pub use registry::{normalize_tool_name, ToolRegistry};
pub use schema::{
    create_retry_guidance, validate_tool_call, validate_tool_calls, ToolCallRequest,
    ValidationBatch, ValidationResult,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::run::{ChildWatch, RunManager};
use crate::trigger::Trigger;

// ── Descriptor ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sync,
    Async,
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolSource {
    Native,
    Plugin,
}

/// Advisory runtime estimate for an async tool, derived from its args.
pub type DurationEstimator = Arc<dyn Fn(&Value) -> Duration + Send + Sync>;

/// Builds a fresh trigger instance for one workflow node.
pub type TriggerFactory = Arc<dyn Fn() -> Box<dyn Trigger> + Send + Sync>;

/// How a descriptor is executed.
#[derive(Clone)]
pub enum Executor {
    Call(Arc<dyn Tool>),
    Async(Arc<dyn AsyncTool>),
    Trigger(TriggerFactory),
}

/// Registry metadata plus executable reference for a tool.
#[derive(Clone)]
pub struct ToolDescriptor {
    /// Canonical (normalized) name.
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the expected arguments.
    pub parameters: Value,
    pub mode: ExecutionMode,
    pub source: ToolSource,
    pub supports_progress: bool,
    pub duration_estimator: Option<DurationEstimator>,
    pub executor: Executor,
}

impl ToolDescriptor {
    /// A one-shot tool.
    pub fn sync(
        name: &str,
        description: &str,
        parameters: Value,
        tool: Arc<dyn Tool>,
    ) -> Self {
        Self {
            name: normalize_tool_name(name),
            description: description.to_string(),
            parameters,
            mode: ExecutionMode::Sync,
            source: ToolSource::Native,
            supports_progress: false,
            duration_estimator: None,
            executor: Executor::Call(tool),
        }
    }

    /// A stepped long-running tool. Name, schema, and estimates come from
    /// the tool itself.
    pub fn asynchronous(tool: Arc<dyn AsyncTool>) -> Self {
        let estimator_src = tool.clone();
        Self {
            name: normalize_tool_name(tool.name()),
            description: tool.description().to_string(),
            parameters: tool.parameters(),
            mode: ExecutionMode::Async,
            source: ToolSource::Native,
            supports_progress: tool.supports_progress(),
            duration_estimator: Some(Arc::new(move |args: &Value| {
                estimator_src.estimated_duration(args)
            })),
            executor: Executor::Async(tool),
        }
    }

    /// A persistent event source.
    pub fn trigger(
        name: &str,
        description: &str,
        parameters: Value,
        factory: TriggerFactory,
    ) -> Self {
        Self {
            name: normalize_tool_name(name),
            description: description.to_string(),
            parameters,
            mode: ExecutionMode::Trigger,
            source: ToolSource::Native,
            supports_progress: false,
            duration_estimator: None,
            executor: Executor::Trigger(factory),
        }
    }

    pub fn with_source(mut self, source: ToolSource) -> Self {
        self.source = source;
        self
    }

    /// Advisory estimate for these args, if the tool provides one.
    pub fn estimated_duration(&self, args: &Value) -> Option<Duration> {
        self.duration_estimator.as_ref().map(|f| f(args))
    }

    /// Spec handed to the reasoning engine and the validator.
    pub fn function_spec(&self) -> FunctionSpec {
        FunctionSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// New trigger instance, for trigger-mode descriptors.
    pub fn instantiate_trigger(&self) -> Option<Box<dyn Trigger>> {
        match &self.executor {
            Executor::Trigger(factory) => Some(factory()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("source", &self.source)
            .field("supports_progress", &self.supports_progress)
            .finish()
    }
}

/// `{name, description, parameters}` as exposed to the reasoning engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

// ── Per-call context ─────────────────────────────────────────

/// Identity and cancellation handed to every executor.
#[derive(Clone)]
pub struct ToolContext {
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    pub auth_token: Option<String>,
    /// Extra fields supplied by the engine (`--context` for the facade).
    pub extras: Map<String, Value>,
    /// Signalled when the owning run stops.
    pub cancel: CancellationToken,
    runs: Arc<RunManager>,
}

impl ToolContext {
    pub fn new(runs: Arc<RunManager>) -> Self {
        Self {
            user_id: None,
            conversation_id: None,
            auth_token: None,
            extras: Map::new(),
            cancel: CancellationToken::new(),
            runs,
        }
    }

    /// Context for a standalone call with its own run table.
    pub fn detached() -> Self {
        Self::new(Arc::new(RunManager::new()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Hand a spawned process to the conversation's run so stopping the
    /// run terminates it.
    pub fn register_child(&self, child: Child) -> ChildWatch {
        match self.conversation_id.as_deref() {
            Some(id) if self.runs.get(id).is_some() => self.runs.register_child(id, child),
            _ => self.runs.watch_untracked(child),
        }
    }

    /// Serializable view passed across the plugin process boundary.
    /// The auth token is included because plugins authenticate with it.
    pub fn to_json(&self) -> Value {
        json!({
            "userId": self.user_id,
            "conversationId": self.conversation_id,
            "authToken": self.auth_token,
            "extras": self.extras,
        })
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("user_id", &self.user_id)
            .field("conversation_id", &self.conversation_id)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("extras", &self.extras)
            .finish()
    }
}

// ── Tool trait ───────────────────────────────────────────────

/// Trait implemented by every one-shot tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Execute with validated params and optional workflow input.
    async fn execute(&self, params: Value, input: Value, ctx: &ToolContext)
        -> anyhow::Result<Value>;
}

// ── Result envelope ──────────────────────────────────────────

/// Tagged result of a dispatch.
#[derive(Debug)]
pub enum ToolOutcome {
    Success(Value),
    Failure(ToolError),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    /// Render the `{...fields, success, error}` envelope.
    pub fn into_envelope(self, tool: &str) -> Value {
        match self {
            ToolOutcome::Success(v) => success_envelope(v),
            ToolOutcome::Failure(e) => error_envelope(tool, &e),
        }
    }
}

/// Merge `success: true, error: null` into a tool's result. Non-object
/// results are wrapped under `result`. A tool that already reports
/// `success` keeps its own verdict.
pub fn success_envelope(value: Value) -> Value {
    let mut obj = match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".into(), other);
            map
        }
    };
    obj.entry("success").or_insert(Value::Bool(true));
    obj.entry("error").or_insert(Value::Null);
    Value::Object(obj)
}

/// Structured failure envelope carrying the tool name.
pub fn error_envelope(tool: &str, err: &ToolError) -> Value {
    json!({
        "success": false,
        "error": err.to_string(),
        "code": err.code(),
        "tool": tool,
    })
}

/// Truncate a UTF-8 `String` to at most `max_bytes` on a char boundary,
/// returning the (possibly shortened) owned `String`.
pub(crate) fn truncate_utf8_owned(mut s: String, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s
}
