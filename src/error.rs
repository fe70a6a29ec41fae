//! Error taxonomy shared by the validator, registry, and trigger layers.
//!
//! Tool bodies use `anyhow::Result`; these variants only appear where a
//! failure has to be reported structurally (validation results, dispatch
//! envelopes, trigger setup).

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// The requested name is absent from the registry.
    #[error("Tool '{0}' not found in available tools")]
    UnknownTool(String),

    /// The argument payload is not valid JSON or violates the tool schema.
    #[error("{0}")]
    MalformedArguments(String),

    /// Tool logic failed or panicked during dispatch.
    #[error("tool '{tool}' failed: {message}")]
    ExecutorFailure { tool: String, message: String },

    /// A trigger could not acquire its resources or subscription.
    #[error("trigger '{node}' setup failed: {message}")]
    TriggerSetupFailure { node: String, message: String },

    /// A plugin manifest could not be read or is missing required fields.
    #[error("invalid plugin manifest {path}: {message}")]
    PluginManifest { path: String, message: String },

    /// The owning run was cancelled before the call could be dispatched.
    #[error("run '{0}' was cancelled")]
    Cancelled(String),
}

impl ToolError {
    /// Stable machine-readable code for envelopes and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::MalformedArguments(_) => "malformed_arguments",
            ToolError::ExecutorFailure { .. } => "executor_failure",
            ToolError::TriggerSetupFailure { .. } => "trigger_setup_failure",
            ToolError::PluginManifest { .. } => "plugin_manifest",
            ToolError::Cancelled(_) => "cancelled",
        }
    }

    /// Whether the reasoning engine can correct the call and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolError::UnknownTool(_) | ToolError::MalformedArguments(_)
        )
    }
}
