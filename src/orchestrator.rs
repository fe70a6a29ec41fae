//! The orchestrator owns one run table, one tool registry, and one async
//! job queue, and drives a reasoning-engine turn through them.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::ToolError;
use crate::run::{RunManager, StopOutcome};
use crate::tools::registry::InvocationContext;
use crate::tools::schema::{validate_tool_calls_with, ValidationMode};
use crate::tools::{
    builtins, create_retry_guidance, error_envelope, AsyncJobQueue, Executor, ToolCallRequest,
    ToolRegistry, ValidationBatch,
};
use crate::trigger::{TriggerEngine, TriggerLifecycle, TriggerNode};

/// Caller identity attached to every call of a turn.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub user_id: Option<String>,
    pub auth_token: Option<String>,
    pub extras: Map<String, Value>,
}

/// Envelope produced for one dispatched (or skipped) call.
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    pub name: String,
    pub envelope: Value,
}

/// Everything a turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// One entry per valid call, in request order.
    pub results: Vec<CallResult>,
    /// Present when at least one call failed validation.
    pub guidance: Option<String>,
    pub batch: ValidationBatch,
}

pub struct Orchestrator {
    config: Config,
    runs: Arc<RunManager>,
    registry: Arc<ToolRegistry>,
    jobs: Arc<AsyncJobQueue>,
}

impl Orchestrator {
    /// Build the run table, registry (with native tools), and job queue
    /// from configuration. Plugins are discovered lazily on first use.
    pub fn new(config: Config) -> Self {
        let runs = Arc::new(RunManager::with_grace(Duration::from_millis(
            config.runs.termination_grace_ms,
        )));
        let registry = Arc::new(ToolRegistry::new(
            Some(config.plugins_path()),
            runs.clone(),
        ));
        builtins::register_all(&registry, &config);
        let jobs = Arc::new(AsyncJobQueue::new(
            runs.clone(),
            config.async_jobs.max_concurrent_per_run,
        ));
        Self {
            config,
            runs,
            registry,
            jobs,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn runs(&self) -> &Arc<RunManager> {
        &self.runs
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn jobs(&self) -> &Arc<AsyncJobQueue> {
        &self.jobs
    }

    // ── Runs ─────────────────────────────────────────────────

    pub fn start_run(&self, run_id: &str) -> Arc<crate::run::Run> {
        self.runs.create(run_id)
    }

    pub fn stop_run(&self, run_id: &str, reason: &str) -> StopOutcome {
        self.runs.stop(run_id, reason)
    }

    /// Drop the run and the job queue's per-run limit.
    pub fn clear_run(&self, run_id: &str) {
        self.runs.clear(run_id);
        self.jobs.forget_run(run_id);
    }

    // ── Turns ────────────────────────────────────────────────

    /// Validate a batch of proposed calls, dispatch the valid ones in
    /// order, and build retry guidance for the rest.
    ///
    /// Once the run is cancelled, remaining calls are not dispatched and
    /// get a `cancelled` envelope instead.
    pub async fn handle_tool_calls(
        &self,
        run_id: &str,
        calls: &[ToolCallRequest],
        identity: &Identity,
    ) -> TurnOutcome {
        self.registry.ensure_initialized().await;
        let specs = self.registry.function_specs();
        let mode = ValidationMode::from_strict(self.config.validation.strict);
        let batch = validate_tool_calls_with(calls, &specs, mode);

        info!(
            run_id = %run_id,
            valid = batch.valid.len(),
            invalid = batch.invalid.len(),
            "handling tool calls"
        );

        let invocation = InvocationContext {
            user_id: identity.user_id.clone(),
            conversation_id: Some(run_id.to_string()),
            extras: identity.extras.clone(),
        };

        let mut results = Vec::with_capacity(batch.valid.len());
        for call in &batch.valid {
            let name = call.call.name.clone();
            if self.runs.is_cancelled(run_id) {
                debug!(run_id = %run_id, tool = %name, "run cancelled, skipping dispatch");
                let err = ToolError::Cancelled(run_id.to_string());
                results.push(CallResult {
                    envelope: error_envelope(&name, &err),
                    name,
                });
                continue;
            }
            let args = call.sanitized_args.clone().unwrap_or(Value::Object(Map::new()));
            let envelope = self
                .registry
                .execute_tool(&name, args, identity.auth_token.as_deref(), &invocation)
                .await;
            results.push(CallResult { name, envelope });
        }

        let guidance = if batch.invalid.is_empty() {
            None
        } else {
            Some(create_retry_guidance(&batch.invalid, &specs))
        };

        TurnOutcome {
            results,
            guidance,
            batch,
        }
    }

    // ── Background work ──────────────────────────────────────

    /// Queue an async tool for `run_id`; returns the job id.
    pub async fn enqueue_async(
        &self,
        run_id: &str,
        name: &str,
        args: Value,
    ) -> Result<String, ToolError> {
        self.registry.ensure_initialized().await;
        let descriptor = self
            .registry
            .resolve(name)
            .ok_or_else(|| ToolError::UnknownTool(name.trim().to_string()))?;
        match descriptor.executor {
            Executor::Async(tool) => Ok(self.jobs.enqueue(run_id, tool, args)),
            _ => Err(ToolError::ExecutorFailure {
                tool: descriptor.name,
                message: "not an async tool".into(),
            }),
        }
    }

    /// Drop finished jobs past the configured retention.
    pub fn purge_jobs(&self) -> usize {
        self.jobs
            .purge_finished(Duration::from_secs(self.config.async_jobs.retention_secs))
    }

    /// Instantiate a trigger tool for `node` and start listening.
    ///
    /// On setup failure the engine has already been told; the error is
    /// returned so the caller can decide what to do with the workflow.
    pub async fn activate_trigger(
        &self,
        name: &str,
        engine: Arc<dyn TriggerEngine>,
        node: TriggerNode,
    ) -> Result<TriggerLifecycle, ToolError> {
        self.registry.ensure_initialized().await;
        let descriptor = self
            .registry
            .resolve(name)
            .ok_or_else(|| ToolError::UnknownTool(name.trim().to_string()))?;
        let trigger = descriptor
            .instantiate_trigger()
            .ok_or_else(|| ToolError::TriggerSetupFailure {
                node: node.id.clone(),
                message: format!("'{}' is not a trigger tool", descriptor.name),
            })?;
        let mut lifecycle = TriggerLifecycle::new(trigger);
        lifecycle.setup(engine, node).await?;
        Ok(lifecycle)
    }
}
