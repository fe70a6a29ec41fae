//! Tool registry: the single source of truth for name → descriptor.
//!
//! Native tools are registered up front; plugin tools are discovered once,
//! lazily, on the first call to [`ToolRegistry::ensure_initialized`].
//! Names are normalized here and nowhere else.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::{json, Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::async_exec;
use super::{plugins, Executor, FunctionSpec, ToolContext, ToolDescriptor, ToolOutcome};
use crate::error::ToolError;
use crate::run::RunManager;

/// Canonical tool name: trimmed, lowercased, `-` and spaces folded to `_`.
pub fn normalize_tool_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Caller identity for one dispatch. The auth token is passed separately.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub user_id: Option<String>,
    pub conversation_id: Option<String>,
    /// Engine-supplied extras, forwarded untouched to the tool.
    pub extras: Map<String, Value>,
}

pub struct ToolRegistry {
    native: RwLock<BTreeMap<String, ToolDescriptor>>,
    plugins: RwLock<BTreeMap<String, ToolDescriptor>>,
    plugins_dir: Option<PathBuf>,
    init: OnceCell<()>,
    scans: AtomicUsize,
    runs: Arc<RunManager>,
}

impl ToolRegistry {
    /// Empty registry. `plugins_dir == None` disables discovery.
    pub fn new(plugins_dir: Option<PathBuf>, runs: Arc<RunManager>) -> Self {
        Self {
            native: RwLock::new(BTreeMap::new()),
            plugins: RwLock::new(BTreeMap::new()),
            plugins_dir,
            init: OnceCell::new(),
            scans: AtomicUsize::new(0),
            runs,
        }
    }

    pub fn runs(&self) -> &Arc<RunManager> {
        &self.runs
    }

    /// Register (or replace) a native tool.
    pub fn register(&self, descriptor: ToolDescriptor) {
        let name = descriptor.name.clone();
        let mut native = self.native.write().unwrap_or_else(|e| e.into_inner());
        if native.insert(name.clone(), descriptor).is_some() {
            debug!(tool = %name, "native tool replaced");
        }
    }

    // ── Initialization ───────────────────────────────────────

    /// Discover plugins exactly once. Concurrent callers await the same
    /// in-flight scan.
    pub async fn ensure_initialized(&self) {
        self.init
            .get_or_init(|| async {
                let count = self.scan_plugins().await;
                info!(
                    native = self.native_names().len(),
                    plugins = count,
                    "tool registry initialized"
                );
            })
            .await;
    }

    pub fn is_initialized(&self) -> bool {
        self.init.initialized()
    }

    /// How many plugin scans have run. Stays at 1 after any number of
    /// `ensure_initialized` calls unless plugins are reloaded.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Re-scan the plugins directory, replacing the plugin set.
    pub async fn reload_plugins(&self) -> usize {
        let count = self.scan_plugins().await;
        let _ = self.init.set(());
        count
    }

    async fn scan_plugins(&self) -> usize {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let found = match &self.plugins_dir {
            Some(dir) => plugins::discover(dir).await,
            None => Vec::new(),
        };

        let mut map = BTreeMap::new();
        for desc in found {
            if map.contains_key(&desc.name) {
                warn!(tool = %desc.name, "duplicate plugin tool name, keeping first");
                continue;
            }
            map.insert(desc.name.clone(), desc);
        }
        let count = map.len();
        *self.plugins.write().unwrap_or_else(|e| e.into_inner()) = map;
        count
    }

    // ── Lookup ───────────────────────────────────────────────

    /// Look up a descriptor, natives first.
    pub fn resolve(&self, name: &str) -> Option<ToolDescriptor> {
        let key = normalize_tool_name(name);
        if let Some(d) = self
            .native
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
        {
            return Some(d.clone());
        }
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    /// Merged list; a native tool shadows a plugin tool of the same name.
    pub fn get_all_tools_including_plugins(&self) -> Vec<ToolDescriptor> {
        let native = self.native.read().unwrap_or_else(|e| e.into_inner());
        let plugins = self.plugins.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<ToolDescriptor> = native.values().cloned().collect();
        for (name, desc) in plugins.iter() {
            if native.contains_key(name) {
                debug!(tool = %name, "plugin tool shadowed by native tool");
                continue;
            }
            all.push(desc.clone());
        }
        all
    }

    /// Specs for every invocable tool, as offered to the reasoning engine.
    pub fn function_specs(&self) -> Vec<FunctionSpec> {
        self.get_all_tools_including_plugins()
            .iter()
            .map(ToolDescriptor::function_spec)
            .collect()
    }

    pub fn native_names(&self) -> Vec<String> {
        self.native
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    // ── Dispatch ─────────────────────────────────────────────

    /// Build the per-call context, wiring in the run's token when the
    /// conversation has a run.
    pub fn context_for(&self, auth_token: Option<&str>, invocation: &InvocationContext) -> ToolContext {
        let mut ctx = ToolContext::new(self.runs.clone());
        ctx.user_id = invocation.user_id.clone();
        ctx.conversation_id = invocation.conversation_id.clone();
        ctx.auth_token = auth_token.map(str::to_string);
        ctx.extras = invocation.extras.clone();
        if let Some(run) = invocation
            .conversation_id
            .as_deref()
            .and_then(|id| self.runs.get(id))
        {
            ctx.cancel = run.token();
        }
        ctx
    }

    /// Resolve and run a tool, always returning a JSON envelope.
    pub async fn execute_tool(
        &self,
        name: &str,
        args: Value,
        auth_token: Option<&str>,
        invocation: &InvocationContext,
    ) -> Value {
        let outcome = self.dispatch(name, args, auth_token, invocation).await;
        let tool = normalize_tool_name(name);
        if let ToolOutcome::Failure(e) = &outcome {
            warn!(tool = %tool, code = e.code(), error = %e, "tool call failed");
        }
        outcome.into_envelope(&tool)
    }

    /// Same as [`execute_tool`](Self::execute_tool) but keeps the tagged
    /// outcome.
    pub async fn dispatch(
        &self,
        name: &str,
        args: Value,
        auth_token: Option<&str>,
        invocation: &InvocationContext,
    ) -> ToolOutcome {
        self.ensure_initialized().await;

        let Some(descriptor) = self.resolve(name) else {
            return ToolOutcome::Failure(ToolError::UnknownTool(name.trim().to_string()));
        };

        let ctx = self.context_for(auth_token, invocation);
        if ctx.is_cancelled() {
            let run = invocation.conversation_id.clone().unwrap_or_default();
            return ToolOutcome::Failure(ToolError::Cancelled(run));
        }

        info!(
            tool = %descriptor.name,
            mode = ?descriptor.mode,
            source = ?descriptor.source,
            conversation_id = ?ctx.conversation_id,
            "executing tool"
        );

        match descriptor.executor.clone() {
            Executor::Call(executor) => {
                let handle = tokio::spawn({
                    let ctx = ctx.clone();
                    async move { executor.execute(args, Value::Null, &ctx).await }
                });
                match handle.await {
                    Ok(Ok(value)) => ToolOutcome::Success(value),
                    Ok(Err(e)) => ToolOutcome::Failure(ToolError::ExecutorFailure {
                        tool: descriptor.name.clone(),
                        message: format!("{e:#}"),
                    }),
                    Err(join) => ToolOutcome::Failure(ToolError::ExecutorFailure {
                        tool: descriptor.name.clone(),
                        message: join_error_message(join),
                    }),
                }
            }
            Executor::Async(executor) => {
                let estimate = descriptor.estimated_duration(&args);
                let tool_name = descriptor.name.clone();
                let handle = tokio::spawn({
                    let cancel = ctx.cancel.clone();
                    async move {
                        async_exec::run_async_tool(executor.as_ref(), &args, &cancel, |event| {
                            debug!(
                                tool = %tool_name,
                                step = event.step,
                                total = event.total,
                                percent = event.percent_complete,
                                "async tool progress"
                            );
                        })
                        .await
                    }
                });
                match handle.await {
                    Ok(Ok(run)) => {
                        let mut env = run.into_json();
                        if let (Some(d), Some(obj)) = (estimate, env.as_object_mut()) {
                            obj.insert("estimatedDurationMs".into(), json!(d.as_millis() as u64));
                        }
                        ToolOutcome::Success(env)
                    }
                    Ok(Err(e)) => ToolOutcome::Failure(ToolError::ExecutorFailure {
                        tool: descriptor.name.clone(),
                        message: format!("{e:#}"),
                    }),
                    Err(join) => ToolOutcome::Failure(ToolError::ExecutorFailure {
                        tool: descriptor.name.clone(),
                        message: join_error_message(join),
                    }),
                }
            }
            Executor::Trigger(_) => ToolOutcome::Failure(ToolError::ExecutorFailure {
                tool: descriptor.name.clone(),
                message: "trigger tools are activated by a workflow engine, not invoked directly"
                    .into(),
            }),
        }
    }
}

fn join_error_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "tool task was cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("tool panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("tool panicked: {s}")
    } else {
        "tool panicked".to_string()
    }
}
