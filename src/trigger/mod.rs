//! Persistent event sources ("triggers") and their lifecycle.
//!
//! A [`Trigger`] knows how to open one external subscription, recognise its
//! own events, and turn them into workflow input. [`TriggerLifecycle`] wraps
//! a trigger for one workflow node and drives the state machine
//!
//! ```text
//! Uninitialized -> SettingUp -> Listening <-> Processing -> TornDown
//!                      \-> Error -> TornDown
//! ```
//!
//! Setup failures are reported to the engine and returned, never retried.
//! Teardown is idempotent and safe after a failed or partial setup.

pub mod timer;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Uninitialized,
    SettingUp,
    Listening,
    Processing,
    TornDown,
    Error,
}

/// Workflow status transitions a trigger can request from its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Listening,
    Error,
    Stopped,
}

/// The workflow node a trigger instance is bound to.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerNode {
    pub id: String,
    pub workflow_id: String,
    #[serde(default)]
    pub parameters: Value,
}

/// What a trigger needs from the workflow engine that owns it.
#[async_trait]
pub trait TriggerEngine: Send + Sync {
    /// Record a live resource so the engine can account for it.
    fn register_resource(&self, node_id: &str, kind: &str);
    /// Forward processed input into the workflow.
    async fn emit(&self, node_id: &str, input: Value);
    fn report_node_error(&self, node_id: &str, message: &str);
    fn set_workflow_status(&self, workflow_id: &str, status: WorkflowStatus);
}

/// An open external subscription.
///
/// Dropping the receiver or cancelling `stop` must end the producer.
pub struct Subscription {
    pub events: mpsc::Receiver<Value>,
    pub stop: CancellationToken,
}

/// A persistent event source.
#[async_trait]
pub trait Trigger: Send + Sync {
    /// Resource kind reported to the engine (e.g. `"timer"`).
    fn kind(&self) -> &str;

    /// JSON Schema for the node parameters, checked before subscribing.
    fn parameters(&self) -> Value {
        json!({ "type": "object" })
    }

    /// Acquire resources and open the subscription.
    async fn subscribe(&self, node: &TriggerNode) -> anyhow::Result<Subscription>;

    /// Cheap structural check; foreign or malformed events return `false`.
    fn validate(&self, event: &Value, node: &TriggerNode) -> bool;

    /// Pure transform from raw event to workflow input.
    fn process(&self, event: &Value) -> Value;

    /// Release anything `subscribe` acquired outside the subscription.
    /// Called on every teardown, including after a failed setup.
    async fn release(&self) {}
}

/// Drives one trigger instance through its lifecycle.
pub struct TriggerLifecycle {
    trigger: Arc<dyn Trigger>,
    state: Arc<Mutex<TriggerState>>,
    node: Option<TriggerNode>,
    stop: Option<CancellationToken>,
    listener: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TriggerLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerLifecycle")
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl TriggerLifecycle {
    pub fn new(trigger: Box<dyn Trigger>) -> Self {
        Self {
            trigger: Arc::from(trigger),
            state: Arc::new(Mutex::new(TriggerState::Uninitialized)),
            node: None,
            stop: None,
            listener: None,
        }
    }

    pub fn state(&self) -> TriggerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: TriggerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    pub fn node(&self) -> Option<&TriggerNode> {
        self.node.as_ref()
    }

    fn check_parameters(&self, node: &TriggerNode) -> Result<(), String> {
        let schema = self.trigger.parameters();
        let compiled = JSONSchema::options()
            .should_validate_formats(false)
            .compile(&schema)
            .map_err(|e| format!("invalid parameter schema: {e}"))?;
        let params = if node.parameters.is_null() {
            json!({})
        } else {
            node.parameters.clone()
        };
        let result = compiled.validate(&params);
        if let Err(errors) = result {
            let msgs: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    let path = if path.is_empty() { "root".to_string() } else { path };
                    format!("{path}: {e}")
                })
                .collect();
            return Err(format!("Schema validation failed: {}", msgs.join("; ")));
        }
        Ok(())
    }

    /// Open the subscription and start forwarding events to `engine`.
    pub async fn setup(
        &mut self,
        engine: Arc<dyn TriggerEngine>,
        node: TriggerNode,
    ) -> Result<(), ToolError> {
        if self.state() != TriggerState::Uninitialized {
            return Err(ToolError::TriggerSetupFailure {
                node: node.id.clone(),
                message: format!("setup called in state {:?}", self.state()),
            });
        }
        self.set_state(TriggerState::SettingUp);
        self.node = Some(node.clone());

        let opened = match self.check_parameters(&node) {
            Ok(()) => self.trigger.subscribe(&node).await.map_err(|e| format!("{e:#}")),
            Err(msg) => Err(msg),
        };

        let subscription = match opened {
            Ok(sub) => sub,
            Err(message) => {
                self.set_state(TriggerState::Error);
                error!(node_id = %node.id, kind = %self.trigger.kind(), error = %message, "trigger setup failed");
                engine.report_node_error(&node.id, &message);
                engine.set_workflow_status(&node.workflow_id, WorkflowStatus::Error);
                return Err(ToolError::TriggerSetupFailure {
                    node: node.id.clone(),
                    message,
                });
            }
        };

        engine.register_resource(&node.id, self.trigger.kind());
        self.stop = Some(subscription.stop.clone());
        self.set_state(TriggerState::Listening);
        self.listener = Some(tokio::spawn(listen(
            self.trigger.clone(),
            engine,
            node.clone(),
            subscription,
            self.state.clone(),
        )));

        info!(node_id = %node.id, kind = %self.trigger.kind(), "trigger listening");
        Ok(())
    }

    /// Delegates to the trigger; `false` before setup.
    pub fn validate(&self, event: &Value) -> bool {
        match &self.node {
            Some(node) => self.trigger.validate(event, node),
            None => false,
        }
    }

    pub fn process(&self, event: &Value) -> Value {
        self.trigger.process(event)
    }

    /// Release everything setup acquired. Safe to call repeatedly and in
    /// any state.
    pub async fn teardown(&mut self) {
        if self.state() == TriggerState::TornDown {
            return;
        }
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                warn!(error = %e, "trigger listener ended abnormally");
            }
        }
        self.trigger.release().await;
        self.set_state(TriggerState::TornDown);
        debug!(
            node_id = ?self.node.as_ref().map(|n| n.id.as_str()),
            kind = %self.trigger.kind(),
            "trigger torn down"
        );
    }
}

impl Drop for TriggerLifecycle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop.cancel();
        }
    }
}

async fn listen(
    trigger: Arc<dyn Trigger>,
    engine: Arc<dyn TriggerEngine>,
    node: TriggerNode,
    mut subscription: Subscription,
    state: Arc<Mutex<TriggerState>>,
) {
    let set = |from: TriggerState, to: TriggerState| {
        let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
        if *st == from {
            *st = to;
        }
    };

    loop {
        let event = tokio::select! {
            _ = subscription.stop.cancelled() => break,
            ev = subscription.events.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };

        if !trigger.validate(&event, &node) {
            debug!(node_id = %node.id, "dropping foreign trigger event");
            continue;
        }

        set(TriggerState::Listening, TriggerState::Processing);
        let input = trigger.process(&event);
        engine.emit(&node.id, input).await;
        set(TriggerState::Processing, TriggerState::Listening);
    }
}
