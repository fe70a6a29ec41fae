//! Long-running tools.
//!
//! An [`AsyncTool`] runs as a sequence of discrete steps separated by
//! waits. After every step a [`ProgressEvent`] is delivered, in step order,
//! before the next wait begins. Cancellation is cooperative: the run's token
//! is checked between steps and interrupts the inter-step wait, but a step
//! that has started always finishes.
//!
//! [`AsyncJobQueue`] runs these tools in the background and keeps a record
//! of each execution (status, progress history, final result).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::run::RunManager;

/// Upper bound on storage reserved up front; plans come from tool arguments.
const PREALLOC_STEPS: usize = 256;

// ── Contract ─────────────────────────────────────────────────

/// Number of steps and the wait between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    pub steps: usize,
    pub interval: Duration,
}

/// Result of one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Partial data reported in the progress event.
    pub data: Value,
    /// Numeric sample folded into the min/max/mean summary.
    pub sample: Option<f64>,
}

/// Progress snapshot delivered after each step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// 1-based index of the step just completed.
    pub step: usize,
    pub total: usize,
    pub data: Value,
    pub percent_complete: u32,
    pub timestamp: DateTime<Utc>,
}

/// Min/max/mean over step samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub highest: f64,
    pub lowest: f64,
    pub average: f64,
}

impl Summary {
    pub fn of(samples: &[f64]) -> Option<Summary> {
        if samples.is_empty() {
            return None;
        }
        let highest = samples.iter().cloned().fold(f64::MIN, f64::max);
        let lowest = samples.iter().cloned().fold(f64::MAX, f64::min);
        let average = samples.iter().sum::<f64>() / samples.len() as f64;
        Some(Summary { highest, lowest, average })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncRunStatus {
    Completed,
    Cancelled,
}

impl AsyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncRunStatus::Completed => "completed",
            AsyncRunStatus::Cancelled => "cancelled",
        }
    }
}

/// Trait implemented by every stepped tool.
#[async_trait]
pub trait AsyncTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the arguments.
    fn parameters(&self) -> Value;

    fn supports_progress(&self) -> bool {
        true
    }

    /// Advisory only; nothing enforces it.
    fn estimated_duration(&self, args: &Value) -> Duration;

    fn plan(&self, args: &Value) -> anyhow::Result<StepPlan>;

    /// Perform step `index` (0-based).
    async fn step(&self, index: usize, args: &Value) -> anyhow::Result<StepOutcome>;

    /// Build the domain fields of the final envelope.
    fn finish(
        &self,
        args: &Value,
        steps: &[StepOutcome],
        summary: Option<Summary>,
        status: AsyncRunStatus,
    ) -> Value;
}

/// Final result of one execution.
#[derive(Debug, Clone)]
pub struct AsyncRun {
    pub status: AsyncRunStatus,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub progress: Vec<ProgressEvent>,
    pub summary: Option<Summary>,
    pub result: Value,
}

impl AsyncRun {
    /// Envelope: the tool's fields plus status and success/error.
    pub fn into_json(self) -> Value {
        let mut obj = match self.result {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("result".into(), other);
                map
            }
        };
        obj.insert("status".into(), json!(self.status.as_str()));
        obj.insert("completedSteps".into(), json!(self.completed_steps));
        obj.insert("totalSteps".into(), json!(self.total_steps));
        match self.status {
            AsyncRunStatus::Completed => {
                obj.insert("success".into(), json!(true));
                obj.insert("error".into(), Value::Null);
            }
            AsyncRunStatus::Cancelled => {
                obj.insert("success".into(), json!(false));
                obj.insert("error".into(), json!("cancelled"));
            }
        }
        Value::Object(obj)
    }
}

fn percent(step: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    ((step as f64 / total as f64) * 100.0).round() as u32
}

/// Execute `tool` to completion or cancellation.
///
/// `on_progress` is called synchronously after each step, before the next
/// wait. Step errors abort the execution.
pub async fn run_async_tool<F>(
    tool: &dyn AsyncTool,
    args: &Value,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> anyhow::Result<AsyncRun>
where
    F: FnMut(&ProgressEvent) + Send,
{
    let plan = tool.plan(args)?;
    let reserve = plan.steps.min(PREALLOC_STEPS);
    let mut steps: Vec<StepOutcome> = Vec::with_capacity(reserve);
    let mut progress = Vec::with_capacity(reserve);

    debug!(
        tool = %tool.name(),
        steps = plan.steps,
        interval_ms = plan.interval.as_millis() as u64,
        "async tool starting"
    );

    for index in 0..plan.steps {
        if cancel.is_cancelled() {
            break;
        }
        if index > 0 && !plan.interval.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(plan.interval) => {}
            }
        }

        let outcome = tool.step(index, args).await?;
        let event = ProgressEvent {
            step: index + 1,
            total: plan.steps,
            data: outcome.data.clone(),
            percent_complete: percent(index + 1, plan.steps),
            timestamp: Utc::now(),
        };
        steps.push(outcome);
        on_progress(&event);
        progress.push(event);
    }

    let status = if steps.len() == plan.steps {
        AsyncRunStatus::Completed
    } else {
        AsyncRunStatus::Cancelled
    };
    let samples: Vec<f64> = steps.iter().filter_map(|s| s.sample).collect();
    let summary = Summary::of(&samples);
    let result = tool.finish(args, &steps, summary, status);

    info!(
        tool = %tool.name(),
        status = status.as_str(),
        completed = steps.len(),
        total = plan.steps,
        "async tool finished"
    );

    Ok(AsyncRun {
        status,
        completed_steps: steps.len(),
        total_steps: plan.steps,
        progress,
        summary,
        result,
    })
}

// ── Job queue ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

/// Record of one background execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub run_id: String,
    pub tool: String,
    pub args: Value,
    pub status: JobStatus,
    pub progress: Vec<ProgressEvent>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobSlot {
    record: JobRecord,
    done: watch::Receiver<bool>,
}

/// Background executor for async tools, bound to run cancellation.
pub struct AsyncJobQueue {
    runs: Arc<RunManager>,
    max_per_run: usize,
    jobs: Mutex<HashMap<String, JobSlot>>,
    limits: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl AsyncJobQueue {
    pub fn new(runs: Arc<RunManager>, max_per_run: usize) -> Self {
        Self {
            runs,
            max_per_run: max_per_run.max(1),
            jobs: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
        }
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobSlot>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limit_for(&self, run_id: &str) -> Arc<Semaphore> {
        let mut limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        limits
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_run)))
            .clone()
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut JobRecord)) {
        if let Some(slot) = self.jobs().get_mut(id) {
            f(&mut slot.record);
        }
    }

    /// Start `tool` in the background for `run_id`; returns the job id.
    ///
    /// The job waits while the run already has `max_per_run` jobs running,
    /// and is cancelled with the run.
    pub fn enqueue(self: &Arc<Self>, run_id: &str, tool: Arc<dyn AsyncTool>, args: Value) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let (done_tx, done_rx) = watch::channel(false);
        let record = JobRecord {
            id: id.clone(),
            run_id: run_id.to_string(),
            tool: tool.name().to_string(),
            args: args.clone(),
            status: JobStatus::Queued,
            progress: Vec::new(),
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.jobs().insert(id.clone(), JobSlot { record, done: done_rx });

        let cancel = self.runs.create(run_id).token();
        let limit = self.limit_for(run_id);
        let queue = Arc::clone(self);
        let job_id = id.clone();

        info!(job_id = %id, run_id = %run_id, tool = %tool.name(), "async job queued");

        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = limit.acquire_owned() => permit.ok(),
            };
            let Some(_permit) = permit else {
                queue.update(&job_id, |r| {
                    r.status = JobStatus::Cancelled;
                    r.finished_at = Some(Utc::now());
                });
                let _ = done_tx.send(true);
                return;
            };

            queue.update(&job_id, |r| {
                r.status = JobStatus::Running;
                r.started_at = Some(Utc::now());
            });

            let progress_queue = Arc::clone(&queue);
            let progress_id = job_id.clone();
            let outcome = run_async_tool(tool.as_ref(), &args, &cancel, move |event| {
                progress_queue.update(&progress_id, |r| r.progress.push(event.clone()));
            })
            .await;

            queue.update(&job_id, |r| {
                r.finished_at = Some(Utc::now());
                match outcome {
                    Ok(run) => {
                        r.status = match run.status {
                            AsyncRunStatus::Completed => JobStatus::Completed,
                            AsyncRunStatus::Cancelled => JobStatus::Cancelled,
                        };
                        r.result = Some(run.into_json());
                    }
                    Err(e) => {
                        warn!(job_id = %r.id, error = %e, "async job failed");
                        r.status = JobStatus::Failed;
                        r.error = Some(format!("{e:#}"));
                    }
                }
            });
            let _ = done_tx.send(true);
        });

        id
    }

    pub fn status(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs().get(job_id).map(|s| s.record.clone())
    }

    /// Jobs belonging to a run, oldest first.
    pub fn jobs_for_run(&self, run_id: &str) -> Vec<JobRecord> {
        let mut out: Vec<JobRecord> = self
            .jobs()
            .values()
            .filter(|s| s.record.run_id == run_id)
            .map(|s| s.record.clone())
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Wait until the job finishes and return its final record.
    pub async fn wait(&self, job_id: &str) -> Option<JobRecord> {
        let mut rx = self.jobs().get(job_id)?.done.clone();
        let _ = rx.wait_for(|done| *done).await;
        self.status(job_id)
    }

    /// Number of runs holding a concurrency limit.
    pub fn tracked_runs(&self) -> usize {
        self.limits.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Release the concurrency limit of a run that is gone.
    ///
    /// Jobs still waiting on the old limit keep their handle to it.
    pub fn forget_run(&self, run_id: &str) {
        let removed = self
            .limits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id);
        if removed.is_some() {
            debug!(run_id = %run_id, "job limit released");
        }
    }

    /// Drop finished jobs older than `older_than`, along with the limits of
    /// runs left without jobs. Returns how many jobs were removed.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut jobs = self.jobs();
        let before = jobs.len();
        jobs.retain(|_, s| {
            !(s.record.status.is_finished()
                && s.record.finished_at.map(|t| t <= cutoff).unwrap_or(false))
        });
        let removed = before - jobs.len();

        let mut limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        limits.retain(|run_id, _| jobs.values().any(|s| &s.record.run_id == run_id));
        removed
    }
}
