//! Integration tests for stepped async tools and the background job queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use toolgate::run::RunManager;
use toolgate::tools::async_exec::{
    run_async_tool, AsyncRunStatus, StepPlan, Summary,
};
use toolgate::tools::builtins::dice::PeriodicDiceRoller;
use toolgate::tools::{AsyncJobQueue, AsyncTool, JobStatus, StepOutcome};

/// Five steps (by default) reporting their index; counts how many steps
/// actually ran.
struct Counter {
    ran: AtomicUsize,
    steps: usize,
    interval: Duration,
}

impl Counter {
    fn new(interval: Duration) -> Self {
        Self::with_steps(5, interval)
    }

    fn with_steps(steps: usize, interval: Duration) -> Self {
        Self { ran: AtomicUsize::new(0), steps, interval }
    }
}

#[async_trait]
impl AsyncTool for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn description(&self) -> &str {
        "Counts to five"
    }

    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }

    fn estimated_duration(&self, _args: &Value) -> Duration {
        self.interval * 4
    }

    fn plan(&self, _args: &Value) -> anyhow::Result<StepPlan> {
        Ok(StepPlan { steps: self.steps, interval: self.interval })
    }

    async fn step(&self, index: usize, _args: &Value) -> anyhow::Result<StepOutcome> {
        self.ran.fetch_add(1, Ordering::SeqCst);
        Ok(StepOutcome {
            data: json!({ "n": index + 1 }),
            sample: Some((index + 1) as f64),
        })
    }

    fn finish(
        &self,
        _args: &Value,
        steps: &[StepOutcome],
        summary: Option<Summary>,
        _status: AsyncRunStatus,
    ) -> Value {
        json!({ "count": steps.len(), "max": summary.map(|s| s.highest) })
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn completes_all_steps_in_order() {
    let tool = Counter::new(Duration::from_millis(1));
    let cancel = CancellationToken::new();
    let mut seen = Vec::new();

    let run = run_async_tool(&tool, &json!({}), &cancel, |ev| seen.push(ev.step))
        .await
        .unwrap();

    assert_eq!(run.status, AsyncRunStatus::Completed);
    assert_eq!(seen, vec![1, 2, 3, 4, 5], "progress must arrive in step order");
    assert_eq!(run.progress.last().map(|p| p.percent_complete), Some(100));

    let env = run.into_json();
    assert_eq!(env["success"], true);
    assert_eq!(env["count"], 5);
    assert_eq!(env["max"], 5.0);
}

#[tokio::test]
async fn cancelling_after_step_two_of_five_stops_there() {
    let tool = Counter::new(Duration::from_millis(20));
    let cancel = CancellationToken::new();
    let trip = cancel.clone();

    let run = run_async_tool(&tool, &json!({}), &cancel, |ev| {
        if ev.step == 2 {
            trip.cancel();
        }
    })
    .await
    .unwrap();

    assert_eq!(run.status, AsyncRunStatus::Cancelled);
    assert_eq!(run.completed_steps, 2);
    assert_eq!(run.total_steps, 5);
    assert_eq!(tool.ran.load(Ordering::SeqCst), 2, "no step may start after cancellation");

    let env = run.into_json();
    assert_eq!(env["status"], "cancelled");
    assert_eq!(env["success"], false);
    assert_eq!(env["completedSteps"], 2);
}

#[tokio::test]
async fn cancellation_interrupts_the_inter_step_wait() {
    let tool = Counter::new(Duration::from_secs(60));
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trip.cancel();
    });

    let run = tokio::time::timeout(
        Duration::from_secs(5),
        run_async_tool(&tool, &json!({}), &cancel, |_| {}),
    )
    .await
    .expect("a pending wait must not outlive cancellation")
    .unwrap();
    assert_eq!(run.completed_steps, 1);
}

#[tokio::test]
async fn periodic_dice_roller_summarizes_rolls() {
    let cancel = CancellationToken::new();
    // 30ms of rolling every 10ms: three rolls.
    let args = json!({"diceCount": 2, "sides": 6, "intervalSeconds": 0.01, "durationMinutes": 0.0005});
    let run = run_async_tool(&PeriodicDiceRoller, &args, &cancel, |_| {})
        .await
        .unwrap();

    let env = run.into_json();
    assert_eq!(env["totalRolls"], 3);
    assert_eq!(env["allRolls"].as_array().map(Vec::len), Some(3));
    let high = env["summary"]["highest"].as_f64().unwrap();
    let low = env["summary"]["lowest"].as_f64().unwrap();
    assert!((2.0..=12.0).contains(&low) && low <= high);
}

#[tokio::test]
async fn job_queue_records_progress_and_result() {
    let runs = Arc::new(RunManager::new());
    let queue = Arc::new(AsyncJobQueue::new(runs, 4));

    let id = queue.enqueue("conv-1", Arc::new(Counter::new(Duration::from_millis(1))), json!({}));
    let record = queue.wait(&id).await.expect("job should exist");

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.progress.len(), 5);
    assert!(record.started_at.is_some() && record.finished_at.is_some());
    assert_eq!(record.result.as_ref().map(|r| r["count"].clone()), Some(json!(5)));
    assert_eq!(queue.jobs_for_run("conv-1").len(), 1);
}

#[tokio::test]
async fn stopping_the_run_cancels_its_jobs() {
    let runs = Arc::new(RunManager::new());
    let queue = Arc::new(AsyncJobQueue::new(runs.clone(), 4));

    let id = queue.enqueue("conv-1", Arc::new(Counter::new(Duration::from_secs(60))), json!({}));
    wait_until(|| queue.status(&id).map(|r| r.progress.len()) == Some(1)).await;

    runs.stop("conv-1", "user");
    let record = queue.wait(&id).await.unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.progress.len(), 1);
}

#[tokio::test]
async fn per_run_limit_queues_extra_jobs() {
    let runs = Arc::new(RunManager::new());
    let queue = Arc::new(AsyncJobQueue::new(runs.clone(), 1));

    let first = queue.enqueue("conv-1", Arc::new(Counter::new(Duration::from_secs(60))), json!({}));
    let second = queue.enqueue("conv-1", Arc::new(Counter::new(Duration::from_secs(60))), json!({}));

    wait_until(|| queue.status(&first).map(|r| r.status) == Some(JobStatus::Running)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.status(&second).map(|r| r.status), Some(JobStatus::Queued));

    runs.stop("conv-1", "user");
    assert_eq!(queue.wait(&first).await.map(|r| r.status), Some(JobStatus::Cancelled));
    assert_eq!(queue.wait(&second).await.map(|r| r.status), Some(JobStatus::Cancelled));
}

#[tokio::test]
async fn purge_drops_finished_jobs() {
    let runs = Arc::new(RunManager::new());
    let queue = Arc::new(AsyncJobQueue::new(runs, 4));
    let id = queue.enqueue("conv-1", Arc::new(Counter::new(Duration::from_millis(1))), json!({}));
    queue.wait(&id).await;

    assert_eq!(queue.purge_finished(Duration::from_secs(3600)), 0);
    assert_eq!(queue.tracked_runs(), 1, "run with a retained job keeps its limit");
    assert_eq!(queue.purge_finished(Duration::ZERO), 1);
    assert!(queue.status(&id).is_none());
    assert_eq!(queue.tracked_runs(), 0, "limit goes once the run has no jobs");
}

#[tokio::test]
async fn forgotten_runs_release_their_limit() {
    let runs = Arc::new(RunManager::new());
    let queue = Arc::new(AsyncJobQueue::new(runs, 4));
    for run_id in ["conv-1", "conv-2"] {
        let id = queue.enqueue(run_id, Arc::new(Counter::new(Duration::from_millis(1))), json!({}));
        queue.wait(&id).await;
    }
    assert_eq!(queue.tracked_runs(), 2);

    queue.forget_run("conv-1");
    queue.forget_run("never-seen");
    assert_eq!(queue.tracked_runs(), 1);
    assert_eq!(queue.jobs_for_run("conv-1").len(), 1, "job history is kept");
}

#[tokio::test]
async fn huge_plans_do_not_reserve_memory_up_front() {
    let tool = Counter::with_steps(usize::MAX, Duration::ZERO);
    let cancel = CancellationToken::new();
    let stopper = cancel.clone();

    let run = run_async_tool(&tool, &json!({}), &cancel, move |ev| {
        if ev.step == 3 {
            stopper.cancel();
        }
    })
    .await
    .unwrap();

    assert_eq!(run.status, AsyncRunStatus::Cancelled);
    assert_eq!(run.completed_steps, 3);
    assert_eq!(run.total_steps, usize::MAX);
    assert_eq!(tool.ran.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn periodic_roller_refuses_runaway_schedules() {
    let err = run_async_tool(
        &PeriodicDiceRoller,
        &json!({"intervalSeconds": 0.001, "durationMinutes": 1000000}),
        &CancellationToken::new(),
        |_| {},
    )
    .await
    .expect_err("a schedule of billions of rolls must be refused");
    assert!(err.to_string().contains("at most"), "got: {err}");
}
