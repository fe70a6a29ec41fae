//! Per-run cancellation authority.
//!
//! A [`Run`] is the cancellable unit of work for one conversation or
//! workflow execution. It owns a [`CancellationToken`] (handed to the
//! reasoning-engine stream and async tools), the external processes spawned
//! on its behalf, and an ordered list of cleanup callbacks.
//!
//! [`RunManager::stop`] is the only place where the cancellation cascade
//! happens, and it happens at most once per run.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback executed once when its run is stopped.
pub type CleanupFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// Result of [`RunManager::stop`]. `ok` is always `true`; `already` is set
/// when the call found nothing to cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StopOutcome {
    pub ok: bool,
    pub already: bool,
}

impl StopOutcome {
    fn already() -> Self {
        Self { ok: true, already: true }
    }

    fn stopped() -> Self {
        Self { ok: true, already: false }
    }
}

// ── Run ──────────────────────────────────────────────────────

struct ChildSlot {
    pid: Option<u32>,
    kill: CancellationToken,
}

#[derive(Default)]
struct RunState {
    cancelled: bool,
    reason: Option<String>,
    children: HashMap<u64, ChildSlot>,
    cleanups: Vec<CleanupFn>,
}

/// A tracked unit of work.
pub struct Run {
    id: String,
    token: CancellationToken,
    grace: Duration,
    next_child: AtomicU64,
    state: Mutex<RunState>,
}

impl Run {
    fn new(id: &str, grace: Duration) -> Self {
        Self {
            id: id.to_string(),
            token: CancellationToken::new(),
            grace,
            next_child: AtomicU64::new(1),
            state: Mutex::new(RunState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token signalled when the run is stopped. Clones share state.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    /// Number of live tracked children.
    pub fn child_count(&self) -> usize {
        self.lock().children.len()
    }

    /// Pids of live tracked children.
    pub fn child_pids(&self) -> Vec<u32> {
        self.lock().children.values().filter_map(|c| c.pid).collect()
    }

    pub fn cleanup_count(&self) -> usize {
        self.lock().cleanups.len()
    }

    /// Drive `fut` until it finishes or the run is cancelled.
    ///
    /// Returns `None` when cancellation won. This is how an engine stream
    /// observes the abort signal.
    pub async fn until_cancelled<F: std::future::Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            out = fut => Some(out),
        }
    }

    fn forget_child(&self, key: u64) {
        // No-op when stop() already drained the set.
        self.lock().children.remove(&key);
    }

    /// First not-cancelled to cancelled transition runs the cascade.
    fn cancel(&self, reason: &str) -> StopOutcome {
        let (children, cleanups) = {
            let mut st = self.lock();
            if st.cancelled {
                return StopOutcome::already();
            }
            st.cancelled = true;
            st.reason = Some(reason.to_string());
            let children: Vec<ChildSlot> = st.children.drain().map(|(_, c)| c).collect();
            (children, std::mem::take(&mut st.cleanups))
        };

        self.token.cancel();

        let child_count = children.len();
        for child in children {
            debug!(run_id = %self.id, pid = ?child.pid, "terminating child");
            child.kill.cancel();
        }

        let cleanup_count = cleanups.len();
        for (idx, cleanup) in cleanups.into_iter().enumerate() {
            run_cleanup(&self.id, idx, cleanup);
        }

        info!(
            run_id = %self.id,
            reason = %reason,
            children = child_count,
            cleanups = cleanup_count,
            "run stopped"
        );
        StopOutcome::stopped()
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("cancelled", &st.cancelled)
            .field("reason", &st.reason)
            .field("children", &st.children.len())
            .field("cleanups", &st.cleanups.len())
            .finish()
    }
}

fn run_cleanup(run_id: &str, idx: usize, cleanup: CleanupFn) {
    match std::panic::catch_unwind(AssertUnwindSafe(cleanup)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(run_id = %run_id, index = idx, error = %e, "cleanup failed"),
        Err(_) => warn!(run_id = %run_id, index = idx, "cleanup panicked"),
    }
}

// ── Child supervision ────────────────────────────────────────

/// Handle returned by [`RunManager::register_child`].
///
/// The run owns the process; the caller keeps any pipes it took beforehand
/// and awaits [`ChildWatch::wait`] for the exit status.
#[derive(Debug)]
pub struct ChildWatch {
    pid: Option<u32>,
    tracked: bool,
    kill: CancellationToken,
    done: oneshot::Receiver<Option<ExitStatus>>,
    exited: Option<Option<ExitStatus>>,
}

impl ChildWatch {
    fn new(
        pid: Option<u32>,
        tracked: bool,
        kill: CancellationToken,
        done: oneshot::Receiver<Option<ExitStatus>>,
    ) -> Self {
        Self { pid, tracked, kill, done, exited: None }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// `false` when the run was already cancelled (the child is being
    /// terminated) or unknown.
    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    /// Terminate this child only, gracefully then forcefully.
    pub fn terminate(&self) {
        self.kill.cancel();
    }

    /// Wait for the process to exit, naturally or by termination.
    /// Safe to call again after the first call returned.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exited {
            return status;
        }
        let status = (&mut self.done).await.ok().flatten();
        self.exited = Some(status);
        status
    }
}

async fn supervise(
    mut child: Child,
    kill: CancellationToken,
    grace: Duration,
    on_exit: impl FnOnce() + Send,
    done: oneshot::Sender<Option<ExitStatus>>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status.ok()),
        _ = kill.cancelled() => None,
    };
    let status = match exited {
        Some(status) => status,
        None => terminate(&mut child, grace).await,
    };
    on_exit();
    let _ = done.send(status);
}

/// Signal the process group led by `pid`. Returns `false` when no such
/// group exists.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    // SAFETY: a negative pid addresses a process group; a group id cannot
    // be reused while any member is alive.
    unsafe { libc::kill(-(pid as libc::pid_t), signal) == 0 }
}

/// SIGTERM to the child's process group, wait out the grace period, then
/// SIGKILL. Grandchildren share the group, so they go down with the child
/// and release any pipes they inherited.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();
    if let Ok(Some(status)) = child.try_wait() {
        #[cfg(unix)]
        if let Some(pid) = pid {
            signal_group(pid, libc::SIGKILL);
        }
        return Some(status);
    }

    #[cfg(unix)]
    if let Some(pid) = pid {
        if !signal_group(pid, libc::SIGTERM) {
            // SAFETY: pid belongs to a child we still own and have not reaped.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    let status = match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => {
            debug!(pid = ?pid, "child ignored SIGTERM, killing");
            let _ = child.kill().await;
            child.wait().await.ok()
        }
    };

    // Sweep group members that outlived the leader.
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
    status
}

// ── RunManager ───────────────────────────────────────────────

/// Table of runs keyed by caller-supplied id.
pub struct RunManager {
    runs: Mutex<HashMap<String, Arc<Run>>>,
    grace: Duration,
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RunManager {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    /// Use a custom SIGTERM to SIGKILL grace period.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            grace,
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Run>>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the run for `id`, creating it if needed.
    pub fn create(&self, id: &str) -> Arc<Run> {
        let mut runs = self.table();
        if let Some(run) = runs.get(id) {
            return run.clone();
        }
        let run = Arc::new(Run::new(id, self.grace));
        runs.insert(id.to_string(), run.clone());
        debug!(run_id = %id, "run created");
        run
    }

    pub fn get(&self, id: &str) -> Option<Arc<Run>> {
        self.table().get(id).cloned()
    }

    pub fn is_cancelled(&self, id: &str) -> bool {
        self.get(id).map(|r| r.is_cancelled()).unwrap_or(false)
    }

    /// Number of runs currently tracked.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand a spawned process to the run.
    ///
    /// The child is removed from the run's set when it exits on its own.
    /// If the run is already cancelled it is terminated right away instead
    /// of being tracked. Unknown runs leave the child unsupervised but
    /// still awaitable. Must be called inside a tokio runtime.
    pub fn register_child(&self, id: &str, child: Child) -> ChildWatch {
        let pid = child.id();
        let Some(run) = self.get(id) else {
            debug!(run_id = %id, pid = ?pid, "register_child on unknown run");
            return self.watch_untracked(child);
        };

        let kill = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let key = run.next_child.fetch_add(1, Ordering::Relaxed);
        let tracked = {
            let mut st = run.lock();
            if st.cancelled {
                false
            } else {
                st.children.insert(key, ChildSlot { pid, kill: kill.clone() });
                true
            }
        };

        if !tracked {
            info!(run_id = %id, pid = ?pid, "run already cancelled, terminating child");
            kill.cancel();
        }

        let grace = run.grace;
        let owner = run.clone();
        tokio::spawn(supervise(
            child,
            kill.clone(),
            grace,
            move || owner.forget_child(key),
            done_tx,
        ));

        ChildWatch::new(pid, tracked, kill, done_rx)
    }

    /// Supervise a child that belongs to no run.
    pub fn watch_untracked(&self, child: Child) -> ChildWatch {
        let pid = child.id();
        let kill = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(supervise(child, kill.clone(), self.grace, || {}, done_tx));
        ChildWatch::new(pid, false, kill, done_rx)
    }

    /// Append a cleanup callback.
    ///
    /// Returns `false` if the run is unknown. When the run is already
    /// cancelled the callback runs immediately so it still runs exactly once.
    pub fn register_cleanup<F>(&self, id: &str, cleanup: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let Some(run) = self.get(id) else {
            return false;
        };
        let mut st = run.lock();
        if st.cancelled {
            drop(st);
            run_cleanup(id, 0, Box::new(cleanup));
        } else {
            st.cleanups.push(Box::new(cleanup));
        }
        true
    }

    /// Cancel the run and cascade to its token, children and cleanups.
    ///
    /// Unknown or already-cancelled runs report `already: true`.
    pub fn stop(&self, id: &str, reason: &str) -> StopOutcome {
        match self.get(id) {
            Some(run) => run.cancel(reason),
            None => StopOutcome::already(),
        }
    }

    /// Stop the run (best effort) and drop it from the table.
    pub fn clear(&self, id: &str) {
        let removed = self.table().remove(id);
        if let Some(run) = removed {
            run.cancel("cleared");
            debug!(run_id = %id, "run cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn cleanups_run_in_registration_order() {
        let mgr = RunManager::new();
        mgr.create("r");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            mgr.register_cleanup("r", move || {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }
        mgr.stop("r", "test");
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn late_cleanup_runs_immediately_once() {
        let mgr = RunManager::new();
        mgr.create("r");
        mgr.stop("r", "test");

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        assert!(mgr.register_cleanup("r", move || {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        mgr.stop("r", "again");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_on_unknown_run_is_rejected() {
        let mgr = RunManager::new();
        assert!(!mgr.register_cleanup("missing", || Ok(())));
    }
}
