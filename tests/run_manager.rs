//! Integration tests for the run manager: creation, the stop cascade,
//! child supervision, and cleanup isolation.

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use toolgate::run::RunManager;

fn sleeper(secs: u32) -> tokio::process::Child {
    tokio::process::Command::new("sleep")
        .arg(secs.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn sleep")
}

fn manager() -> RunManager {
    RunManager::with_grace(Duration::from_millis(500))
}

#[test]
fn create_is_idempotent() {
    let mgr = manager();
    let a = mgr.create("conv-1");
    let b = mgr.create("conv-1");
    assert!(Arc::ptr_eq(&a, &b), "create twice should return the same run");
    assert_eq!(mgr.len(), 1);
}

#[test]
fn stop_unknown_run_succeeds() {
    let mgr = manager();
    let out = mgr.stop("never-created", "user");
    assert!(out.ok);
    assert!(out.already, "nothing to cancel for an unknown run");
    assert!(!mgr.is_cancelled("never-created"));
}

#[test]
fn stop_twice_runs_cascade_once() {
    let mgr = manager();
    mgr.create("r");
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    mgr.register_cleanup("r", move || {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let first = mgr.stop("r", "user");
    let second = mgr.stop("r", "user");

    assert!(!first.already);
    assert!(second.already);
    assert_eq!(hits.load(Ordering::SeqCst), 1, "cleanup must run exactly once");
    assert!(mgr.is_cancelled("r"));
    assert_eq!(mgr.get("r").unwrap().reason().as_deref(), Some("user"));
}

#[test]
fn concurrent_stops_run_cascade_once() {
    let mgr = manager();
    mgr.create("r");
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    mgr.register_cleanup("r", move || {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let barrier = std::sync::Barrier::new(16);
    let outcomes: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let (mgr, barrier) = (&mgr, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    mgr.stop("r", &format!("caller-{i}"))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(outcomes.iter().all(|o| o.ok));
    assert_eq!(outcomes.iter().filter(|o| !o.already).count(), 1, "one caller wins");
    assert_eq!(hits.load(Ordering::SeqCst), 1, "cleanup must run exactly once");
    assert!(mgr.is_cancelled("r"));
}

#[test]
fn failing_cleanups_do_not_block_later_ones() {
    let mgr = manager();
    mgr.create("r");
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    mgr.register_cleanup("r", move || {
        o.lock().unwrap().push("first");
        anyhow::bail!("first cleanup failed")
    });
    mgr.register_cleanup("r", || panic!("second cleanup panicked"));
    let o = order.clone();
    mgr.register_cleanup("r", move || {
        o.lock().unwrap().push("third");
        Ok(())
    });

    mgr.stop("r", "user");
    assert_eq!(*order.lock().unwrap(), vec!["first", "third"]);
}

#[tokio::test]
async fn stop_cancels_the_engine_token() {
    let mgr = manager();
    let run = mgr.create("r");
    let token = run.token();

    let stream = {
        let run = run.clone();
        tokio::spawn(async move { run.until_cancelled(std::future::pending::<()>()).await })
    };

    mgr.stop("r", "user");
    assert!(token.is_cancelled());
    let out = tokio::time::timeout(Duration::from_secs(2), stream)
        .await
        .expect("stream should observe the abort")
        .unwrap();
    assert!(out.is_none(), "cancellation should win over the pending stream");
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_terminates_tracked_children() {
    let mgr = manager();
    mgr.create("r");
    let mut watch = mgr.register_child("r", sleeper(30));
    assert!(watch.is_tracked());
    assert_eq!(mgr.get("r").unwrap().child_count(), 1);

    mgr.stop("r", "user");

    let status = tokio::time::timeout(Duration::from_secs(5), watch.wait())
        .await
        .expect("child should be terminated promptly");
    assert!(!status.map(|s| s.success()).unwrap_or(false));
    assert_eq!(mgr.get("r").unwrap().child_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn register_after_stop_terminates_immediately() {
    let mgr = manager();
    mgr.create("r");
    mgr.stop("r", "user");

    let mut watch = mgr.register_child("r", sleeper(30));
    assert!(!watch.is_tracked(), "late child must not be tracked");

    let status = tokio::time::timeout(Duration::from_secs(5), watch.wait())
        .await
        .expect("late child should be terminated right away");
    assert!(!status.map(|s| s.success()).unwrap_or(false));
}

#[tokio::test(flavor = "multi_thread")]
async fn exited_children_leave_the_set() {
    let mgr = manager();
    let run = mgr.create("r");
    let child = tokio::process::Command::new("true")
        .spawn()
        .expect("failed to spawn true");

    let mut watch = mgr.register_child("r", child);
    let status = watch.wait().await;
    assert!(status.map(|s| s.success()).unwrap_or(false));
    assert_eq!(run.child_count(), 0, "exited child should be removed");

    // A second wait returns the cached status.
    assert_eq!(watch.wait().await, status);
}

#[tokio::test]
async fn clear_removes_the_run() {
    let mgr = manager();
    let run = mgr.create("r");
    mgr.stop("r", "user");
    assert!(mgr.is_cancelled("r"));

    mgr.clear("r");
    assert!(mgr.get("r").is_none());
    assert!(!mgr.is_cancelled("r"));
    assert!(run.is_cancelled(), "handles held elsewhere stay cancelled");

    let fresh = mgr.create("r");
    assert!(!fresh.is_cancelled(), "re-created run starts clean");
}

#[tokio::test]
async fn clear_cancels_a_live_run() {
    let mgr = manager();
    let run = mgr.create("r");
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    mgr.register_cleanup("r", move || {
        h.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    mgr.clear("r");
    assert!(run.token().is_cancelled());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(mgr.is_empty());
}
