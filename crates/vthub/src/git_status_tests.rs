// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;

use super::*;
use crate::monitor::Notification;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

struct CountingProbe {
    calls: AtomicUsize,
}

impl GitStatusProbe for CountingProbe {
    fn probe<'a>(&'a self, _working_dir: &'a str) -> BoxFuture<'a, Option<serde_json::Value>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { Some(json!({ "branch": "main", "call": n })) })
    }
}

#[tokio::test]
async fn filesystem_change_triggers_a_probe_and_publishes_git_status() {
    let dir = tempdir().expect("tempdir");
    let probe = Arc::new(CountingProbe { calls: AtomicUsize::new(0) });
    let monitor = Arc::new(SessionMonitor::new());
    let mut events = monitor.subscribe();

    let watcher = GitStatusWatcher::new("s1", dir.path(), probe.clone(), Arc::clone(&monitor));
    let shutdown = CancellationToken::new();
    let watcher_shutdown = shutdown.clone();
    let handle = tokio::spawn(watcher.run(watcher_shutdown));

    // give the watcher's notify setup a moment to register before writing.
    tokio::time::sleep(Duration::from_millis(100)).await;
    std::fs::write(dir.path().join("touched.txt"), b"hello").expect("write");

    let notification = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("notification timeout")
        .expect("channel open");
    match notification {
        Notification::GitStatus { session_id, status, .. } => {
            assert_eq!(session_id, "s1");
            assert_eq!(status["branch"], "main");
        }
        other => panic!("unexpected notification: {other:?}"),
    }

    shutdown.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn burst_of_changes_coalesces_into_a_single_probe() {
    let dir = tempdir().expect("tempdir");
    let probe = Arc::new(CountingProbe { calls: AtomicUsize::new(0) });
    let monitor = Arc::new(SessionMonitor::new());
    let mut events = monitor.subscribe();

    let watcher = GitStatusWatcher::new("s1", dir.path(), probe.clone(), Arc::clone(&monitor));
    let shutdown = CancellationToken::new();
    let watcher_shutdown = shutdown.clone();
    let handle = tokio::spawn(watcher.run(watcher_shutdown));

    tokio::time::sleep(Duration::from_millis(100)).await;
    for i in 0..5 {
        std::fs::write(dir.path().join(format!("file{i}.txt")), b"x").expect("write");
    }

    let _ = tokio::time::timeout(Duration::from_secs(3), events.recv()).await.expect("notification timeout");

    // allow any further coalesced probes to settle, then ensure no unexpected
    // flood of additional probes occurred for the single debounced burst.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(probe.calls.load(Ordering::SeqCst) <= 2, "burst should coalesce to roughly one probe");

    shutdown.cancel();
    let _ = handle.await;
}
